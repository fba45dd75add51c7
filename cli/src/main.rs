mod paths;
mod progress;

use structopt::StructOpt;

use neural_style::{
    Error, Init, LbfgsConfig, MomentumConfig, OptimizerKind, Pooling, Session, TransferProgress,
};
use progress::ProgressDisplay;
use std::path::PathBuf;

fn parse_optimizer(input: &str) -> Result<OptimizerKind, String> {
    let kind = match input {
        "lbfgs" => OptimizerKind::Lbfgs(LbfgsConfig::default()),
        "momentum" => OptimizerKind::Momentum(MomentumConfig::default()),
        other => {
            return Err(format!(
                "optimizer `{}` not one of: 'lbfgs', 'momentum'",
                other
            ))
        }
    };

    Ok(kind)
}

fn parse_pooling(input: &str) -> Result<Pooling, String> {
    match input {
        "max" => Ok(Pooling::Max),
        "avg" => Ok(Pooling::Average),
        other => Err(format!("pooling `{}` not one of: 'max', 'avg'", other)),
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum InitKind {
    Content,
    Noise,
}

fn parse_init(input: &str) -> Result<InitKind, String> {
    match input {
        "content" => Ok(InitKind::Content),
        "noise" => Ok(InitKind::Noise),
        other => Err(format!("init `{}` not one of: 'content', 'noise'", other)),
    }
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Repaints a content image in the style of another image",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The content image. If the path doesn't exist it is looked up in the
    /// `input` directory.
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The style image, either the name of a preset in the `styles` directory,
    /// eg. `picasso` for `styles/picasso.jpg`, or a path. Presets are checked
    /// first.
    #[structopt(long)]
    style: String,
    /// The path to save the generated image to, the file extension determines
    /// the image format. Defaults to `output/<content>_<style>.jpg`
    #[structopt(long = "output", short, parse(from_os_str))]
    output_path: Option<PathBuf>,
    /// The number of optimizer steps
    #[structopt(long, default_value = "300", allow_hyphen_values = true)]
    steps: i64,
    /// The size of the smaller edge of the generated image
    #[structopt(long, default_value = "128")]
    imsize: u32,
    /// A safetensors file with torchvision's VGG-19 weights
    #[structopt(
        long,
        default_value = "models/vgg19.safetensors",
        parse(from_os_str)
    )]
    weights: PathBuf,
    /// How much the generated image is pulled towards the content image
    #[structopt(long, default_value = "1")]
    content_weight: f32,
    /// How much the generated image is pulled towards the style image
    #[structopt(long, default_value = "1000000")]
    style_weight: f32,
    /// The optimizer, 'lbfgs' or 'momentum'. Momentum needs many more steps.
    #[structopt(long, default_value = "lbfgs", parse(try_from_str = parse_optimizer))]
    optimizer: OptimizerKind,
    /// The pooling used by the network, 'max' or 'avg'
    #[structopt(long, default_value = "max", parse(try_from_str = parse_pooling))]
    pooling: Pooling,
    /// What the generated image starts from, 'content' or 'noise'
    #[structopt(long, default_value = "content", parse(try_from_str = parse_init))]
    init: InitKind,
    /// The seed of the noise used by `--init noise`
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// The maximum number of worker threads that can be active at any one time.
    /// Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// Don't show the progress bar
    #[structopt(long)]
    no_progress: bool,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    let steps = neural_style::step_count(args.steps)?;

    let resolver = paths::Resolver::new("");
    let content = resolver.content(&args.content);
    let style = resolver.style(&args.style);

    // Fail before the weights are read, which takes a while
    paths::check_image_exists("content", &content)?;
    paths::check_image_exists("style", &style)?;

    let output_path = match args.output_path {
        Some(path) => path,
        None => resolver.default_output(&content, &style),
    };

    // Check the output before spending minutes on the optimization
    paths::check_output_format(&output_path)?;

    log::info!(
        "{} in the style of {} -> {}",
        content.display(),
        style.display(),
        output_path.display()
    );

    let init = match args.init {
        InitKind::Content => Init::Content,
        InitKind::Noise => Init::Noise { seed: args.seed },
    };

    let mut sb = Session::builder()
        .content(&content)
        .style(&style)
        .weights(&args.weights)
        .image_size(args.imsize)
        .steps(steps)
        .content_weight(args.content_weight)
        .style_weight(args.style_weight)
        .optimizer(args.optimizer)
        .pooling(args.pooling)
        .init(init);

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    let session = sb.build()?;

    let progress: Option<Box<dyn TransferProgress>> = if !args.no_progress {
        Some(Box::new(ProgressDisplay::new()))
    } else {
        None
    };

    let generated = session.run(progress)?;

    if let Some(last) = generated.history().last() {
        log::info!(
            "style loss {:.4}, content loss {:.4}",
            last.style,
            last.content
        );
    }

    generated.save(&output_path)?;
    log::info!("saved {}", output_path.display());

    Ok(())
}
