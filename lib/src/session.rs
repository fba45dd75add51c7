use crate::*;

/// The weights file used when none is specified
pub const DEFAULT_WEIGHTS_PATH: &str = "models/vgg19.safetensors";

/// Where the parameters of the feature network come from
pub enum WeightsSource<'a> {
    /// A safetensors file on disk
    Path(&'a Path),
    /// The contents of a safetensors file
    Memory(&'a [u8]),
    /// Untrained weights generated from a seed, mostly useful for testing
    Random(u64),
}

/// Style transfer session.
///
/// Calling `run()` optimizes the canvas and returns the result, consuming the
/// session in the process. You can provide a `TransferProgress`
/// implementation to get the losses and the current canvas after every step.
///
/// # Example
/// ```no_run
/// let session = neural_style::Session::builder()
///     .content(&"imgs/landscape.png")
///     .style(&"imgs/swirls.png")
///     .steps(300)
///     .build().expect("failed to build session");
///
/// let generated_img = session.run(None).expect("style transfer failed");
/// generated_img.save("out/landscape_swirls.jpg").expect("failed to save image");
/// ```
pub struct Session {
    extractor: FeatureExtractor,
    content: Tensor,
    style: Tensor,
    canvas: Tensor,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The content image, as it will be used by the optimization
    pub fn content(&self) -> &Tensor {
        &self.content
    }

    /// The style image, resized to the size of the content image
    pub fn style(&self) -> &Tensor {
        &self.style
    }

    /// The canvas before the first step
    pub fn canvas(&self) -> &Tensor {
        &self.canvas
    }

    /// Runs the optimization and outputs the stylized image.
    pub fn run(
        self,
        mut progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<GeneratedImage, Error> {
        let options = TransferOptions {
            weights: self.params.weights,
            optimizer: self.params.optimizer.clone(),
        };

        let output = run_style_transfer_with(
            &self.extractor,
            self.params.normalization.mean(),
            self.params.normalization.std(),
            &self.content,
            &self.style,
            self.canvas,
            self.params.steps,
            &options,
            progress
                .as_deref_mut()
                .map(|p| p as &mut dyn TransferProgress),
        )?;

        GeneratedImage::new(output.image, output.history)
    }
}

struct Parameters {
    image_size: u32,
    steps: u32,
    weights: LossWeights,
    layers: LayerSelection,
    pooling: Pooling,
    init: Init,
    optimizer: OptimizerKind,
    normalization: Normalization,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            image_size: 128,
            steps: 300,
            weights: LossWeights::default(),
            layers: LayerSelection::default(),
            pooling: Pooling::default(),
            init: Init::default(),
            optimizer: OptimizerKind::default(),
            normalization: Normalization::imagenet(),
            max_thread_count: None,
        }
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` loads the network weights and the images and checks everything
/// before any optimization happens
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    weights: Option<WeightsSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose spatial layout is preserved
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose texture is transferred. It is resized to the size of
    /// the content image.
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// Loads the VGG-19 weights from a safetensors file.
    ///
    /// Default: `models/vgg19.safetensors`
    pub fn weights<P: AsRef<Path> + ?Sized>(mut self, path: &'a P) -> Self {
        self.weights = Some(WeightsSource::Path(path.as_ref()));
        self
    }

    /// Uses the given weights source
    pub fn weights_source(mut self, source: WeightsSource<'a>) -> Self {
        self.weights = Some(source);
        self
    }

    /// The size of the smaller edge of the content image, the output image
    /// has the same size.
    ///
    /// Default: 128
    pub fn image_size(mut self, size: u32) -> Self {
        self.params.image_size = size;
        self
    }

    /// Number of optimizer steps, must be at least 1.
    ///
    /// Default: 300
    pub fn steps(mut self, count: u32) -> Self {
        self.params.steps = count;
        self
    }

    /// Weight of the content loss.
    ///
    /// Default: 1.0
    pub fn content_weight(mut self, value: f32) -> Self {
        self.params.weights.content = value;
        self
    }

    /// Weight of the style loss. The style errors are tiny because of the
    /// Gram normalization, so this is usually very large.
    ///
    /// Default: 1000000.0
    pub fn style_weight(mut self, value: f32) -> Self {
        self.params.weights.style = value;
        self
    }

    /// The layers the content and style losses are computed at.
    ///
    /// Default: content at `conv_4`, style at `conv_1` to `conv_5`
    pub fn layers(mut self, selection: LayerSelection) -> Self {
        self.params.layers = selection;
        self
    }

    /// Default: [`Pooling::Max`]
    pub fn pooling(mut self, pooling: Pooling) -> Self {
        self.params.pooling = pooling;
        self
    }

    /// How the canvas is initialized.
    ///
    /// Default: [`Init::Content`]
    pub fn init(mut self, init: Init) -> Self {
        self.params.init = init;
        self
    }

    /// Default: L-BFGS with a strong Wolfe line search
    pub fn optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.params.optimizer = optimizer;
        self
    }

    /// The normalization applied before the feature network.
    ///
    /// Default: [`Normalization::imagenet`]
    pub fn normalization(mut self, normalization: Normalization) -> Self {
        self.params.normalization = normalization;
        self
    }

    /// Controls the maximum number of threads that will be spawned at any one
    /// time in parallel.
    ///
    /// The result doesn't depend on this number, every value is computed by
    /// exactly one thread in the same order.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters, input
    /// images or weights were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;
        self.check_images_validity()?;

        let params = self.params;

        let weights: Box<dyn WeightSource> = match self.weights {
            Some(WeightsSource::Path(path)) => Box::new(SafeTensorsWeights::open(path)?),
            Some(WeightsSource::Memory(bytes)) => {
                Box::new(SafeTensorsWeights::from_bytes(bytes.to_vec())?)
            }
            Some(WeightsSource::Random(seed)) => Box::new(RandomWeights::new(seed)),
            None => Box::new(SafeTensorsWeights::open(DEFAULT_WEIGHTS_PATH)?),
        };

        let extractor = FeatureExtractor::vgg19(&*weights, &params.layers, params.pooling)?
            .with_max_threads(params.max_thread_count.unwrap_or_else(num_cpus::get));
        drop(weights);

        let (content, style) = match (self.content, self.style) {
            (Some(content), Some(style)) => (content, style),
            (None, _) => return Err(Error::MissingImage("content")),
            (_, None) => return Err(Error::MissingImage("style")),
        };

        let content = utils::load_content(content, params.image_size)?;
        let (width, height) = content.dimensions();
        let style = utils::load_image(style, Some(Dims::new(width, height)))?;

        let content = image_to_tensor(&content);
        let style = image_to_tensor(&style);

        // fail here rather than on the first step if the image is too small
        // for the selected layers
        extractor.output_shapes(content.shape())?;

        log::info!(
            "content and style loaded at {}x{}, network has {} layers",
            width,
            height,
            extractor.layer_names().len()
        );

        let canvas = params.init.canvas(&content);

        Ok(Session {
            extractor,
            content,
            style,
            canvas,
            params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.steps == 0 {
            return Err(Error::InvalidStepCount(0));
        }

        if self.params.image_size == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "image-size",
            }));
        }

        self.params.weights.validate()?;

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        Ok(())
    }

    fn check_images_validity(&self) -> Result<(), Error> {
        if self.content.is_none() {
            return Err(Error::MissingImage("content"));
        }

        if self.style.is_none() {
            return Err(Error::MissingImage("style"));
        }

        Ok(())
    }
}
