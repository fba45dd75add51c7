//! The optimization loop that owns the canvas and drives it towards the
//! content and style targets.

use crate::{
    errors::SizeMismatch,
    loss::{LossBreakdown, LossNetwork, LossWeights},
    network::FeatureExtractor,
    normalize::Normalization,
    optim::{Objective, Optimizer, OptimizerKind},
    tensor::{clamp_slice, Shape, Tensor},
    Error,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

/// How the canvas is initialized before the first step
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Init {
    /// Start from a copy of the content image
    Content,
    /// Start from seeded uniform noise in `[0,1)`
    Noise { seed: u64 },
}

impl Default for Init {
    fn default() -> Self {
        Init::Content
    }
}

impl Init {
    /// Creates a canvas with the shape of `content`
    pub fn canvas(&self, content: &Tensor) -> Tensor {
        match *self {
            Init::Content => content.clone(),
            Init::Noise { seed } => {
                let mut rng = Pcg32::seed_from_u64(seed);
                let mut canvas = Tensor::zeros(content.shape());
                for v in canvas.as_mut_slice() {
                    *v = rng.gen::<f32>();
                }
                canvas
            }
        }
    }
}

/// Information sent to a [`TransferProgress`] after every step
pub struct ProgressUpdate<'a> {
    /// Number of completed steps, starting at 1
    pub step: u32,
    pub total: u32,
    /// The losses at the start of the step
    pub losses: LossBreakdown,
    /// The canvas after the step, every value in `[0,1]`
    pub canvas: &'a Tensor,
}

/// Receives updates while a transfer is running
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<F> TransferProgress for F
where
    F: FnMut(ProgressUpdate<'_>),
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info);
    }
}

/// The phase a [`StyleTransfer`] is in
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// No step has been taken, the canvas still holds its initial value
    Initialized,
    /// At least one step has been taken and the budget isn't used up
    Running,
    /// Every step has been taken, the canvas is final
    Exhausted,
}

/// Adapts the loss network to the flat parameter view of an optimizer.
///
/// Every evaluation clamps the candidate pixels into `[0,1]` first, the
/// optimizer then continues from the clamped point.
struct CanvasObjective<'n, 'a> {
    network: &'n LossNetwork<'a>,
    image: Tensor,
    grad: Tensor,
    first: Option<LossBreakdown>,
}

impl<'n, 'a> Objective for CanvasObjective<'n, 'a> {
    fn evaluate(&mut self, x: &mut [f32], grad: &mut [f32]) -> f32 {
        clamp_slice(x, 0.0, 1.0);
        self.image.as_mut_slice().copy_from_slice(x);
        self.grad.fill(0.0);

        let losses = self.network.evaluate_unchecked(&self.image, &mut self.grad);
        grad.copy_from_slice(self.grad.as_slice());

        if self.first.is_none() {
            self.first = Some(losses);
        }

        losses.total
    }
}

/// A single style transfer job.
///
/// The canvas is the only thing that changes, the network and its targets are
/// only read. Each call to [`StyleTransfer::step`] counts as one step of the
/// budget, no matter how many times the optimizer evaluates the loss.
pub struct StyleTransfer<'a> {
    network: LossNetwork<'a>,
    canvas: Tensor,
    optimizer: Box<dyn Optimizer>,
    steps: u32,
    completed: u32,
    warned_non_finite: bool,
}

impl<'a> StyleTransfer<'a> {
    /// Prepares a job that will take exactly `steps` optimizer steps
    pub fn new(
        network: LossNetwork<'a>,
        canvas: Tensor,
        steps: u32,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<Self, Error> {
        if steps == 0 {
            return Err(Error::InvalidStepCount(0));
        }

        check_canvas(network.input_shape(), canvas.shape())?;

        Ok(Self {
            network,
            canvas,
            optimizer,
            steps,
            completed: 0,
            warned_non_finite: false,
        })
    }

    pub fn state(&self) -> TransferState {
        if self.completed == 0 {
            TransferState::Initialized
        } else if self.completed < self.steps {
            TransferState::Running
        } else {
            TransferState::Exhausted
        }
    }

    /// The step budget
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Number of steps taken so far
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// The current canvas
    pub fn canvas(&self) -> &Tensor {
        &self.canvas
    }

    pub fn network(&self) -> &LossNetwork<'a> {
        &self.network
    }

    /// Takes one optimizer step and returns the losses the step started
    /// from, or `None` once the budget is used up.
    pub fn step(&mut self) -> Option<LossBreakdown> {
        if self.completed >= self.steps {
            return None;
        }

        let shape = self.canvas.shape();
        let mut objective = CanvasObjective {
            network: &self.network,
            image: Tensor::zeros(shape),
            grad: Tensor::zeros(shape),
            first: None,
        };

        let total = self
            .optimizer
            .step(self.canvas.as_mut_slice(), &mut objective);
        // first order optimizers move the canvas without re-evaluating, so
        // their update may have left the valid range
        self.canvas.clamp(0.0, 1.0);
        let losses = objective.first.unwrap_or(LossBreakdown {
            total,
            ..LossBreakdown::default()
        });

        self.completed += 1;

        if !losses.total.is_finite() && !self.warned_non_finite {
            log::warn!(
                "loss became non-finite at step {}, the output will likely be garbage",
                self.completed
            );
            self.warned_non_finite = true;
        }

        log::debug!(
            "step {}/{}: style {:.4} content {:.4} total {:.4}",
            self.completed,
            self.steps,
            losses.style,
            losses.content,
            losses.total
        );

        Some(losses)
    }

    /// Takes every remaining step and returns the final canvas
    pub fn finish(mut self) -> Tensor {
        while self.step().is_some() {}
        self.canvas
    }
}

fn check_canvas(expected: Shape, actual: Shape) -> Result<(), Error> {
    if expected != actual {
        return Err(Error::SizeMismatch(SizeMismatch {
            what: "canvas",
            expected: (expected.width as u32, expected.height as u32),
            actual: (actual.width as u32, actual.height as u32),
        }));
    }

    Ok(())
}

/// Converts a user supplied step count, which must be strictly positive
pub fn step_count(value: i64) -> Result<u32, Error> {
    if value <= 0 || value > i64::from(u32::MAX) {
        return Err(Error::InvalidStepCount(value));
    }

    Ok(value as u32)
}

/// Options for [`run_style_transfer_with`]
#[derive(Clone, Debug, Default)]
pub struct TransferOptions {
    pub weights: LossWeights,
    pub optimizer: OptimizerKind,
}

/// The result of [`run_style_transfer_with`]
pub struct TransferOutput {
    /// The final canvas, every value in `[0,1]`
    pub image: Tensor,
    /// The losses of every step, in order
    pub history: Vec<LossBreakdown>,
}

/// Runs a complete style transfer with the default loss weights and L-BFGS.
///
/// `content`, `style` and `canvas` must all be RGB tensors of the same size
/// with values in `[0,1]`. The returned tensor has the same shape.
pub fn run_style_transfer(
    network: &FeatureExtractor,
    norm_mean: [f32; 3],
    norm_std: [f32; 3],
    content: &Tensor,
    style: &Tensor,
    canvas: Tensor,
    step_count: u32,
) -> Result<Tensor, Error> {
    run_style_transfer_with(
        network,
        norm_mean,
        norm_std,
        content,
        style,
        canvas,
        step_count,
        &TransferOptions::default(),
        None,
    )
    .map(|output| output.image)
}

/// [`run_style_transfer`] with explicit options and an optional progress
/// callback. Every input is validated before the first step is taken.
#[allow(clippy::too_many_arguments)]
pub fn run_style_transfer_with(
    network: &FeatureExtractor,
    norm_mean: [f32; 3],
    norm_std: [f32; 3],
    content: &Tensor,
    style: &Tensor,
    canvas: Tensor,
    step_count: u32,
    options: &TransferOptions,
    mut progress: Option<&mut dyn TransferProgress>,
) -> Result<TransferOutput, Error> {
    if step_count == 0 {
        return Err(Error::InvalidStepCount(0));
    }

    let normalization = Normalization::new(norm_mean, norm_std)?;

    log::info!("building the style model");
    let loss_network = LossNetwork::new(network, normalization, content, style, options.weights)?;

    let mut transfer = StyleTransfer::new(
        loss_network,
        canvas,
        step_count,
        options.optimizer.build(),
    )?;

    log::info!("optimizing for {} steps", step_count);

    let mut history = Vec::with_capacity(step_count as usize);
    while let Some(losses) = transfer.step() {
        history.push(losses);

        if let Some(progress) = progress.as_mut() {
            progress.update(ProgressUpdate {
                step: transfer.completed(),
                total: step_count,
                losses,
                canvas: transfer.canvas(),
            });
        }
    }

    if let Some(last) = history.last() {
        log::info!(
            "finished: style loss {:.4} content loss {:.4}",
            last.style,
            last.content
        );
    }

    Ok(TransferOutput {
        image: transfer.finish(),
        history,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        network::{Block, LayerSelection, Pooling},
        optim::{LbfgsConfig, MomentumConfig},
        weights::RandomWeights,
        IMAGENET_MEAN, IMAGENET_STD,
    };

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::from_blocks(
            &[Block::Conv(4), Block::Conv(4), Block::Pool, Block::Conv(8)],
            &RandomWeights::new(1),
            &LayerSelection::new("conv_2", vec!["conv_1", "conv_3"]).unwrap(),
            Pooling::Max,
        )
        .unwrap()
        .with_max_threads(2)
    }

    fn images() -> (Tensor, Tensor) {
        let content = Tensor::solid(8, 8, [0.1, 0.2, 0.9]);
        let mut style = Tensor::solid(8, 8, [0.9, 0.1, 0.1]);
        for (i, v) in style.as_mut_slice().iter_mut().enumerate() {
            if i % 3 == 0 {
                *v = 0.5;
            }
        }
        (content, style)
    }

    fn network(extractor: &FeatureExtractor) -> LossNetwork<'_> {
        let (content, style) = images();
        LossNetwork::new(
            extractor,
            Normalization::imagenet(),
            &content,
            &style,
            LossWeights::default(),
        )
        .unwrap()
    }

    #[test]
    fn step_count_rejects_non_positive() {
        assert!(matches!(step_count(-1), Err(Error::InvalidStepCount(-1))));
        assert!(matches!(step_count(0), Err(Error::InvalidStepCount(0))));
        assert_eq!(step_count(300).unwrap(), 300);
    }

    #[test]
    fn state_machine_walks_through_phases() {
        let extractor = extractor();
        let (content, _) = images();
        let mut transfer = StyleTransfer::new(
            network(&extractor),
            content.clone(),
            2,
            OptimizerKind::default().build(),
        )
        .unwrap();

        assert_eq!(transfer.state(), TransferState::Initialized);
        assert_eq!(transfer.canvas(), &content);

        assert!(transfer.step().is_some());
        assert_eq!(transfer.state(), TransferState::Running);

        assert!(transfer.step().is_some());
        assert_eq!(transfer.state(), TransferState::Exhausted);

        assert!(transfer.step().is_none());
        assert_eq!(transfer.completed(), 2);
    }

    #[test]
    fn zero_steps_is_rejected() {
        let extractor = extractor();
        let (content, _) = images();
        assert!(matches!(
            StyleTransfer::new(
                network(&extractor),
                content,
                0,
                OptimizerKind::default().build()
            ),
            Err(Error::InvalidStepCount(0))
        ));
    }

    #[test]
    fn canvas_must_match_content() {
        let extractor = extractor();
        assert!(matches!(
            StyleTransfer::new(
                network(&extractor),
                Tensor::solid(8, 7, [0.5; 3]),
                1,
                OptimizerKind::default().build()
            ),
            Err(Error::SizeMismatch(_))
        ));
    }

    fn check_range_every_step(optimizer: OptimizerKind) {
        let extractor = extractor();
        let (content, style) = images();

        let options = TransferOptions {
            weights: LossWeights::default(),
            optimizer,
        };

        let mut seen = 0;
        let mut check = |update: ProgressUpdate<'_>| {
            seen += 1;
            assert_eq!(update.total, 3);
            assert!(
                update.canvas.as_slice().iter().all(|v| (0.0..=1.0).contains(v)),
                "canvas out of range after step {}",
                update.step
            );
        };

        let output = run_style_transfer_with(
            &extractor,
            IMAGENET_MEAN,
            IMAGENET_STD,
            &content,
            &style,
            content.clone(),
            3,
            &options,
            Some(&mut check),
        )
        .unwrap();

        assert_eq!(seen, 3);
        assert_eq!(output.history.len(), 3);
        assert!(output.image.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn canvas_stays_in_range_with_lbfgs() {
        check_range_every_step(OptimizerKind::Lbfgs(LbfgsConfig::default()));
    }

    #[test]
    fn canvas_stays_in_range_with_momentum() {
        // a huge learning rate overshoots far outside of [0,1]
        check_range_every_step(OptimizerKind::Momentum(MomentumConfig {
            lr: 1000.0,
            ..MomentumConfig::default()
        }));
    }

    #[test]
    fn single_step_of_many_is_clamped() {
        let extractor = extractor();
        let (content, _) = images();
        let mut transfer = StyleTransfer::new(
            network(&extractor),
            content,
            3,
            OptimizerKind::Momentum(MomentumConfig {
                lr: 1000.0,
                ..MomentumConfig::default()
            })
            .build(),
        )
        .unwrap();

        assert!(transfer.step().is_some());
        assert_eq!(transfer.state(), TransferState::Running);
        assert!(transfer
            .canvas()
            .as_slice()
            .iter()
            .all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn noise_init_is_seeded() {
        let (content, _) = images();
        let a = Init::Noise { seed: 3 }.canvas(&content);
        let b = Init::Noise { seed: 3 }.canvas(&content);
        let c = Init::Noise { seed: 4 }.canvas(&content);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.shape(), content.shape());
        assert!(a.as_slice().iter().all(|v| (0.0..1.0).contains(v)));
        assert_eq!(Init::Content.canvas(&content), content);
    }

    #[test]
    fn lbfgs_lowers_the_loss() {
        let extractor = extractor();
        let (content, style) = images();

        let options = TransferOptions {
            weights: LossWeights::default(),
            optimizer: OptimizerKind::Lbfgs(LbfgsConfig::default()),
        };

        let output = run_style_transfer_with(
            &extractor,
            IMAGENET_MEAN,
            IMAGENET_STD,
            &content,
            &style,
            content.clone(),
            10,
            &options,
            None,
        )
        .unwrap();

        let first = output.history[0].total;
        let last = output.history[9].total;
        assert!(last < first, "{} -> {}", first, last);
    }
}
