//! Content and style loss probes attached to the feature network, and the
//! target capture that seeds them.

use crate::{
    errors::{InvalidRange, SizeMismatch},
    network::FeatureExtractor,
    normalize::Normalization,
    ops::{self, Gram},
    tensor::{Shape, Tensor},
    Error,
};

/// Relative weighting of the content and style terms in the total loss
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub content: f32,
    pub style: f32,
}

impl Default for LossWeights {
    /// Style errors are orders of magnitude smaller than the content error
    /// because of the Gram normalization, hence the large style weight.
    fn default() -> Self {
        Self {
            content: 1.0,
            style: 1_000_000.0,
        }
    }
}

impl LossWeights {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        for &(value, name) in [(self.content, "content-weight"), (self.style, "style-weight")].iter() {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 0.0,
                    max: f32::MAX,
                    value,
                    name,
                }));
            }
        }
        Ok(())
    }
}

/// The loss of one evaluation, split into its weighted parts
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LossBreakdown {
    /// `content_weight * content_error`
    pub content: f32,
    /// `style_weight * sum(style_errors)`
    pub style: f32,
    pub total: f32,
}

struct ContentProbe {
    layer: usize,
    target: Tensor,
}

struct StyleProbe {
    layer: usize,
    target: Gram,
}

/// The feature network with frozen content and style targets attached.
///
/// Created once per job from the content and style images, read-only
/// afterwards.
pub struct LossNetwork<'a> {
    extractor: &'a FeatureExtractor,
    normalization: Normalization,
    weights: LossWeights,
    input_shape: Shape,
    content: ContentProbe,
    style: Vec<StyleProbe>,
}

impl<'a> LossNetwork<'a> {
    /// Captures the content target from `content` and the style targets from
    /// `style`. Both images must already have the same size.
    pub fn new(
        extractor: &'a FeatureExtractor,
        normalization: Normalization,
        content: &Tensor,
        style: &Tensor,
        weights: LossWeights,
    ) -> Result<Self, Error> {
        weights.validate()?;

        let input_shape = content.shape();
        check_same_size("style", input_shape, style.shape())?;
        extractor.output_shapes(input_shape)?;

        let threads = extractor.max_threads();

        let content_trace = extractor.trace(normalization.forward(content)?);
        let content_probe = ContentProbe {
            layer: extractor.content_index(),
            target: content_trace[extractor.content_index() + 1].clone(),
        };
        drop(content_trace);

        let style_trace = extractor.trace(normalization.forward(style)?);
        let style_probes = extractor
            .style_indices()
            .iter()
            .map(|&layer| StyleProbe {
                layer,
                target: ops::gram_matrix(&style_trace[layer + 1], threads),
            })
            .collect();

        log::debug!(
            "captured targets: content at '{}', style at {:?}",
            extractor.name(content_probe.layer),
            extractor
                .style_indices()
                .iter()
                .map(|&i| extractor.name(i))
                .collect::<Vec<_>>()
        );

        Ok(Self {
            extractor,
            normalization,
            weights,
            input_shape,
            content: content_probe,
            style: style_probes,
        })
    }

    /// The shape every evaluated image must have
    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn weights(&self) -> LossWeights {
        self.weights
    }

    pub fn extractor(&self) -> &'a FeatureExtractor {
        self.extractor
    }

    /// The frozen content target
    pub fn content_target(&self) -> &Tensor {
        &self.content.target
    }

    /// The frozen style targets, in the order of the selected style layers
    pub fn style_targets(&self) -> impl Iterator<Item = &Gram> {
        self.style.iter().map(|p| &p.target)
    }

    /// Evaluates the losses of `image` and writes the gradient of the total
    /// loss with respect to its pixels into `grad`.
    ///
    /// `image` must have [`LossNetwork::input_shape`].
    pub fn evaluate(&self, image: &Tensor, grad: &mut Tensor) -> Result<LossBreakdown, Error> {
        check_same_size("canvas", self.input_shape, image.shape())?;
        let losses = self.evaluate_unchecked(image, grad);
        Ok(losses)
    }

    pub(crate) fn evaluate_unchecked(&self, image: &Tensor, grad: &mut Tensor) -> LossBreakdown {
        let threads = self.extractor.max_threads();

        let trace = self.extractor.trace(self.normalization.apply(image));
        let mut seeds: Vec<Option<Tensor>> = (0..trace.len() - 1).map(|_| None).collect();
        let mut add_seed = |layer: usize, seed: Tensor| {
            seeds[layer] = Some(match seeds[layer].take() {
                Some(mut existing) => {
                    existing.add_assign(&seed);
                    existing
                }
                None => seed,
            });
        };

        // content
        let live = &trace[self.content.layer + 1];
        let (content_error, content_grad) = ops::mse_with_grad(
            live.as_slice(),
            self.content.target.as_slice(),
            self.weights.content,
        );
        if let Some(seed) = Tensor::from_vec(live.shape(), content_grad) {
            add_seed(self.content.layer, seed);
        }

        // style
        let mut style_error = 0.0f32;
        for probe in &self.style {
            let live = &trace[probe.layer + 1];
            let g = ops::gram_matrix(live, threads);
            let (error, grad_gram) =
                ops::mse_with_grad(g.as_slice(), probe.target.as_slice(), self.weights.style);
            style_error += error;

            add_seed(probe.layer, ops::gram_backward(live, &grad_gram, threads));
        }

        let mut pixel_grad = self.extractor.backward(&trace, seeds);
        self.normalization.backward(&mut pixel_grad);
        *grad = pixel_grad;

        let content = self.weights.content * content_error;
        let style = self.weights.style * style_error;
        LossBreakdown {
            content,
            style,
            total: content + style,
        }
    }
}

fn check_same_size(what: &'static str, expected: Shape, actual: Shape) -> Result<(), Error> {
    if expected.height != actual.height || expected.width != actual.width {
        return Err(Error::SizeMismatch(SizeMismatch {
            what,
            expected: (expected.width as u32, expected.height as u32),
            actual: (actual.width as u32, actual.height as u32),
        }));
    }

    if actual.channels != 3 {
        return Err(Error::ChannelMismatch(actual.channels));
    }

    Ok(())
}
