//! The frozen feature extractor: the convolutional part of a VGG classifier
//! as a flat list of layers with a parallel list of names used to tap
//! activations.

use crate::{
    ops,
    tensor::{Shape, Tensor},
    weights::WeightSource,
    Error,
};

/// One stage of a VGG style network description
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Block {
    /// A 3x3 convolution with the given number of output channels, followed
    /// by a ReLU
    Conv(usize),
    /// A 2x2 pool with stride 2
    Pool,
}

use Block::{Conv, Pool};

/// torchvision's `vgg19().features` (configuration "E")
pub const VGG19_BLOCKS: &[Block] = &[
    Conv(64),
    Conv(64),
    Pool,
    Conv(128),
    Conv(128),
    Pool,
    Conv(256),
    Conv(256),
    Conv(256),
    Conv(256),
    Pool,
    Conv(512),
    Conv(512),
    Conv(512),
    Conv(512),
    Pool,
    Conv(512),
    Conv(512),
    Conv(512),
    Conv(512),
    Pool,
];

const KERNEL: usize = 3;

/// The pooling operation used by every pool layer of the network
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pooling {
    /// Max pooling, what the network was trained with
    Max,
    /// Average pooling, tends to give smoother results
    Average,
}

impl Default for Pooling {
    fn default() -> Self {
        Pooling::Max
    }
}

/// Which layers the content and style losses are attached to.
///
/// Layers are named the way they are counted in the network: the counter `i`
/// increases with every convolution, and the layers are named `conv_i`,
/// `relu_i` and `pool_i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerSelection {
    content: String,
    style: Vec<String>,
}

impl LayerSelection {
    /// Creates a selection with one content layer and one or more style layers
    pub fn new<C, S, I>(content: C, style: I) -> Result<Self, Error>
    where
        C: Into<String>,
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let style: Vec<String> = style.into_iter().map(Into::into).collect();
        if style.is_empty() {
            return Err(Error::NoStyleLayers);
        }

        Ok(Self {
            content: content.into(),
            style,
        })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn style(&self) -> &[String] {
        &self.style
    }
}

impl Default for LayerSelection {
    fn default() -> Self {
        Self {
            content: "conv_4".to_owned(),
            style: (1..=5).map(|i| format!("conv_{}", i)).collect(),
        }
    }
}

pub(crate) enum Layer {
    Conv {
        in_channels: usize,
        out_channels: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    },
    Relu,
    Pool(Pooling),
}

impl Layer {
    fn output_shape(&self, input: Shape) -> Shape {
        match self {
            Layer::Conv { out_channels, .. } => Shape::new(*out_channels, input.height, input.width),
            Layer::Relu => input,
            Layer::Pool(_) => ops::pooled_shape(input),
        }
    }

    fn forward(&self, input: &Tensor, max_threads: usize) -> Tensor {
        match self {
            Layer::Conv {
                out_channels,
                weight,
                bias,
                ..
            } => ops::conv2d(input, weight, bias, *out_channels, KERNEL, max_threads),
            Layer::Relu => ops::relu(input),
            Layer::Pool(Pooling::Max) => ops::max_pool2d(input),
            Layer::Pool(Pooling::Average) => ops::avg_pool2d(input),
        }
    }

    fn backward(&self, input: &Tensor, grad_out: &Tensor, max_threads: usize) -> Tensor {
        match self {
            Layer::Conv {
                in_channels,
                weight,
                ..
            } => ops::conv2d_backward(grad_out, weight, *in_channels, KERNEL, max_threads),
            Layer::Relu => ops::relu_backward(input, grad_out),
            Layer::Pool(Pooling::Max) => ops::max_pool2d_backward(input, grad_out),
            Layer::Pool(Pooling::Average) => ops::avg_pool2d_backward(input.shape(), grad_out),
        }
    }
}

enum Planned {
    Conv { out_channels: usize, torch_index: usize },
    Relu,
    Pool,
}

/// Expands a block list into named layers, without loading anything
fn plan(blocks: &[Block]) -> Vec<(String, Planned)> {
    let mut layers = Vec::with_capacity(blocks.len() * 2);
    let mut conv_count = 0;
    let mut torch_index = 0;

    for block in blocks {
        match block {
            Block::Conv(out_channels) => {
                conv_count += 1;
                layers.push((
                    format!("conv_{}", conv_count),
                    Planned::Conv {
                        out_channels: *out_channels,
                        torch_index,
                    },
                ));
                layers.push((format!("relu_{}", conv_count), Planned::Relu));
                torch_index += 2;
            }
            Block::Pool => {
                layers.push((format!("pool_{}", conv_count), Planned::Pool));
                torch_index += 1;
            }
        }
    }

    layers
}

/// Activations captured at the selected layers during a forward pass
pub struct Activations {
    pub content: Tensor,
    /// In the same order as [`LayerSelection::style`]
    pub style: Vec<Tensor>,
}

/// A pretrained convolutional network truncated after the deepest selected
/// layer. The weights are never modified.
pub struct FeatureExtractor {
    layers: Vec<Layer>,
    names: Vec<String>,
    content_index: usize,
    style_indices: Vec<usize>,
    max_threads: usize,
}

impl FeatureExtractor {
    /// Builds the VGG-19 feature network, loading only the layers up to the
    /// deepest one named in `selection`.
    pub fn vgg19(
        weights: &dyn WeightSource,
        selection: &LayerSelection,
        pooling: Pooling,
    ) -> Result<Self, Error> {
        Self::from_blocks(VGG19_BLOCKS, weights, selection, pooling)
    }

    /// Builds a network from an arbitrary VGG style block list. This is meant
    /// for compact networks in tests and benchmarks, the layer selection
    /// defaults only make sense for VGG-19.
    pub fn from_blocks(
        blocks: &[Block],
        weights: &dyn WeightSource,
        selection: &LayerSelection,
        pooling: Pooling,
    ) -> Result<Self, Error> {
        let planned = plan(blocks);

        let find = |name: &str| {
            planned
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| Error::UnknownLayer(name.to_owned()))
        };

        let content_index = find(selection.content())?;
        let style_indices = selection
            .style()
            .iter()
            .map(|name| find(name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let deepest = style_indices
            .iter()
            .copied()
            .fold(content_index, usize::max);

        let mut layers = Vec::with_capacity(deepest + 1);
        let mut names = Vec::with_capacity(deepest + 1);
        let mut in_channels = 3;

        for (name, planned) in planned.into_iter().take(deepest + 1) {
            let layer = match planned {
                Planned::Conv {
                    out_channels,
                    torch_index,
                } => {
                    let conv = weights.conv(torch_index, out_channels, in_channels, KERNEL)?;
                    let layer = Layer::Conv {
                        in_channels,
                        out_channels,
                        weight: conv.weight,
                        bias: conv.bias,
                    };
                    in_channels = out_channels;
                    layer
                }
                Planned::Relu => Layer::Relu,
                Planned::Pool => Layer::Pool(pooling),
            };

            layers.push(layer);
            names.push(name);
        }

        log::debug!(
            "feature network truncated after '{}' ({} layers)",
            names[deepest],
            layers.len()
        );

        Ok(Self {
            layers,
            names,
            content_index,
            style_indices,
            max_threads: num_cpus::get(),
        })
    }

    /// Limits the number of threads used by the convolutions. `0` is treated
    /// as `1`.
    pub fn with_max_threads(mut self, count: usize) -> Self {
        self.max_threads = count.max(1);
        self
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Names of the layers that were built, in evaluation order
    pub fn layer_names(&self) -> &[String] {
        &self.names
    }

    pub(crate) fn content_index(&self) -> usize {
        self.content_index
    }

    pub(crate) fn style_indices(&self) -> &[usize] {
        &self.style_indices
    }

    pub(crate) fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// The activation shape of every layer for an input of the given shape.
    ///
    /// Fails if the input isn't RGB or if any layer would end up with no
    /// spatial extent.
    pub fn output_shapes(&self, input: Shape) -> Result<Vec<Shape>, Error> {
        if input.channels != 3 {
            return Err(Error::ChannelMismatch(input.channels));
        }

        let mut shapes = Vec::with_capacity(self.layers.len());
        let mut shape = input;
        for (layer, name) in self.layers.iter().zip(self.names.iter()) {
            shape = layer.output_shape(shape);
            if shape.is_empty() {
                return Err(Error::EmptyFeatureMap(name.clone()));
            }
            shapes.push(shape);
        }

        Ok(shapes)
    }

    /// Runs an already normalized image through the network and returns the
    /// activations at the selected layers.
    pub fn forward(&self, input: &Tensor) -> Result<Activations, Error> {
        self.output_shapes(input.shape())?;
        let trace = self.trace(input.clone());

        Ok(Activations {
            content: trace[self.content_index + 1].clone(),
            style: self
                .style_indices
                .iter()
                .map(|i| trace[i + 1].clone())
                .collect(),
        })
    }

    /// Forward pass that keeps every intermediate tensor: `trace[0]` is the
    /// input and `trace[i + 1]` is the output of layer `i`.
    pub(crate) fn trace(&self, input: Tensor) -> Vec<Tensor> {
        let mut trace = Vec::with_capacity(self.layers.len() + 1);
        trace.push(input);

        for layer in &self.layers {
            let next = layer.forward(&trace[trace.len() - 1], self.max_threads);
            trace.push(next);
        }

        trace
    }

    /// Back-propagates gradients seeded at layer outputs down to the input.
    ///
    /// `seeds[i]` is the gradient of the loss with respect to the output of
    /// layer `i`, if that layer has a loss attached.
    pub(crate) fn backward(&self, trace: &[Tensor], mut seeds: Vec<Option<Tensor>>) -> Tensor {
        debug_assert_eq!(seeds.len(), self.layers.len());

        let mut grad: Option<Tensor> = None;
        for (i, layer) in self.layers.iter().enumerate().rev() {
            if let Some(seed) = seeds[i].take() {
                grad = Some(match grad {
                    Some(mut g) => {
                        g.add_assign(&seed);
                        g
                    }
                    None => seed,
                });
            }

            if let Some(g) = grad {
                grad = Some(layer.backward(&trace[i], &g, self.max_threads));
            }
        }

        grad.unwrap_or_else(|| Tensor::zeros(trace[0].shape()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::weights::RandomWeights;

    #[test]
    fn vgg19_names_match_torchvision_indices() {
        let planned = plan(VGG19_BLOCKS);
        assert_eq!(planned.len(), 37);

        let convs: Vec<(String, usize)> = planned
            .iter()
            .filter_map(|(name, p)| match p {
                Planned::Conv { torch_index, .. } => Some((name.clone(), *torch_index)),
                _ => None,
            })
            .collect();

        assert_eq!(convs.len(), 16);
        assert_eq!(convs[0], ("conv_1".to_owned(), 0));
        assert_eq!(convs[1], ("conv_2".to_owned(), 2));
        assert_eq!(convs[2], ("conv_3".to_owned(), 5));
        assert_eq!(convs[3], ("conv_4".to_owned(), 7));
        assert_eq!(convs[4], ("conv_5".to_owned(), 10));
        assert_eq!(convs[15], ("conv_16".to_owned(), 34));
        assert_eq!(planned[4].0, "pool_2");
    }

    #[test]
    fn truncates_at_deepest_selected_layer() {
        let net = FeatureExtractor::vgg19(
            &RandomWeights::new(0),
            &LayerSelection::default(),
            Pooling::Max,
        )
        .unwrap();

        // conv_1 relu_1 conv_2 relu_2 pool_2 conv_3 relu_3 conv_4 relu_4 pool_4 conv_5
        assert_eq!(net.layer_names().len(), 11);
        assert_eq!(net.layer_names().last().map(String::as_str), Some("conv_5"));
        assert_eq!(net.content_index(), 7);
        assert_eq!(net.style_indices(), &[0, 2, 5, 7, 10]);
    }

    #[test]
    fn unknown_layer_is_rejected() {
        let selection = LayerSelection::new("conv_4", vec!["conv_1", "conv_99"]).unwrap();
        match FeatureExtractor::vgg19(&RandomWeights::new(0), &selection, Pooling::Max) {
            Err(Error::UnknownLayer(name)) => assert_eq!(name, "conv_99"),
            _ => panic!("expected an unknown layer"),
        }
    }

    #[test]
    fn empty_style_selection_is_rejected() {
        assert!(matches!(
            LayerSelection::new("conv_1", Vec::<String>::new()),
            Err(Error::NoStyleLayers)
        ));
    }

    #[test]
    fn shapes_follow_pools() {
        let selection = LayerSelection::new("relu_2", vec!["conv_3"]).unwrap();
        let net = FeatureExtractor::from_blocks(
            &[Conv(4), Pool, Conv(6), Pool, Conv(8)],
            &RandomWeights::new(3),
            &selection,
            Pooling::Average,
        )
        .unwrap();

        let shapes = net.output_shapes(Shape::new(3, 9, 8)).unwrap();
        assert_eq!(shapes[0], Shape::new(4, 9, 8));
        assert_eq!(shapes[2], Shape::new(4, 4, 4));
        assert_eq!(shapes.last().copied(), Some(Shape::new(8, 2, 2)));

        // 3x3 collapses to 0x0 after the second pool
        match net.output_shapes(Shape::new(3, 3, 3)) {
            Err(Error::EmptyFeatureMap(name)) => assert_eq!(name, "pool_2"),
            _ => panic!("expected an empty feature map"),
        }
    }

    #[test]
    fn forward_exposes_selected_activations() {
        let selection = LayerSelection::new("conv_2", vec!["conv_1", "relu_2"]).unwrap();
        let net = FeatureExtractor::from_blocks(
            &[Conv(4), Conv(5)],
            &RandomWeights::new(11),
            &selection,
            Pooling::Max,
        )
        .unwrap();

        let input = Tensor::solid(4, 4, [0.2, -0.3, 0.9]);
        let acts = net.forward(&input).unwrap();

        assert_eq!(acts.content.shape(), Shape::new(5, 4, 4));
        assert_eq!(acts.style.len(), 2);
        assert_eq!(acts.style[0].shape(), Shape::new(4, 4, 4));
        assert!(acts.style[1].as_slice().iter().all(|v| *v >= 0.0));
    }
}
