use crate::{errors::InvalidRange, Error, Tensor};

/// Per-channel mean of the images the VGG networks were trained on
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// Per-channel standard deviation of the images the VGG networks were
/// trained on
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Rescales `[0,1]` RGB tensors to the distribution the feature network was
/// trained on. This is always the first stage of a forward pass.
#[derive(Clone, Debug)]
pub struct Normalization {
    mean: [f32; 3],
    std: [f32; 3],
}

impl Normalization {
    /// Creates a normalization stage, every standard deviation must be
    /// finite and strictly positive.
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Result<Self, Error> {
        for s in std.iter() {
            if !s.is_finite() || *s <= 0.0 {
                return Err(Error::InvalidRange(InvalidRange {
                    min: f32::EPSILON,
                    max: f32::MAX,
                    value: *s,
                    name: "normalization-std",
                }));
            }
        }

        Ok(Self { mean, std })
    }

    /// The ImageNet constants used by torchvision's pretrained VGG weights
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    pub fn mean(&self) -> [f32; 3] {
        self.mean
    }

    pub fn std(&self) -> [f32; 3] {
        self.std
    }

    /// `(x - mean[c]) / std[c]` for every channel `c`
    pub fn forward(&self, img: &Tensor) -> Result<Tensor, Error> {
        let shape = img.shape();
        if shape.channels != 3 {
            return Err(Error::ChannelMismatch(shape.channels));
        }

        Ok(self.apply(img))
    }

    /// [`Normalization::forward`] for tensors already known to be RGB
    pub(crate) fn apply(&self, img: &Tensor) -> Tensor {
        let mut out = img.clone();
        let plane = img.shape().plane();
        for (c, chunk) in out.as_mut_slice().chunks_mut(plane.max(1)).enumerate() {
            let inv_std = 1.0 / self.std[c];
            for v in chunk {
                *v = (*v - self.mean[c]) * inv_std;
            }
        }

        out
    }

    /// Gradient of [`Normalization::forward`] with respect to the image
    pub(crate) fn backward(&self, grad: &mut Tensor) {
        let plane = grad.shape().plane();
        for (c, chunk) in grad.as_mut_slice().chunks_mut(plane.max(1)).enumerate() {
            let inv_std = 1.0 / self.std[c];
            for v in chunk {
                *v *= inv_std;
            }
        }
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::imagenet()
    }
}
