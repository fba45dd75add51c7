use crate::{
    errors::{FileError, WeightShape},
    Error,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::path::Path;

/// The frozen parameters of a single convolution
pub struct ConvWeights {
    /// `[out_channels, in_channels, kernel, kernel]`
    pub weight: Vec<f32>,
    /// `[out_channels]`
    pub bias: Vec<f32>,
}

/// Provides the parameters of the convolutions of a feature network.
///
/// `index` is the position of the convolution in torchvision's
/// `vgg19().features` sequence, which counts ReLU and pooling layers too, so
/// the convolutions of VGG-19 sit at 0, 2, 5, 7, 10, ...
pub trait WeightSource {
    fn conv(
        &self,
        index: usize,
        out_channels: usize,
        in_channels: usize,
        kernel: usize,
    ) -> Result<ConvWeights, Error>;
}

/// Weights stored in a [safetensors](https://github.com/huggingface/safetensors)
/// file exported from a torchvision VGG state dict, eg. with
/// `safetensors.torch.save_file(vgg19(weights="DEFAULT").state_dict(), path)`.
///
/// Both `features.{i}.weight` and `{i}.weight` naming is accepted.
pub struct SafeTensorsWeights {
    bytes: Vec<u8>,
}

impl SafeTensorsWeights {
    /// Reads and validates the weights file. Nothing is kept if this fails.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            Error::WeightsFile(FileError {
                path: path.to_owned(),
                err,
            })
        })?;
        log::info!("read {} bytes of weights from {}", bytes.len(), path.display());
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        // Parse once up front so that a corrupt file is reported before any
        // layer is constructed
        let count = SafeTensors::deserialize(&bytes)?.names().len();
        log::debug!("weights contain {} tensors", count);

        Ok(Self { bytes })
    }

    fn load(
        tensors: &SafeTensors<'_>,
        index: usize,
        kind: &str,
        expected: Vec<usize>,
    ) -> Result<Vec<f32>, Error> {
        let prefixed = format!("features.{}.{}", index, kind);
        let (name, view) = match tensors.tensor(&prefixed) {
            Ok(view) => (prefixed, view),
            Err(_) => {
                let bare = format!("{}.{}", index, kind);
                match tensors.tensor(&bare) {
                    Ok(view) => (bare, view),
                    Err(_) => return Err(Error::MissingWeight(prefixed)),
                }
            }
        };

        to_f32(&name, &view, expected)
    }
}

fn to_f32(name: &str, view: &TensorView<'_>, expected: Vec<usize>) -> Result<Vec<f32>, Error> {
    if view.dtype() != Dtype::F32 {
        return Err(Error::WeightDtype(name.to_owned()));
    }

    if view.shape() != expected.as_slice() {
        return Err(Error::WeightShape(WeightShape {
            name: name.to_owned(),
            expected,
            actual: view.shape().to_vec(),
        }));
    }

    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

impl WeightSource for SafeTensorsWeights {
    fn conv(
        &self,
        index: usize,
        out_channels: usize,
        in_channels: usize,
        kernel: usize,
    ) -> Result<ConvWeights, Error> {
        let tensors = SafeTensors::deserialize(&self.bytes)?;

        Ok(ConvWeights {
            weight: Self::load(
                &tensors,
                index,
                "weight",
                vec![out_channels, in_channels, kernel, kernel],
            )?,
            bias: Self::load(&tensors, index, "bias", vec![out_channels])?,
        })
    }
}

/// Seeded, untrained weights. Convolution weights use He uniform
/// initialization, biases torch's `1 / sqrt(fan_in)` bound.
///
/// Random feature networks still produce recognizable texture transfer,
/// and they make it possible to run the whole pipeline without a
/// checkpoint, which the tests and benchmarks rely on.
#[derive(Copy, Clone, Debug)]
pub struct RandomWeights {
    seed: u64,
}

impl RandomWeights {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl WeightSource for RandomWeights {
    fn conv(
        &self,
        index: usize,
        out_channels: usize,
        in_channels: usize,
        kernel: usize,
    ) -> Result<ConvWeights, Error> {
        // Seed per layer so truncating the network doesn't change the
        // weights of the layers that remain
        let mut rng = Pcg32::seed_from_u64(self.seed.wrapping_add(index as u64));

        let fan_in = (in_channels * kernel * kernel) as f32;
        let weight_bound = (6.0 / fan_in).sqrt();
        let bias_bound = 1.0 / fan_in.sqrt();

        let weight = (0..out_channels * in_channels * kernel * kernel)
            .map(|_| rng.gen_range(-weight_bound..weight_bound))
            .collect();
        let bias = (0..out_channels)
            .map(|_| rng.gen_range(-bias_bound..bias_bound))
            .collect();

        Ok(ConvWeights { weight, bias })
    }
}
