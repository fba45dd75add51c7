use std::{fmt, path::PathBuf};

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct SizeMismatch {
    pub(crate) what: &'static str,
    pub(crate) expected: (u32, u32),
    pub(crate) actual: (u32, u32),
}

impl fmt::Display for SizeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} size ({}x{}) must match the content size ({}x{}), resize it before running",
            self.what, self.actual.0, self.actual.1, self.expected.0, self.expected.1
        )
    }
}

#[derive(Debug)]
pub struct WeightShape {
    pub(crate) name: String,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for WeightShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "weight tensor '{}' has shape {:?}, but {:?} is required",
            self.name, self.actual, self.expected
        )
    }
}

#[derive(Debug)]
pub struct FileError {
    pub(crate) path: PathBuf,
    pub(crate) err: std::io::Error,
}

impl FileError {
    /// The file that could not be read
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to read '{}': {}", self.path.display(), self.err)
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The style image or the canvas doesn't have the content image's size
    SizeMismatch(SizeMismatch),
    /// The number of optimization steps must be at least 1
    InvalidStepCount(i64),
    /// A layer name in the layer selection doesn't exist in the network
    UnknownLayer(String),
    /// At least one style layer must be selected
    NoStyleLayers,
    /// The image is so small that the named layer's activation has no
    /// spatial extent left
    EmptyFeatureMap(String),
    /// Image tensors must have exactly 3 channels
    ChannelMismatch(usize),
    /// The weights file could not be parsed
    Weights(safetensors::SafeTensorError),
    /// A tensor required by the network is missing from the weights
    MissingWeight(String),
    /// A weight tensor has the wrong shape
    WeightShape(WeightShape),
    /// Weight tensors must be stored as f32
    WeightDtype(String),
    /// The weights file could not be read
    WeightsFile(FileError),
    /// A content or style image was not provided to the session builder
    MissingImage(&'static str),
    /// The content or style image doesn't exist at the given path
    ImageNotFound(&'static str, PathBuf),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Weights(err) => Some(err),
            Self::WeightsFile(fe) => Some(&fe.err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::SizeMismatch(sm) => write!(f, "{}", sm),
            Self::InvalidStepCount(count) => {
                write!(f, "the step count must be at least 1, got {}", count)
            }
            Self::UnknownLayer(name) => write!(
                f,
                "layer '{}' does not exist in the feature network",
                name
            ),
            Self::NoStyleLayers => write!(f, "at least 1 style layer must be selected"),
            Self::EmptyFeatureMap(name) => write!(
                f,
                "the activation at layer '{}' is empty, the input image is too small",
                name
            ),
            Self::ChannelMismatch(channels) => write!(
                f,
                "image tensors must have 3 channels, but {} were provided",
                channels
            ),
            Self::Weights(err) => write!(f, "failed to parse network weights: {}", err),
            Self::MissingWeight(name) => {
                write!(f, "weight tensor '{}' is missing from the weights", name)
            }
            Self::WeightShape(ws) => write!(f, "{}", ws),
            Self::WeightsFile(fe) => write!(f, "network weights: {}", fe),
            Self::WeightDtype(name) => {
                write!(f, "weight tensor '{}' must be stored as F32", name)
            }
            Self::MissingImage(which) => write!(f, "no {} image was provided", which),
            Self::ImageNotFound(which, path) => {
                write!(f, "{} image not found at {}", which, path.display())
            }
            Self::Io(io) => write!(f, "{}", io),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Self::Weights(err)
    }
}
