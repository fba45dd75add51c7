use neural_style::Error;
use std::path::{Path, PathBuf};

/// Directory searched for content images given by name
pub const INPUT_DIR: &str = "input";
/// Directory holding the preset styles
pub const STYLES_DIR: &str = "styles";
/// Directory the output is written to unless a path is given
pub const OUTPUT_DIR: &str = "output";

const PRESET_EXTENSIONS: &[&str] = &["jpg", "png"];

/// Resolves files relative to a root directory, normally the working
/// directory
pub struct Resolver {
    root: PathBuf,
}

impl Resolver {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).is_file()
    }

    /// A content image is used as given if it exists, otherwise it is looked
    /// up in the input directory.
    pub fn content(&self, given: &Path) -> PathBuf {
        if self.exists(given) {
            return self.root.join(given);
        }

        let in_input = Path::new(INPUT_DIR).join(given);
        if self.exists(&in_input) {
            return self.root.join(in_input);
        }

        // reported by `check_image_exists`
        self.root.join(given)
    }

    /// A style is either the name of a preset in the styles directory, eg.
    /// `picasso` for `styles/picasso.jpg`, or a path to an image. A preset
    /// wins over a file with the same name.
    pub fn style(&self, given: &str) -> PathBuf {
        for ext in PRESET_EXTENSIONS {
            let preset = Path::new(STYLES_DIR).join(format!("{}.{}", given, ext));
            if self.exists(&preset) {
                return self.root.join(preset);
            }
        }

        self.root.join(given)
    }

    /// `output/<content>_<style>.jpg`
    pub fn default_output(&self, content: &Path, style: &Path) -> PathBuf {
        let stem = |p: &Path| {
            p.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        self.root
            .join(OUTPUT_DIR)
            .join(format!("{}_{}.jpg", stem(content), stem(style)))
    }
}

/// Fails with the resolved path if the `what` image doesn't exist, so the
/// user learns about it before the network is loaded
pub fn check_image_exists(what: &'static str, path: &Path) -> Result<(), Error> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::ImageNotFound(what, path.to_owned()))
    }
}

/// Checks that the extension of the output path is one we can encode
pub fn check_output_format(path: &Path) -> Result<(), Error> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("png") | Some("jpg") | Some("jpeg") | Some("bmp") => Ok(()),
        Some(other) => Err(Error::UnsupportedOutputFormat(other.to_owned())),
        None => Err(Error::UnsupportedOutputFormat(String::new())),
    }
}
