// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` transfers the look of one image onto the content of another
//! with the optimization based method of Gatys et al.
//!
//! A pretrained VGG-19 network is run over a content image, a style image and
//! a canvas. The canvas pixels are then optimized with L-BFGS so that its
//! activations match the content image at one layer, and the Gram matrices of
//! its activations match those of the style image at several layers.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the
//! builder pattern. Calling `build` on the `SessionBuilder` loads the network
//! weights and the input images, and checks for various errors.
//!
//! `Session` has a `run()` method that optimizes the canvas and returns the
//! result as a `GeneratedImage`, which you can save, stream, or inspect.
//!
//! For more control, [`run_style_transfer`] and [`StyleTransfer`] work
//! directly on tensors with any [`FeatureExtractor`].
//!
//! ## Weights
//!
//! The network weights are read from a [safetensors](https://github.com/huggingface/safetensors)
//! file containing torchvision's VGG-19 `features` parameters, by default at
//! `models/vgg19.safetensors`.
//!
//! ## Usage
//!
//! ```no_run
//! // Create a new session with default parameters
//! let session = neural_style::Session::builder()
//!     // Set some parameters
//!     .steps(300)
//!     .image_size(256)
//!     // Specify the input images
//!     .content(&"imgs/landscape.png")
//!     .style(&"imgs/swirls.png")
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Run the optimization
//! let generated_img = session.run(None).expect("style transfer failed");
//!
//! // Save the generated image to disk
//! generated_img.save("my_generated_img.jpg").expect("failed to save generated image");
//! ```
mod errors;
mod loss;
mod network;
mod normalize;
mod ops;
pub mod optim;
pub mod session;
mod tensor;
mod transfer;
mod utils;
mod weights;

pub use image;
use std::path::Path;

pub use errors::Error;
pub use loss::{LossBreakdown, LossNetwork, LossWeights};
pub use network::{Activations, Block, FeatureExtractor, LayerSelection, Pooling, VGG19_BLOCKS};
pub use normalize::{Normalization, IMAGENET_MEAN, IMAGENET_STD};
pub use ops::{gram, Gram};
pub use optim::{Lbfgs, LbfgsConfig, LineSearch, Momentum, MomentumConfig, OptimizerKind};
pub use session::{Session, SessionBuilder, WeightsSource};
pub use tensor::{Shape, Tensor};
pub use transfer::{
    run_style_transfer, run_style_transfer_with, step_count, Init, ProgressUpdate, StyleTransfer,
    TransferOptions, TransferOutput, TransferProgress, TransferState,
};
pub use utils::{image_to_tensor, load_dynamic_image, tensor_to_image, ImageSource};
pub use weights::{ConvWeights, RandomWeights, SafeTensorsWeights, WeightSource};

/// Simple dimensions struct
#[derive(Copy, Clone)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// An image generated by a `Session::run()`
pub struct GeneratedImage {
    image: image::RgbImage,
    tensor: Tensor,
    history: Vec<LossBreakdown>,
}

impl GeneratedImage {
    fn new(tensor: Tensor, history: Vec<LossBreakdown>) -> Result<Self, Error> {
        Ok(Self {
            image: tensor_to_image(&tensor)?,
            tensor,
            history,
        })
    }

    /// Saves the generated image to the specified path, the format is
    /// inferred from the extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        self.image.save(&path)?;
        Ok(())
    }

    /// Writes the generated image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image();
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// The final canvas, every value is in `[0,1]`
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// The losses of every step
    pub fn history(&self) -> &[LossBreakdown] {
        &self.history
    }

    /// Returns the generated output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.image)
    }
}

impl AsRef<image::RgbImage> for GeneratedImage {
    fn as_ref(&self) -> &image::RgbImage {
        &self.image
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_image_round_trips_through_writer() {
        let tensor = Tensor::solid(3, 5, [1.0, 0.5, 0.0]);
        let generated = GeneratedImage::new(tensor, Vec::new()).unwrap();
        assert_eq!(generated.as_ref().dimensions(), (5, 3));

        let mut buffer = Vec::new();
        generated
            .write(&mut buffer, image::ImageOutputFormat::Png)
            .unwrap();

        let decoded = image::load_from_memory(&buffer).unwrap().to_rgb();
        assert_eq!(decoded.get_pixel(4, 2), &image::Rgb([255, 127, 0]));
    }
}
