use crate::{Dims, Error, Shape, Tensor};
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the session
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// The size of an image resized so that its smaller edge is `size`, keeping
/// the aspect ratio. The longer edge is truncated.
pub(crate) fn smaller_edge_dims(width: u32, height: u32, size: u32) -> Dims {
    if width <= height {
        let long = (u64::from(size) * u64::from(height) / u64::from(width.max(1))) as u32;
        Dims::new(size, long.max(1))
    } else {
        let long = (u64::from(size) * u64::from(width) / u64::from(height.max(1))) as u32;
        Dims::new(long.max(1), size)
    }
}

/// Loads an image as RGB, resizing it to exactly `dims` if needed
pub(crate) fn load_image(src: ImageSource<'_>, dims: Option<Dims>) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?.to_rgb();

    let img = match dims {
        Some(size) if img.width() != size.width || img.height() != size.height => {
            image::imageops::resize(
                &img,
                size.width,
                size.height,
                image::imageops::FilterType::Triangle,
            )
        }
        _ => img,
    };

    Ok(img)
}

/// Loads the content image, resized so its smaller edge is `image_size`
pub(crate) fn load_content(src: ImageSource<'_>, image_size: u32) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?;

    use image::GenericImageView;
    let dims = smaller_edge_dims(img.width(), img.height(), image_size);

    load_image(ImageSource::Image(img), Some(dims))
}

/// Converts an 8-bit RGB image into a `[1, 3, H, W]` tensor in `[0,1]`
pub fn image_to_tensor(img: &image::RgbImage) -> Tensor {
    let (width, height) = img.dimensions();
    let mut tensor = Tensor::zeros(Shape::new(3, height as usize, width as usize));
    let plane = tensor.shape().plane();

    let data = tensor.as_mut_slice();
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = f32::from(pixel[c]) / 255.0;
        }
    }

    tensor
}

/// Converts an RGB tensor back into an 8-bit image. Values are clamped into
/// `[0,1]` and scaled by 255, truncating the fraction.
pub fn tensor_to_image(tensor: &Tensor) -> Result<image::RgbImage, Error> {
    let shape = tensor.shape();
    if shape.channels != 3 {
        return Err(Error::ChannelMismatch(shape.channels));
    }

    let plane = shape.plane();
    let data = tensor.as_slice();
    let to_u8 = |v: f32| (v.max(0.0).min(1.0) * 255.0) as u8;

    Ok(image::RgbImage::from_fn(
        shape.width as u32,
        shape.height as u32,
        |x, y| {
            let i = y as usize * shape.width + x as usize;
            image::Rgb([
                to_u8(data[i]),
                to_u8(data[plane + i]),
                to_u8(data[2 * plane + i]),
            ])
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smaller_edge_keeps_aspect() {
        assert_eq!(smaller_edge_dims(400, 300, 128), Dims::new(170, 128));
        assert_eq!(smaller_edge_dims(300, 400, 128), Dims::new(128, 170));
        assert_eq!(smaller_edge_dims(64, 64, 128), Dims::square(128));
    }

    #[test]
    fn tensor_image_conversion() {
        let mut img = image::RgbImage::new(3, 2);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(2, 1, image::Rgb([0, 51, 255]));

        let tensor = image_to_tensor(&img);
        assert_eq!(tensor.dims(), [1, 3, 2, 3]);
        assert_eq!(tensor.get(0, 0, 0), 1.0);
        assert!((tensor.get(1, 1, 2) - 0.2).abs() < 1e-6);

        let back = tensor_to_image(&tensor).unwrap();
        assert_eq!(back.get_pixel(0, 0), &image::Rgb([255, 0, 0]));
        assert_eq!(back.get_pixel(2, 1), &image::Rgb([0, 51, 255]));
    }

    #[test]
    fn output_is_clamped_and_truncated() {
        let mut tensor = Tensor::solid(1, 1, [0.0; 3]);
        tensor.as_mut_slice().copy_from_slice(&[-0.5, 1.5, 0.999]);

        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!(img.get_pixel(0, 0), &image::Rgb([0, 255, 254]));
    }

    #[test]
    fn content_is_resized_by_smaller_edge() {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(40, 20));
        let content = load_content(ImageSource::Image(img), 10).unwrap();
        assert_eq!(content.dimensions(), (20, 10));
    }
}
