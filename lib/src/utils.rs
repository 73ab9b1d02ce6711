use crate::{Dims, Error};
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

impl<'a> From<image::RgbImage> for ImageSource<'a> {
    fn from(img: image::RgbImage) -> Self {
        Self::Image(image::DynamicImage::ImageRgb8(img))
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

/// Computes the size an image is scaled to so that its longest side is at
/// most `max_dimension`, keeping the aspect ratio. Images are never upscaled.
pub(crate) fn fit_within(dims: Dims, max_dimension: Option<u32>) -> Dims {
    let max_dimension = match max_dimension {
        Some(m) => m,
        None => return dims,
    };

    let long = dims.width.max(dims.height);
    if long <= max_dimension {
        return dims;
    }

    let scale = f64::from(max_dimension) / f64::from(long);
    Dims {
        width: ((f64::from(dims.width) * scale).round() as u32).max(1),
        height: ((f64::from(dims.height) * scale).round() as u32).max(1),
    }
}

/// Decodes an image source into an 8-bit RGB image, dropping any alpha
/// channel, and downscales it to fit within `max_dimension`
pub fn load_image(
    src: ImageSource<'_>,
    max_dimension: Option<u32>,
) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?.to_rgb8();

    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::shape(
            "input image",
            "a non-empty image",
            Dims::new(width, height),
        ));
    }

    let target = fit_within(Dims::new(width, height), max_dimension);

    let img = if target.width != width || target.height != height {
        image::imageops::resize(
            &img,
            target.width,
            target.height,
            image::imageops::CatmullRom,
        )
    } else {
        img
    };

    Ok(img)
}
