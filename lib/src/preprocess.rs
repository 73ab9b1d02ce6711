//! Conversion between 8-bit RGB images and the normalized tensors the
//! feature extractor works on.

use crate::tensor::{Shape, Tensor};

/// Per-channel means of the ImageNet training set, in BGR order, as used by
/// the VGG family of networks
pub const VGG_MEANS_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// The channel model of a normalized tensor
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Normalization {
    /// The mean subtracted from each tensor channel, in tensor channel order
    pub means: [f32; 3],
    /// If true, tensor channel 0 is blue and channel 2 is red
    pub bgr: bool,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            means: VGG_MEANS_BGR,
            bgr: true,
        }
    }
}

impl Normalization {
    /// Maps a tensor channel to the index of its color in an `Rgb` pixel
    #[inline]
    fn rgb_index(&self, channel: usize) -> usize {
        if self.bgr {
            2 - channel
        } else {
            channel
        }
    }

    /// The inclusive range of valid values for a tensor channel
    #[inline]
    pub fn channel_range(&self, channel: usize) -> (f32, f32) {
        let mean = self.means[channel];
        (-mean, 255.0 - mean)
    }

    pub fn to_tensor(&self, img: &image::RgbImage) -> Tensor {
        let (width, height) = img.dimensions();
        let shape = Shape::new(3, height as usize, width as usize);
        let mut tensor = Tensor::zeros(shape);
        let plane = shape.plane();

        let data = tensor.as_mut_slice();
        for (i, pixel) in img.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = f32::from(pixel[self.rgb_index(c)]) - self.means[c];
            }
        }

        tensor
    }

    /// Converts a normalized tensor back to a displayable image, adding the
    /// means back and rounding to the nearest representable value
    pub fn to_image(&self, tensor: &Tensor) -> image::RgbImage {
        let shape = tensor.shape();
        debug_assert_eq!(shape.channels, 3);

        let plane = shape.plane();
        let data = tensor.as_slice();
        let mut img = image::RgbImage::new(shape.width as u32, shape.height as u32);

        for (i, pixel) in img.pixels_mut().enumerate() {
            for c in 0..3 {
                let v = (data[c * plane + i] + self.means[c]).round();
                pixel[self.rgb_index(c)] = v.max(0.0).min(255.0) as u8;
            }
        }

        img
    }

    /// Clamps every channel of the tensor into its valid range
    pub fn clip(&self, tensor: &mut Tensor) {
        for c in 0..tensor.shape().channels.min(3) {
            let (lo, hi) = self.channel_range(c);
            for v in tensor.channel_mut(c) {
                *v = v.max(lo).min(hi);
            }
        }
    }
}
