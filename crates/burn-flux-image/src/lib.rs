//! Image post-processing
//!
//! Maps between decoded image tensors in `[-1, 1]` (NCHW) and 8-bit RGB
//! images. [`to_image`] and [`to_array`] are not exact inverses: quantizing
//! to u8 loses up to half a level and [`to_array`] resamples to 1024x1024.

use burn::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use thiserror::Error;

/// Side length [`to_array`] resamples to
pub const TARGET_SIZE: u32 = 1024;

#[derive(Error, Debug)]
pub enum ImageConvertError {
    #[error("Expected 3 color channels, got {0}")]
    Channels(usize),

    #[error("Empty batch")]
    EmptyBatch,

    #[error("Image of {width}x{height} does not fit in an image buffer")]
    Buffer { width: usize, height: usize },
}

/// Converts a decoded image tensor `[batch, 3, height, width]` to RGB images
///
/// Values are mapped with `clip(x / 2 + 0.5, 0, 1) * 255` and rounded.
pub fn to_images<B: Backend>(decoded: Tensor<B, 4>) -> Result<Vec<RgbImage>, ImageConvertError> {
    let [batch, channels, height, width] = decoded.dims();
    if channels != 3 {
        return Err(ImageConvertError::Channels(channels));
    }
    if batch == 0 {
        return Err(ImageConvertError::EmptyBatch);
    }

    let pixels: Vec<u8> = (decoded / 2.0 + 0.5)
        .clamp(0.0, 1.0)
        .mul_scalar(255.0)
        .round()
        .permute([0, 2, 3, 1])
        .into_data()
        .iter::<f32>()
        .map(|v| v as u8)
        .collect();

    let buffer_error = || ImageConvertError::Buffer { width, height };
    let (w, h) = (
        u32::try_from(width).map_err(|_| buffer_error())?,
        u32::try_from(height).map_err(|_| buffer_error())?,
    );

    pixels
        .chunks_exact(height * width * 3)
        .map(|chunk| RgbImage::from_raw(w, h, chunk.to_vec()).ok_or_else(buffer_error))
        .collect()
}

/// Converts the first image of a decoded batch
pub fn to_image<B: Backend>(decoded: Tensor<B, 4>) -> Result<RgbImage, ImageConvertError> {
    to_images(decoded)?
        .into_iter()
        .next()
        .ok_or(ImageConvertError::EmptyBatch)
}

/// Resamples to 1024x1024 with Lanczos3 and converts to `[1, 3, 1024, 1024]` in `[-1, 1]`
pub fn to_array<B: Backend>(image: &DynamicImage, device: &B::Device) -> Tensor<B, 4> {
    let rgb = if image.width() == TARGET_SIZE && image.height() == TARGET_SIZE {
        image.to_rgb8()
    } else {
        image
            .resize_exact(TARGET_SIZE, TARGET_SIZE, FilterType::Lanczos3)
            .to_rgb8()
    };
    pixels_to_array(&rgb, device)
}

/// Converts without resampling: `[1, 3, height, width]` with `2 * (p / 255) - 1`
pub fn pixels_to_array<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let values: Vec<f32> = image.as_raw().iter().map(|&p| p as f32 / 255.0).collect();

    Tensor::<B, 4>::from_data(TensorData::new(values, [1, height, width, 3]), device)
        .permute([0, 3, 1, 2])
        .mul_scalar(2.0)
        .sub_scalar(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_to_image_values() {
        let device = Default::default();
        // one pixel per channel value: -1 -> 0, 0 -> 128 (127.5 rounds up), 1 -> 255, out of range clipped
        let decoded = Tensor::<TestBackend, 1>::from_floats([-1.0, 0.0, 1.0, -3.0, 2.0, 0.5], &device)
            .reshape([1, 3, 1, 2]);

        let image = to_image(decoded).unwrap();
        assert_eq!((image.width(), image.height()), (2, 1));
        // channel-last: pixel (0,0) = channels [-1, 1, 2], pixel (1,0) = [0, -3, 0.5]
        assert_eq!(image.get_pixel(0, 0).0, [0, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [128, 0, 191]);
    }

    #[test]
    fn test_to_image_rejects_channels() {
        let device = Default::default();
        let decoded = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        assert!(matches!(to_image(decoded), Err(ImageConvertError::Channels(4))));
    }

    #[test]
    fn test_pixels_to_array_layout() {
        let device = Default::default();
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, image::Rgb([0, 255, 51]));
        image.put_pixel(1, 0, image::Rgb([255, 0, 102]));

        let array = pixels_to_array::<TestBackend>(&image, &device);
        assert_eq!(array.dims(), [1, 3, 1, 2]);

        let values: Vec<f32> = array.into_data().iter::<f32>().collect();
        let expected = [-1.0, 1.0, 1.0, -1.0, -0.6, -0.2];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-6, "{values:?}");
        }
    }

    #[test]
    fn test_to_array_resizes() {
        let device = Default::default();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, image::Rgb([255, 255, 255])));

        let array = to_array::<TestBackend>(&image, &device);
        assert_eq!(array.dims(), [1, 3, 1024, 1024]);
    }
}
