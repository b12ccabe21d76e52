//! Image decoding and tensor preparation shared by every model adapter.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use std::path::Path;

/// Mean/scale pair applied per channel as `(pixel - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Normalization {
    /// Maps [0, 255] onto [-1, 1].
    pub const SYMMETRIC: Normalization = Normalization { mean: 127.5, std: 127.5 };
    /// Maps [0, 255] onto [0, 1].
    pub const UNIT: Normalization = Normalization { mean: 0.0, std: 255.0 };

    #[inline]
    pub fn apply(&self, pixel: u8) -> f32 {
        (pixel as f32 - self.mean) / self.std
    }
}

/// Decode an image file and convert it to 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage, image::ImageError> {
    Ok(image::open(path)?.to_rgb8())
}

/// Resize to a `size`×`size` square with bilinear filtering.
pub fn resize_square(image: &RgbImage, size: u32) -> RgbImage {
    if image.width() == size && image.height() == size {
        return image.clone();
    }
    imageops::resize(image, size, size, FilterType::Triangle)
}

/// Decode, convert to RGB and resize in one step; the unit of work handed to
/// the extraction worker pool.
pub fn load_prepared(path: &Path, size: u32) -> Result<RgbImage, image::ImageError> {
    Ok(resize_square(&load_rgb(path)?, size))
}

/// Pack an RGB image into a `1×3×H×W` float tensor.
pub fn to_nchw(image: &RgbImage, norm: Normalization) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = norm.apply(pixel[c]);
        }
    }
    tensor
}

/// Mapping from letterboxed model-input coordinates back to the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Fit `image` inside `input_w`×`input_h` preserving aspect ratio, centre it,
/// and fill the border with `pad_value` before normalization.
pub fn letterbox_tensor(
    image: &RgbImage,
    input_w: usize,
    input_h: usize,
    norm: Normalization,
    pad_value: u8,
) -> (Array4<f32>, Letterbox) {
    let (width, height) = (image.width().max(1) as f32, image.height().max(1) as f32);
    let scale = (input_w as f32 / width).min(input_h as f32 / height);

    let new_w = ((width * scale).round() as usize).clamp(1, input_w);
    let new_h = ((height * scale).round() as usize).clamp(1, input_h);
    let pad_x = (input_w - new_w) as f32 / 2.0;
    let pad_y = (input_h - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);

    let pad = norm.apply(pad_value);
    let mut tensor = Array4::<f32>::from_elem((1, 3, input_h, input_w), pad);
    let (off_x, off_y) = (pad_x.floor() as usize, pad_y.floor() as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + off_x, y as usize + off_y);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = norm.apply(pixel[c]);
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_to_nchw_shape_and_channels() {
        let mut img = RgbImage::from_pixel(4, 3, Rgb([255, 0, 128]));
        img.put_pixel(1, 2, Rgb([0, 255, 0]));
        let t = to_nchw(&img, Normalization::SYMMETRIC);
        assert_eq!(t.shape(), &[1, 3, 3, 4]);
        assert!((t[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 0, 0]] - (128.0 - 127.5) / 127.5).abs() < 1e-6);
        assert!((t[[0, 1, 2, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_square() {
        let img = RgbImage::from_pixel(300, 200, Rgb([10, 20, 30]));
        let out = resize_square(&img, 112);
        assert_eq!(out.dimensions(), (112, 112));
        // Uniform input stays uniform.
        assert!(out.pixels().all(|p| *p == Rgb([10, 20, 30])));
    }

    #[test]
    fn test_letterbox_padding_and_roundtrip() {
        let img = RgbImage::from_pixel(320, 160, Rgb([255, 255, 255]));
        let (tensor, lb) = letterbox_tensor(&img, 640, 640, Normalization::UNIT, 114);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!((lb.pad_x).abs() < 1e-6);
        assert!((lb.pad_y - 160.0).abs() < 1e-6);
        // Border row is padding, centre row is image.
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 320, 320]] - 1.0).abs() < 1e-6);

        let (sx, sy) = lb.to_source(200.0, 260.0);
        assert!((sx - 100.0).abs() < 1e-4);
        assert!((sy - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_load_prepared_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(load_prepared(&path, 112).is_err());
    }
}
