//! Global and local thresholding on 8-bit grayscale images.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contrast::{threshold, ThresholdType};

/// Gaussian sigma matching an odd `ksize` kernel (0.3·((k−1)/2 − 1) + 0.8).
pub(crate) fn sigma_for_kernel(ksize: u32) -> f32 {
    let k = ksize.max(3) as f32;
    0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8
}

/// Force a kernel/block size odd by setting the low bit.
#[inline]
pub(crate) fn odd(v: u32) -> u32 {
    v | 1
}

/// Binary threshold: 255 where `v > level` (or `v <= level` when `invert`).
pub fn binarize(gray: &GrayImage, level: u8, invert: bool) -> GrayImage {
    let kind = if invert {
        ThresholdType::BinaryInverted
    } else {
        ThresholdType::Binary
    };
    threshold(gray, level, kind)
}

/// Otsu threshold followed by [`binarize`].
pub fn otsu_binarize(gray: &GrayImage, invert: bool) -> GrayImage {
    binarize(gray, imageproc::contrast::otsu_level(gray), invert)
}

/// Gaussian blur on a float copy, rounded back to 8 bits.
pub(crate) fn gaussian_smooth(gray: &GrayImage, ksize: u32) -> GrayImage {
    let local = gaussian_local_mean(gray, ksize);
    let (w, h) = gray.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        Luma([local.get_pixel(x, y)[0].round().clamp(0.0, 255.0) as u8])
    })
}

fn gaussian_local_mean(gray: &GrayImage, ksize: u32) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let (w, h) = gray.dimensions();
    let f = ImageBuffer::<Luma<f32>, Vec<f32>>::from_fn(w, h, |x, y| {
        Luma([gray.get_pixel(x, y)[0] as f32])
    });
    imageproc::filter::gaussian_blur_f32(&f, sigma_for_kernel(ksize))
}

/// Local threshold against a Gaussian-weighted neighbourhood mean.
///
/// A pixel is foreground when `v > mean - c`; `invert` flips that so dark
/// ink becomes 255.
pub fn adaptive_threshold(gray: &GrayImage, block: u32, c: f32, invert: bool) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let local = gaussian_local_mean(gray, odd(block.max(3)));
    GrayImage::from_fn(w, h, |x, y| {
        let v = gray.get_pixel(x, y)[0] as f32;
        let t = local.get_pixel(x, y)[0] - c;
        let above = v > t;
        Luma([if above != invert { 255 } else { 0 }])
    })
}
