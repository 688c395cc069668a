use image::{Rgb, RgbImage};

use super::clamp_u8;

pub const CONTRAST: f32 = 1.15;
pub const SATURATION: f32 = 1.10;
pub const BRIGHTNESS: f32 = 1.05;

/// ITU-R 601-2 luma in 16-bit fixed point.
#[inline]
fn luma(p: &Rgb<u8>) -> u8 {
    ((p[0] as u32 * 19595 + p[1] as u32 * 38470 + p[2] as u32 * 7471 + 0x8000) >> 16) as u8
}

/// `degenerate + factor * (value - degenerate)`, truncated and clamped.
#[inline]
fn enhance(value: u8, degenerate: f32, factor: f32) -> u8 {
    clamp_u8(degenerate + factor * (value as f32 - degenerate))
}

/// Pushes channels away from the frame's mean gray.
pub fn contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let pixels = (img.width() as u64 * img.height() as u64).max(1);
    let sum: u64 = img.pixels().map(|p| luma(p) as u64).sum();
    let mean = (sum as f64 / pixels as f64 + 0.5).floor() as f32;
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        Rgb([0, 1, 2].map(|c| enhance(p[c], mean, factor)))
    })
}

/// Pushes channels away from each pixel's own luma.
pub fn saturation(img: &RgbImage, factor: f32) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        let gray = luma(p) as f32;
        Rgb([0, 1, 2].map(|c| enhance(p[c], gray, factor)))
    })
}

pub fn brightness(img: &RgbImage, factor: f32) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        Rgb([0, 1, 2].map(|c| enhance(p[c], 0.0, factor)))
    })
}

/// Warm, punchy grade. Not idempotent: grading twice compounds.
pub fn grade(img: &RgbImage) -> RgbImage {
    brightness(&saturation(&contrast(img, CONTRAST), SATURATION), BRIGHTNESS)
}
