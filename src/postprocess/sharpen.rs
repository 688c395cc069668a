use image::{Rgb, RgbImage};

use super::reflect101;

/// Cross-shaped unsharp kernel; weights sum to one.
const KERNEL: [[i32; 3]; 3] = [[0, -1, 0], [-1, 5, -1], [0, -1, 0]];

/// Convolves with [`KERNEL`] (mirrored borders, saturating) and blends the
/// result 50/50 with the input.
pub fn sharpen(img: &RgbImage) -> RgbImage {
    let (w, h) = img.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let mut acc = [0i32; 3];
        for (ky, row) in KERNEL.iter().enumerate() {
            for (kx, &k) in row.iter().enumerate() {
                if k == 0 {
                    continue;
                }
                let sx = reflect101(x as i64 + kx as i64 - 1, w);
                let sy = reflect101(y as i64 + ky as i64 - 1, h);
                let p = img.get_pixel(sx, sy);
                for c in 0..3 {
                    acc[c] += k * p[c] as i32;
                }
            }
        }
        let original = img.get_pixel(x, y);
        Rgb([0, 1, 2].map(|c| {
            let sharp = acc[c].clamp(0, 255);
            ((original[c] as i32 + sharp + 1) / 2) as u8
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flat_regions_are_untouched() {
        let img = RgbImage::from_pixel(5, 4, Rgb([90, 30, 200]));
        assert_eq!(sharpen(&img), img);
    }

    #[test]
    fn isolated_peak_is_boosted() {
        let mut img = RgbImage::new(3, 3);
        img.put_pixel(1, 1, Rgb([100, 100, 100]));
        let out = sharpen(&img);
        // 5 * 100 saturates to 255, blended with 100.
        assert_eq!(out.get_pixel(1, 1), &Rgb([178, 178, 178]));
        // Edge neighbours see the peak twice through the mirrored border and clamp at zero.
        assert_eq!(out.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn bright_edge_pixel_reflects_inward() {
        let mut img = RgbImage::from_pixel(4, 1, Rgb([10, 10, 10]));
        img.put_pixel(0, 0, Rgb([50, 50, 50]));
        let out = sharpen(&img);
        // On a single row the vertical neighbours mirror onto the pixel itself:
        // 5*50 - 50 - 50 - 10 - 10 = 130, blended with 50.
        assert_eq!(out.get_pixel(0, 0), &Rgb([90, 90, 90]));
    }
}
