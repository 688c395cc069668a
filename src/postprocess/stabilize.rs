//! Feature-tracking stabilization.
//!
//! For each consecutive pair: Shi-Tomasi corners in the previous frame,
//! pyramidal Lucas-Kanade tracking into the current frame, a RANSAC similarity
//! fit over the tracked pairs, then the current frame is warped by it. Any
//! step that cannot produce a transform leaves the frame as it was.

use image::imageops;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::reflect101;
use crate::frame::FrameStream;

const MAX_CORNERS: usize = 200;
const QUALITY_LEVEL: f32 = 0.01;
const MIN_DISTANCE: f32 = 30.0;
const MIN_CORRESPONDENCES: usize = 4;

const WINDOW_HALF: i32 = 10; // 21x21
const MAX_PYRAMID_LEVEL: usize = 3;
const LK_ITERATIONS: usize = 30;
const LK_EPSILON: f32 = 0.01;
const LK_MIN_EIGEN: f32 = 1e-4;

const RANSAC_ITERATIONS: usize = 200;
const RANSAC_THRESHOLD: f64 = 3.0;
const RANSAC_SEED: u64 = 0x5eed_cafe;

pub type Point = (f32, f32);

/// Single-channel float image.
#[derive(Debug, Clone)]
pub(crate) struct Plane {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl Plane {
    pub(crate) fn from_rgb(img: &RgbImage) -> Self {
        let gray = imageops::grayscale(img);
        Self {
            width: gray.width(),
            height: gray.height(),
            data: gray.into_raw().into_iter().map(f32::from).collect(),
        }
    }

    fn filled(width: u32, height: u32) -> Self {
        Self { width, height, data: vec![0.0; width as usize * height as usize] }
    }

    #[inline]
    fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    fn set(&mut self, x: u32, y: u32, v: f32) {
        let idx = y as usize * self.width as usize + x as usize;
        self.data[idx] = v;
    }

    /// Mirrored read for filters.
    #[inline]
    fn at(&self, x: i64, y: i64) -> f32 {
        self.get(reflect101(x, self.width), reflect101(y, self.height))
    }

    /// Bilinear read with coordinates clamped to the image.
    fn sample(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let top = self.get(x0, y0) * (1.0 - fx) + self.get(x1, y0) * fx;
        let bottom = self.get(x0, y1) * (1.0 - fx) + self.get(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// 2x2 box average.
    fn downsample(&self) -> Self {
        let (w, h) = (self.width / 2, self.height / 2);
        let mut out = Self::filled(w, h);
        for y in 0..h {
            for x in 0..w {
                let sum = self.get(2 * x, 2 * y)
                    + self.get(2 * x + 1, 2 * y)
                    + self.get(2 * x, 2 * y + 1)
                    + self.get(2 * x + 1, 2 * y + 1);
                out.set(x, y, sum * 0.25);
            }
        }
        out
    }

    /// Central-difference gradients `(d/dx, d/dy)`.
    fn gradients(&self) -> (Self, Self) {
        let mut gx = Self::filled(self.width, self.height);
        let mut gy = Self::filled(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let (xi, yi) = (x as i64, y as i64);
                gx.set(x, y, (self.at(xi + 1, yi) - self.at(xi - 1, yi)) * 0.5);
                gy.set(x, y, (self.at(xi, yi + 1) - self.at(xi, yi - 1)) * 0.5);
            }
        }
        (gx, gy)
    }
}

pub(crate) struct Pyramid {
    levels: Vec<Plane>,
}

impl Pyramid {
    pub(crate) fn new(base: Plane) -> Self {
        let min_size = (2 * WINDOW_HALF + 1) as u32;
        let mut levels = vec![base];
        while levels.len() <= MAX_PYRAMID_LEVEL {
            let Some(top) = levels.last() else { break };
            if top.width / 2 < min_size || top.height / 2 < min_size {
                break;
            }
            let next = top.downsample();
            levels.push(next);
        }
        Self { levels }
    }
}

/// Strongest Shi-Tomasi corners, at least [`MIN_DISTANCE`] apart.
pub(crate) fn good_features(gray: &Plane) -> Vec<Point> {
    let (w, h) = (gray.width, gray.height);
    if w < 3 || h < 3 {
        return Vec::new();
    }

    // Sobel structure tensor terms.
    let mut dxx = Plane::filled(w, h);
    let mut dxy = Plane::filled(w, h);
    let mut dyy = Plane::filled(w, h);
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as i64, y as i64);
            let gx = gray.at(xi + 1, yi - 1) + 2.0 * gray.at(xi + 1, yi) + gray.at(xi + 1, yi + 1)
                - gray.at(xi - 1, yi - 1)
                - 2.0 * gray.at(xi - 1, yi)
                - gray.at(xi - 1, yi + 1);
            let gy = gray.at(xi - 1, yi + 1) + 2.0 * gray.at(xi, yi + 1) + gray.at(xi + 1, yi + 1)
                - gray.at(xi - 1, yi - 1)
                - 2.0 * gray.at(xi, yi - 1)
                - gray.at(xi + 1, yi - 1);
            dxx.set(x, y, gx * gx);
            dxy.set(x, y, gx * gy);
            dyy.set(x, y, gy * gy);
        }
    }

    // Minimum eigenvalue over a 3x3 block.
    let mut eig = Plane::filled(w, h);
    let mut max_eig = 0f32;
    for y in 0..h {
        for x in 0..w {
            let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    a += dxx.at(x as i64 + dx, y as i64 + dy);
                    b += dxy.at(x as i64 + dx, y as i64 + dy);
                    c += dyy.at(x as i64 + dx, y as i64 + dy);
                }
            }
            let v = ((a + c) - ((a - c) * (a - c) + 4.0 * b * b).sqrt()) * 0.5;
            eig.set(x, y, v);
            max_eig = max_eig.max(v);
        }
    }
    if max_eig <= 0.0 {
        return Vec::new();
    }
    let threshold = max_eig * QUALITY_LEVEL;

    let mut candidates = Vec::new();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let v = eig.get(x, y);
            if v <= threshold {
                continue;
            }
            let local_max = (y - 1..=y + 1).all(|ny| (x - 1..=x + 1).all(|nx| eig.get(nx, ny) <= v));
            if local_max {
                candidates.push((v, x as f32, y as f32));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let min_dist_sq = MIN_DISTANCE * MIN_DISTANCE;
    let mut corners: Vec<Point> = Vec::with_capacity(MAX_CORNERS);
    for (_, x, y) in candidates {
        if corners.len() >= MAX_CORNERS {
            break;
        }
        let clear = corners.iter().all(|&(cx, cy)| (cx - x).powi(2) + (cy - y).powi(2) >= min_dist_sq);
        if clear {
            corners.push((x, y));
        }
    }
    corners
}

/// Pyramidal Lucas-Kanade. `None` marks a point that could not be tracked.
pub(crate) fn track_points(prev: &Pyramid, curr: &Pyramid, points: &[Point]) -> Vec<Option<Point>> {
    let levels = prev.levels.len().min(curr.levels.len());
    let gradients: Vec<(Plane, Plane)> = prev.levels[..levels].iter().map(Plane::gradients).collect();
    points
        .iter()
        .map(|&p| track_point(&prev.levels[..levels], &curr.levels[..levels], &gradients, p))
        .collect()
}

fn track_point(prev: &[Plane], curr: &[Plane], gradients: &[(Plane, Plane)], point: Point) -> Option<Point> {
    let area = ((2 * WINDOW_HALF + 1) * (2 * WINDOW_HALF + 1)) as f32;
    let mut guess = (0f32, 0f32);
    let mut patch = Vec::with_capacity(area as usize);

    for level in (0..prev.len()).rev() {
        let scale = (1u32 << level) as f32;
        let (px, py) = (point.0 / scale, point.1 / scale);
        let (image, next) = (&prev[level], &curr[level]);
        let (gx, gy) = &gradients[level];

        patch.clear();
        let (mut gxx, mut gxy, mut gyy) = (0f32, 0f32, 0f32);
        for dy in -WINDOW_HALF..=WINDOW_HALF {
            for dx in -WINDOW_HALF..=WINDOW_HALF {
                let (sx, sy) = (px + dx as f32, py + dy as f32);
                let ix = gx.sample(sx, sy);
                let iy = gy.sample(sx, sy);
                gxx += ix * ix;
                gxy += ix * iy;
                gyy += iy * iy;
                patch.push((dx as f32, dy as f32, image.sample(sx, sy), ix, iy));
            }
        }

        let det = gxx * gyy - gxy * gxy;
        let min_eig = ((gxx + gyy) - ((gxx - gyy) * (gxx - gyy) + 4.0 * gxy * gxy).sqrt()) * 0.5 / area;
        if min_eig < LK_MIN_EIGEN || det.abs() <= f32::EPSILON {
            return None;
        }

        let mut v = (0f32, 0f32);
        for _ in 0..LK_ITERATIONS {
            let (mut bx, mut by) = (0f32, 0f32);
            for &(dx, dy, value, ix, iy) in &patch {
                let diff = value - next.sample(px + guess.0 + v.0 + dx, py + guess.1 + v.1 + dy);
                bx += diff * ix;
                by += diff * iy;
            }
            let eta = ((gyy * bx - gxy * by) / det, (gxx * by - gxy * bx) / det);
            v.0 += eta.0;
            v.1 += eta.1;
            if eta.0 * eta.0 + eta.1 * eta.1 < LK_EPSILON * LK_EPSILON {
                break;
            }
        }

        guess = if level > 0 {
            (2.0 * (guess.0 + v.0), 2.0 * (guess.1 + v.1))
        } else {
            (guess.0 + v.0, guess.1 + v.1)
        };
    }

    let tracked = (point.0 + guess.0, point.1 + guess.1);
    let base = &curr[0];
    let inside = tracked.0.is_finite()
        && tracked.1.is_finite()
        && (0.0..=(base.width - 1) as f32).contains(&tracked.0)
        && (0.0..=(base.height - 1) as f32).contains(&tracked.1);
    inside.then_some(tracked)
}

/// Rotation, uniform scale and translation:
/// `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Similarity {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    pub fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det <= f64::EPSILON || !det.is_finite() {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    /// Least squares over all pairs; `None` when the sources coincide.
    fn fit(src: &[Point], dst: &[Point]) -> Option<Self> {
        let n = src.len().min(dst.len());
        if n < 2 {
            return None;
        }
        let mean = |pts: &[Point]| {
            let (sx, sy) = pts[..n].iter().fold((0f64, 0f64), |acc, p| (acc.0 + p.0 as f64, acc.1 + p.1 as f64));
            (sx / n as f64, sy / n as f64)
        };
        let (pmx, pmy) = mean(src);
        let (qmx, qmy) = mean(dst);

        let (mut norm, mut dot, mut cross) = (0f64, 0f64, 0f64);
        for (p, q) in src.iter().zip(dst) {
            let (px, py) = (p.0 as f64 - pmx, p.1 as f64 - pmy);
            let (qx, qy) = (q.0 as f64 - qmx, q.1 as f64 - qmy);
            norm += px * px + py * py;
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
        }
        if norm <= f64::EPSILON {
            return None;
        }
        let (a, b) = (dot / norm, cross / norm);
        let model = Self {
            a,
            b,
            tx: qmx - a * pmx + b * pmy,
            ty: qmy - b * pmx - a * pmy,
        };
        [model.a, model.b, model.tx, model.ty].iter().all(|v| v.is_finite()).then_some(model)
    }

    fn residual_sq(&self, p: Point, q: Point) -> f64 {
        let (x, y) = self.apply(p.0 as f64, p.1 as f64);
        (x - q.0 as f64).powi(2) + (y - q.1 as f64).powi(2)
    }
}

/// Robust similarity fit: seeded RANSAC over two-point samples, then least
/// squares over the best inlier set.
pub fn estimate_partial_affine(src: &[Point], dst: &[Point]) -> Option<Similarity> {
    let n = src.len().min(dst.len());
    if n < 2 {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let threshold_sq = RANSAC_THRESHOLD * RANSAC_THRESHOLD;
    let mut best: Vec<usize> = Vec::new();

    for _ in 0..RANSAC_ITERATIONS {
        let i = rng.gen_range(0..n);
        let mut j = rng.gen_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        let Some(model) = Similarity::fit(&[src[i], src[j]], &[dst[i], dst[j]]) else {
            continue;
        };
        let inliers: Vec<usize> = (0..n).filter(|&k| model.residual_sq(src[k], dst[k]) <= threshold_sq).collect();
        if inliers.len() > best.len() {
            best = inliers;
            if best.len() == n {
                break;
            }
        }
    }

    if best.len() < 2 {
        return None;
    }
    let inlier_src: Vec<Point> = best.iter().map(|&k| src[k]).collect();
    let inlier_dst: Vec<Point> = best.iter().map(|&k| dst[k]).collect();
    Similarity::fit(&inlier_src, &inlier_dst)
}

/// Applies `transform` as a forward map: output pixel `x` comes from
/// `transform⁻¹(x)` in `img`. Pixels mapped from outside the frame are black.
pub fn warp(img: &RgbImage, transform: &Similarity) -> RgbImage {
    let Some(inverse) = transform.invert() else {
        return img.clone();
    };
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let (sx, sy) = inverse.apply(x as f64, y as f64);
        sample_rgb(img, sx, sy)
    })
}

fn sample_rgb(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = (img.width() as i64, img.height() as i64);
    if !(x > -1.0 && y > -1.0 && x < w as f64 && y < h as f64) {
        return Rgb([0, 0, 0]);
    }
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);
    let fetch = |xi: i64, yi: i64| -> [f64; 3] {
        if xi < 0 || yi < 0 || xi >= w || yi >= h {
            [0.0; 3]
        } else {
            let p = img.get_pixel(xi as u32, yi as u32);
            [p[0] as f64, p[1] as f64, p[2] as f64]
        }
    };
    let (p00, p10, p01, p11) = (fetch(x0, y0), fetch(x0 + 1, y0), fetch(x0, y0 + 1), fetch(x0 + 1, y0 + 1));
    Rgb([0, 1, 2].map(|c| {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

fn frame_transform(prev: &Pyramid, curr: &Pyramid) -> Option<Similarity> {
    let corners = good_features(&prev.levels[0]);
    if corners.len() < MIN_CORRESPONDENCES {
        return None;
    }
    let (src, dst): (Vec<Point>, Vec<Point>) = corners
        .iter()
        .zip(track_points(prev, curr, &corners))
        .filter_map(|(&p, q)| q.map(|q| (p, q)))
        .unzip();
    if src.len() < MIN_CORRESPONDENCES {
        return None;
    }
    estimate_partial_affine(&src, &dst)
}

/// Never fails and never changes the frame count.
pub fn stabilize(frames: &FrameStream) -> FrameStream {
    if frames.len() < 2 {
        return frames.clone();
    }
    let mut out = Vec::with_capacity(frames.len());
    out.push(frames[0].clone());

    let mut prev = Pyramid::new(Plane::from_rgb(&frames[0]));
    let mut warped = 0usize;
    for frame in frames.iter().skip(1) {
        let curr = Pyramid::new(Plane::from_rgb(frame));
        match frame_transform(&prev, &curr) {
            Some(transform) => {
                warped += 1;
                out.push(warp(frame, &transform));
            }
            None => out.push(frame.clone()),
        }
        prev = curr;
    }
    debug!("stabilized {}/{} frames", warped, frames.len() - 1);

    FrameStream::from_frames(out).unwrap_or_else(|_| frames.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn blob(w: u32, h: u32, cx: f32, cy: f32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            let v = (20.0 + 200.0 * (-d2 / (2.0 * 25.0)).exp()) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn single_frame_passes_through() {
        let frames = FrameStream::from_frames(vec![super::super::test_frame(8, 8)]).unwrap();
        assert_eq!(stabilize(&frames), frames);
    }

    #[test]
    fn featureless_frames_pass_through() {
        let frames = FrameStream::from_frames(vec![RgbImage::from_pixel(40, 30, Rgb([90, 90, 90])); 3]).unwrap();
        assert!(good_features(&Plane::from_rgb(&frames[0])).is_empty());
        assert_eq!(stabilize(&frames), frames);
    }

    #[test]
    fn textured_frames_keep_count_and_size() {
        let frames = FrameStream::from_frames(vec![
            super::super::test_frame(48, 40),
            super::super::test_frame(48, 40),
            super::super::test_frame(48, 40),
        ])
        .unwrap();
        let out = stabilize(&frames);
        assert_eq!(out.len(), 3);
        assert_eq!(out.dimensions(), Some((48, 40)));
    }

    #[test]
    fn lucas_kanade_follows_a_shifted_blob() {
        let prev = Pyramid::new(Plane::from_rgb(&blob(64, 64, 32.0, 32.0)));
        let curr = Pyramid::new(Plane::from_rgb(&blob(64, 64, 34.0, 31.0)));
        assert_eq!(prev.levels.len(), 2);

        let tracked = track_points(&prev, &curr, &[(32.0, 32.0)]);
        let (x, y) = tracked[0].expect("blob should be tracked");
        assert!((x - 34.0).abs() < 0.25, "x = {x}");
        assert!((y - 31.0).abs() < 0.25, "y = {y}");
    }

    #[test]
    fn flat_window_is_not_tracked() {
        let flat = Pyramid::new(Plane::from_rgb(&RgbImage::from_pixel(30, 30, Rgb([50, 50, 50]))));
        assert_eq!(track_points(&flat, &flat, &[(15.0, 15.0)]), vec![None]);
    }

    #[test]
    fn similarity_survives_an_outlier() {
        let truth = Similarity { a: 1.02 * 0.05f64.cos(), b: 1.02 * 0.05f64.sin(), tx: 3.5, ty: -2.0 };
        let src: Vec<Point> = (0..12).map(|i| ((i % 4) as f32 * 40.0 + 10.0, (i / 4) as f32 * 35.0 + 5.0)).collect();
        let mut dst: Vec<Point> = src
            .iter()
            .map(|&(x, y)| {
                let (qx, qy) = truth.apply(x as f64, y as f64);
                (qx as f32, qy as f32)
            })
            .collect();
        dst[5] = (500.0, -300.0);

        let fit = estimate_partial_affine(&src, &dst).unwrap();
        assert!((fit.a - truth.a).abs() < 1e-4);
        assert!((fit.b - truth.b).abs() < 1e-4);
        assert!((fit.tx - truth.tx).abs() < 1e-2);
        assert!((fit.ty - truth.ty).abs() < 1e-2);
    }

    #[test]
    fn coincident_points_have_no_fit() {
        assert_eq!(estimate_partial_affine(&[(1.0, 1.0); 5], &[(2.0, 2.0); 5]), None);
    }

    #[test]
    fn identity_warp_is_exact() {
        let img = super::super::test_frame(13, 9);
        assert_eq!(warp(&img, &Similarity::IDENTITY), img);
    }

    #[test]
    fn translation_warp_shifts_and_blacks_out() {
        let img = super::super::test_frame(10, 6);
        let out = warp(&img, &Similarity { tx: 2.0, ..Similarity::IDENTITY });
        assert_eq!(out.get_pixel(5, 3), img.get_pixel(3, 3));
        assert_eq!(out.get_pixel(0, 3), &Rgb([0, 0, 0]));
    }
}
