use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tracing::{debug, info, warn};

use crate::backend::SegmentBackend;
use crate::error::{BackendError, BackendResult};
use crate::frame::FrameStream;
use crate::keyframes::Keyframe;
use crate::progress::ProgressReporter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionParams {
    pub motion_bucket_id: u8,
    pub noise_aug_strength: f32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            motion_bucket_id: 127,
            noise_aug_strength: 0.02,
        }
    }
}

/// Frames between one keyframe and the next, start keyframe first.
#[derive(Debug, Clone)]
pub struct Segment {
    pub start_index: usize,
    pub frames: Vec<RgbImage>,
    /// The backend failed and the start keyframe was held instead.
    pub held: bool,
}

/// Stitched frames plus how many segments fell back to a held keyframe.
#[derive(Debug, Clone)]
pub struct Interpolation {
    pub frames: FrameStream,
    pub held_segments: usize,
}

pub fn target_frame_count(duration_per_keyframe: f32, fps: u32) -> usize {
    ((duration_per_keyframe * fps as f32).round() as usize).max(1)
}

/// Linear temporal resampling of `src` to exactly `target` frames.
/// The first and last output frames equal the first and last input frames.
pub fn resample_linear(src: &[RgbImage], target: usize) -> Vec<RgbImage> {
    if src.is_empty() || target == 0 {
        return Vec::new();
    }
    if src.len() == target {
        return src.to_vec();
    }
    let last = src.len() - 1;
    let span = target.saturating_sub(1).max(1) as f32;

    (0..target)
        .map(|j| {
            let position = j as f32 / span * last.max(1) as f32;
            let lo = (position.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            let w = position - lo as f32;
            if lo == hi || w <= f32::EPSILON {
                return src[lo].clone();
            }
            blend(&src[lo], &src[hi], w)
        })
        .collect()
}

fn blend(a: &RgbImage, b: &RgbImage, w: f32) -> RgbImage {
    RgbImage::from_fn(a.width(), a.height(), |x, y| {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        Rgb([0, 1, 2].map(|c| ((1.0 - w) * pa[c] as f32 + w * pb[c] as f32).round().clamp(0.0, 255.0) as u8))
    })
}

/// Joins segments, dropping each segment's last frame except the final one's
/// so shared keyframes are not doubled.
pub fn stitch(segments: Vec<Segment>) -> Result<FrameStream, crate::error::FrameError> {
    let total: usize = segments.iter().map(|s| s.frames.len()).sum();
    let mut stream = FrameStream::with_capacity(total);
    let count = segments.len();
    for (i, segment) in segments.into_iter().enumerate() {
        let mut frames = segment.frames;
        if i + 1 < count {
            frames.pop();
        }
        stream.extend(frames)?;
    }
    Ok(stream)
}

pub struct SegmentInterpolator {
    backend: Arc<dyn SegmentBackend>,
    fps: u32,
}

impl SegmentInterpolator {
    pub fn new(backend: Arc<dyn SegmentBackend>, fps: u32) -> Self {
        Self { backend, fps }
    }

    /// One segment per adjacent keyframe pair, stitched into a single stream.
    pub async fn interpolate_between_keyframes(
        &self,
        keyframes: &[Keyframe],
        duration_per_keyframe: f32,
        motion: MotionParams,
        progress: &ProgressReporter,
    ) -> BackendResult<Interpolation> {
        let target = target_frame_count(duration_per_keyframe, self.fps);
        let pairs = keyframes.len().saturating_sub(1);
        info!("🎞️ Interpolating {} segments of {} frames with {}", pairs, target, self.backend.name());

        let mut segments = Vec::with_capacity(pairs);
        for (i, pair) in keyframes.windows(2).enumerate() {
            progress.note(format!("Segment {}/{}", i + 1, pairs));
            let segment = self.segment(&pair[0], target, motion).await;
            self.backend.release_resources();
            segments.push(segment);
        }
        if segments.is_empty() {
            if let Some(only) = keyframes.first() {
                segments.push(held_segment(only, target));
            }
        }

        let held_segments = segments.iter().filter(|s| s.held).count();
        let frames = tokio::task::spawn_blocking(move || stitch(segments))
            .await
            .map_err(|e| BackendError::Unknown(format!("stitch task failed: {e}")))??;
        info!("✅ Stitched {} frames ({} held segments)", frames.len(), held_segments);
        Ok(Interpolation { frames, held_segments })
    }

    async fn segment(&self, start: &Keyframe, target: usize, motion: MotionParams) -> Segment {
        let clip = self
            .backend
            .generate(&start.image, target, motion.motion_bucket_id, motion.noise_aug_strength)
            .await;
        let clip = match clip {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => {
                warn!("⚠️ Segment {} came back empty, holding keyframe", start.index);
                return held_segment(start, target);
            }
            Err(e) => {
                warn!("⚠️ Segment {} failed, holding keyframe: {}", start.index, e);
                return held_segment(start, target);
            }
        };

        let (w, h) = start.image.dimensions();
        let index = start.index;
        let resampled = tokio::task::spawn_blocking(move || {
            let clip: Vec<RgbImage> = clip
                .into_iter()
                .map(|f| if f.dimensions() == (w, h) { f } else { imageops::resize(&f, w, h, FilterType::Triangle) })
                .collect();
            if clip.len() != target {
                debug!("segment {}: resampling {} -> {} frames", index, clip.len(), target);
            }
            resample_linear(&clip, target)
        })
        .await;

        match resampled {
            Ok(frames) => Segment { start_index: index, frames, held: false },
            Err(e) => {
                warn!("⚠️ Segment {} resampling failed, holding keyframe: {}", index, e);
                held_segment(start, target)
            }
        }
    }
}

fn held_segment(start: &Keyframe, target: usize) -> Segment {
    Segment {
        start_index: start.index,
        frames: vec![start.image.clone(); target],
        held: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframes::{placeholder_image, TemporalHint};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn solid(v: u8) -> RgbImage {
        RgbImage::from_pixel(4, 3, Rgb([v, v, v]))
    }

    fn keyframe(index: usize, v: u8) -> Keyframe {
        Keyframe { index, hint: TemporalHint::Beginning, image: solid(v), placeholder: false }
    }

    /// Ramps from the start frame's value upwards, `len` frames.
    struct Ramp {
        len: usize,
        fail_on_value: Option<u8>,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl SegmentBackend for Ramp {
        fn name(&self) -> &str {
            "ramp"
        }

        async fn generate(&self, start: &RgbImage, _: usize, _: u8, _: f32) -> BackendResult<Vec<RgbImage>> {
            let v = start.get_pixel(0, 0)[0];
            if Some(v) == self.fail_on_value {
                return Err(BackendError::Unknown("gpu fell over".into()));
            }
            Ok((0..self.len).map(|i| solid(v + i as u8)).collect())
        }

        fn release_resources(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn target_count_rounds_and_floors_at_one() {
        assert_eq!(target_frame_count(2.5, 30), 75);
        assert_eq!(target_frame_count(0.01, 24), 1);
    }

    #[test]
    fn resample_keeps_endpoints() {
        let src: Vec<_> = (0..25).map(|i| solid(i * 10)).collect();
        let out = resample_linear(&src, 75);
        assert_eq!(out.len(), 75);
        assert!(out[0] == src[0]);
        assert!(out[74] == src[24]);
        // Halfway: position 37/74*24 = 12.
        assert_eq!(out[37].get_pixel(0, 0)[0], 120);

        let down = resample_linear(&src, 5);
        let values: Vec<u8> = down.iter().map(|f| f.get_pixel(0, 0)[0]).collect();
        assert_eq!(values, vec![0, 60, 120, 180, 240]);
    }

    #[test]
    fn resample_to_single_frame_keeps_the_first() {
        let src: Vec<_> = (0..25).map(|i| solid(i * 10)).collect();
        let out = resample_linear(&src, 1);
        assert_eq!(out.len(), 1);
        assert!(out[0] == src[0]);
    }

    #[test]
    fn resample_blends_between_neighbours() {
        let src = vec![solid(0), solid(100)];
        let out = resample_linear(&src, 3);
        let values: Vec<u8> = out.iter().map(|f| f.get_pixel(1, 1)[0]).collect();
        assert_eq!(values, vec![0, 50, 100]);
        assert_eq!(resample_linear(&[solid(7)], 3).len(), 3);
    }

    #[test]
    fn stitch_drops_shared_frames() {
        let segments = (0..4)
            .map(|i| Segment { start_index: i, frames: vec![solid(i as u8); 75], held: false })
            .collect();
        assert_eq!(stitch(segments).unwrap().len(), 3 * 74 + 75);
    }

    #[tokio::test]
    async fn failed_segment_holds_start_keyframe() {
        let backend = Arc::new(Ramp { len: 25, fail_on_value: Some(50), releases: AtomicUsize::new(0) });
        let interpolator = SegmentInterpolator::new(backend.clone(), 10);
        let keyframes = vec![keyframe(0, 0), keyframe(1, 50), keyframe(2, 100)];

        let result = interpolator
            .interpolate_between_keyframes(&keyframes, 1.0, MotionParams::default(), &ProgressReporter::disabled())
            .await
            .unwrap();
        let stream = &result.frames;
        assert_eq!(result.held_segments, 1);

        // Two segments of 10: 9 + 10.
        assert_eq!(stream.len(), 19);
        assert_eq!(stream[0].get_pixel(0, 0)[0], 0);
        assert!(stream.iter().skip(9).all(|f| f == &keyframes[1].image));
        assert_eq!(backend.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mismatched_clip_frames_are_resized() {
        struct Big;

        #[async_trait]
        impl SegmentBackend for Big {
            fn name(&self) -> &str {
                "big"
            }

            async fn generate(&self, _: &RgbImage, _: usize, _: u8, _: f32) -> BackendResult<Vec<RgbImage>> {
                Ok(vec![placeholder_image(8, 8); 3])
            }
        }

        let stream = SegmentInterpolator::new(Arc::new(Big), 4)
            .interpolate_between_keyframes(
                &[keyframe(0, 0), keyframe(1, 9)],
                1.0,
                MotionParams::default(),
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap()
            .frames;
        assert_eq!(stream.len(), 4);
        assert_eq!(stream.dimensions(), Some((4, 3)));
    }
}
