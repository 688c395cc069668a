//! Offline backends that need no model weights. They let the local path run
//! end to end on any machine, with deterministic output for a given seed.

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{ImageBackend, ImageRequest, SegmentBackend};
use crate::error::{BackendError, BackendResult};

const BLOBS: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct ProceduralImageBackend;

impl ProceduralImageBackend {
    pub fn new() -> Self {
        Self
    }
}

/// FNV-1a, stable across runs and platforms.
fn prompt_hash(prompt: &str) -> u64 {
    prompt.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3))
}

fn random_color(rng: &mut StdRng) -> [f32; 3] {
    [rng.gen_range(0.0..255.0), rng.gen_range(0.0..255.0), rng.gen_range(0.0..255.0)]
}

#[async_trait]
impl ImageBackend for ProceduralImageBackend {
    fn name(&self) -> &str {
        "procedural"
    }

    async fn generate(&self, request: &ImageRequest) -> BackendResult<RgbImage> {
        let (w, h) = (request.width, request.height);
        if w == 0 || h == 0 {
            return Err(BackendError::InvalidResponse(format!("cannot paint a {w}x{h} image")));
        }
        let seed = request.seed.unwrap_or(0) ^ prompt_hash(&request.prompt);
        debug!("procedural keyframe {}x{} seed={:#x}", w, h, seed);

        let mut rng = StdRng::seed_from_u64(seed);
        let top = random_color(&mut rng);
        let bottom = random_color(&mut rng);
        let blobs: Vec<([f32; 2], f32, [f32; 3])> = (0..BLOBS)
            .map(|_| {
                let center = [rng.gen_range(0.0..w as f32), rng.gen_range(0.0..h as f32)];
                let radius = rng.gen_range(0.08..0.3) * w.min(h) as f32;
                (center, radius, random_color(&mut rng))
            })
            .collect();

        let image = RgbImage::from_fn(w, h, |x, y| {
            let t = if h > 1 { y as f32 / (h - 1) as f32 } else { 0.0 };
            let mut px = [0f32; 3];
            for c in 0..3 {
                px[c] = top[c] + (bottom[c] - top[c]) * t;
            }
            for (center, radius, color) in &blobs {
                let dx = x as f32 - center[0];
                let dy = y as f32 - center[1];
                let weight = (-(dx * dx + dy * dy) / (2.0 * radius * radius)).exp() * 0.8;
                for c in 0..3 {
                    px[c] += (color[c] - px[c]) * weight;
                }
            }
            Rgb(px.map(|v| v.clamp(0.0, 255.0) as u8))
        });
        Ok(image)
    }
}

/// Animates a keyframe with a slow push-in and drift.
#[derive(Debug, Clone)]
pub struct ProceduralSegmentBackend {
    native_frames: usize,
}

impl ProceduralSegmentBackend {
    pub fn new(native_frames: usize) -> Self {
        Self { native_frames: native_frames.max(2) }
    }
}

impl Default for ProceduralSegmentBackend {
    fn default() -> Self {
        Self::new(25)
    }
}

#[async_trait]
impl SegmentBackend for ProceduralSegmentBackend {
    fn name(&self) -> &str {
        "procedural"
    }

    async fn generate(
        &self,
        start: &RgbImage,
        frame_count: usize,
        motion_bucket_id: u8,
        _noise_aug_strength: f32,
    ) -> BackendResult<Vec<RgbImage>> {
        let (w, h) = start.dimensions();
        if w == 0 || h == 0 {
            return Err(BackendError::InvalidResponse("empty start frame".into()));
        }
        debug!(
            "procedural clip: {} native frames (requested {}), motion={}",
            self.native_frames, frame_count, motion_bucket_id
        );

        // Stronger motion buckets zoom further, up to 15% of the frame.
        let max_zoom = 0.15 * (motion_bucket_id as f32 / 255.0);
        let last = (self.native_frames - 1) as f32;
        let start = start.clone();
        let native_frames = self.native_frames;

        let frames = tokio::task::spawn_blocking(move || {
            (0..native_frames)
                .map(|i| {
                    let t = i as f32 / last;
                    let scale = 1.0 - max_zoom * t;
                    let cw = ((w as f32 * scale).round() as u32).clamp(1, w);
                    let ch = ((h as f32 * scale).round() as u32).clamp(1, h);
                    if (cw, ch) == (w, h) {
                        return start.clone();
                    }
                    // Drift right as we push in.
                    let x = (((w - cw) as f32) * (0.5 + 0.5 * t)).round() as u32;
                    let y = (h - ch) / 2;
                    let crop = imageops::crop_imm(&start, x.min(w - cw), y, cw, ch).to_image();
                    imageops::resize(&crop, w, h, FilterType::Triangle)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| BackendError::Unknown(format!("segment task failed: {e}")))?;

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(prompt: &str, seed: Option<u64>) -> ImageRequest {
        ImageRequest {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            width: 32,
            height: 24,
            seed,
        }
    }

    #[tokio::test]
    async fn same_seed_same_image() {
        let backend = ProceduralImageBackend::new();
        let a = backend.generate(&request("a fox", Some(7))).await.unwrap();
        let b = backend.generate(&request("a fox", Some(7))).await.unwrap();
        let c = backend.generate(&request("a fox", Some(8))).await.unwrap();
        assert_eq!(a.dimensions(), (32, 24));
        assert!(a == b);
        assert!(a != c);
    }

    #[tokio::test]
    async fn clip_has_native_length_and_starts_on_keyframe() {
        let start = RgbImage::from_fn(16, 12, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 50]));
        let clip = ProceduralSegmentBackend::new(9).generate(&start, 40, 127, 0.02).await.unwrap();
        assert_eq!(clip.len(), 9);
        assert!(clip[0] == start);
        assert!(clip.iter().all(|f| f.dimensions() == (16, 12)));
    }

    #[tokio::test]
    async fn zero_size_is_rejected() {
        let mut req = request("a fox", None);
        req.width = 0;
        assert!(ProceduralImageBackend::new().generate(&req).await.is_err());
    }
}
