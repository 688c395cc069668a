use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tracing::{info, warn};

use crate::backend::{ImageBackend, ImageRequest};
use crate::progress::ProgressReporter;

pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted, deformed, ugly, watermark, text, signature, bad anatomy";

const PLACEHOLDER_GRAY: u8 = 128;

/// Where a keyframe sits in the scene, phrased for the image model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalHint {
    Beginning,
    Early,
    Middle,
    Later,
}

impl TemporalHint {
    /// `index` of `count` keyframes, spread evenly over `[0, 1]`.
    pub fn for_position(index: usize, count: usize) -> Self {
        let progress = index as f32 / count.saturating_sub(1).max(1) as f32;
        match progress {
            p if p < 0.25 => Self::Beginning,
            p if p < 0.5 => Self::Early,
            p if p < 0.75 => Self::Middle,
            _ => Self::Later,
        }
    }

    pub fn phrase(self) -> &'static str {
        match self {
            Self::Beginning => "beginning of scene, ",
            Self::Early => "early in scene, ",
            Self::Middle => "middle of scene, ",
            Self::Later => "later in scene, ",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyframe {
    pub index: usize,
    pub hint: TemporalHint,
    pub image: RgbImage,
    /// Set when the backend failed and a gray frame stands in.
    pub placeholder: bool,
}

pub struct KeyframeGenerator {
    backend: Arc<dyn ImageBackend>,
    width: u32,
    height: u32,
    negative_prompt: String,
}

impl KeyframeGenerator {
    pub fn new(backend: Arc<dyn ImageBackend>, width: u32, height: u32) -> Self {
        Self {
            backend,
            width,
            height,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    /// Always returns `count` keyframes; failed calls become gray placeholders.
    pub async fn generate_keyframes(
        &self,
        prompt: &str,
        count: usize,
        seed: Option<u64>,
        progress: &ProgressReporter,
    ) -> Vec<Keyframe> {
        self.generate_with(prompt, count, |_| seed, progress).await
    }

    /// Like [`generate_keyframes`](Self::generate_keyframes) but keyframe `i`
    /// is seeded with `seed + i`.
    pub async fn generate_consistent_keyframes(
        &self,
        prompt: &str,
        count: usize,
        seed: u64,
        progress: &ProgressReporter,
    ) -> Vec<Keyframe> {
        self.generate_with(prompt, count, |i| Some(seed.wrapping_add(i as u64)), progress)
            .await
    }

    async fn generate_with<F>(
        &self,
        prompt: &str,
        count: usize,
        seed_for: F,
        progress: &ProgressReporter,
    ) -> Vec<Keyframe>
    where
        F: Fn(usize) -> Option<u64>,
    {
        info!("🖼️ Generating {} keyframes with {}", count, self.backend.name());
        let mut keyframes = Vec::with_capacity(count);

        for index in 0..count {
            let hint = TemporalHint::for_position(index, count);
            progress.note(format!("Keyframe {}/{}", index + 1, count));
            let request = ImageRequest {
                prompt: format!("{}{}", hint.phrase(), prompt),
                negative_prompt: self.negative_prompt.clone(),
                width: self.width,
                height: self.height,
                seed: seed_for(index),
            };

            let (image, placeholder) = match self.backend.generate(&request).await {
                Ok(img) if img.dimensions() == (self.width, self.height) => (img, false),
                Ok(img) => (imageops::resize(&img, self.width, self.height, FilterType::Lanczos3), false),
                Err(e) => {
                    warn!("⚠️ Keyframe {}/{} failed, using placeholder: {}", index + 1, count, e);
                    (placeholder_image(self.width, self.height), true)
                }
            };
            self.backend.release_resources();

            keyframes.push(Keyframe { index, hint, image, placeholder });
        }

        keyframes
    }
}

pub fn placeholder_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([PLACEHOLDER_GRAY; 3]))
}

/// Lanczos resize to exactly `width` x `height`; aspect ratio is not preserved.
pub fn upscale_keyframe(keyframe: &Keyframe, width: u32, height: u32) -> Keyframe {
    let image = if keyframe.image.dimensions() == (width, height) {
        keyframe.image.clone()
    } else {
        imageops::resize(&keyframe.image, width, height, FilterType::Lanczos3)
    };
    Keyframe { image, ..keyframe.clone() }
}
