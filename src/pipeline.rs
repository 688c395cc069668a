//! The local generation chain: scene analysis, keyframes, interpolation,
//! post-processing and encoding, exposed as one [`VideoSource`].

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{ImageBackend, SegmentBackend, VideoSource};
use crate::encoder::FrameEncoder;
use crate::error::{BackendError, BackendResult, FrameError};
use crate::frame::FrameStream;
use crate::interpolate::{MotionParams, SegmentInterpolator};
use crate::keyframes::{upscale_keyframe, KeyframeGenerator};
use crate::models::{preview_path, BackendKind, VideoRequest};
use crate::postprocess::{contact_sheet, create_preview, PostProcessor};
use crate::progress::ProgressReporter;
use crate::scene::{self, SceneDescription};

const STEPS: u32 = 6;
pub const DEFAULT_KEYFRAME_SIZE: (u32, u32) = (1024, 1024);
pub const DEFAULT_CRF: u8 = 18;
const PREVIEW_FRAMES: usize = 10;
const PREVIEW_THUMB_WIDTH: u32 = 160;

/// What a local run produced, degraded stages included.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scene: SceneDescription,
    pub enhanced_prompt: String,
    pub keyframes: usize,
    pub placeholder_keyframes: usize,
    pub held_segments: usize,
    pub frames: usize,
    pub width: u32,
    pub height: u32,
}

pub struct LocalPipeline {
    image: Arc<dyn ImageBackend>,
    segments: Arc<dyn SegmentBackend>,
    encoder: Arc<dyn FrameEncoder>,
    keyframe_size: (u32, u32),
    motion: MotionParams,
    crf: u8,
}

impl LocalPipeline {
    pub fn new(image: Arc<dyn ImageBackend>, segments: Arc<dyn SegmentBackend>, encoder: Arc<dyn FrameEncoder>) -> Self {
        Self {
            image,
            segments,
            encoder,
            keyframe_size: DEFAULT_KEYFRAME_SIZE,
            motion: MotionParams::default(),
            crf: DEFAULT_CRF,
        }
    }

    pub fn with_keyframe_size(mut self, width: u32, height: u32) -> Self {
        self.keyframe_size = (width, height);
        self
    }

    pub fn with_motion(mut self, motion: MotionParams) -> Self {
        self.motion = motion;
        self
    }

    pub fn with_crf(mut self, crf: u8) -> Self {
        self.crf = crf.min(51);
        self
    }

    /// Runs every stage up to, not including, encoding. Frames come out at
    /// `size` (width, height).
    pub async fn render(
        &self,
        request: &VideoRequest,
        size: (u32, u32),
        progress: &ProgressReporter,
    ) -> BackendResult<(FrameStream, RunSummary)> {
        let settings = &request.settings;

        progress.report(1, STEPS, "Analyzing prompt");
        let mut scene = scene::analyze(&request.prompt, request.duration);
        if let Some(style) = settings.style {
            scene = scene.with_style(style);
        }
        let enhanced_prompt = scene::create_enhanced_prompt(&scene);
        info!("🎬 Scene: subject={:?} action={} setting={} style={}", scene.subject, scene.action, scene.setting, scene.style);
        info!("📝 Enhanced prompt: {}", enhanced_prompt);

        progress.report(2, STEPS, "Generating keyframes");
        let (kw, kh) = self.keyframe_size;
        let keyframes = KeyframeGenerator::new(self.image.clone(), kw, kh)
            .generate_keyframes(&enhanced_prompt, settings.keyframes, settings.seed, progress)
            .await;
        let placeholder_keyframes = keyframes.iter().filter(|k| k.placeholder).count();

        progress.report(3, STEPS, format!("Upscaling keyframes to {}x{}", size.0, size.1));
        let keyframes = tokio::task::spawn_blocking(move || {
            keyframes.iter().map(|k| upscale_keyframe(k, size.0, size.1)).collect::<Vec<_>>()
        })
        .await
        .map_err(|e| BackendError::Unknown(format!("keyframe upscale task failed: {e}")))?;

        progress.report(4, STEPS, "Interpolating frames");
        let duration_per_keyframe = request.duration as f32 / keyframes.len().saturating_sub(1).max(1) as f32;
        let interpolation = SegmentInterpolator::new(self.segments.clone(), settings.fps.get())
            .interpolate_between_keyframes(&keyframes, duration_per_keyframe, self.motion, progress)
            .await?;

        progress.report(5, STEPS, "Post-processing");
        let options = settings.post;
        let raw = interpolation.frames;
        let frames = tokio::task::spawn_blocking(move || -> Result<FrameStream, FrameError> {
            let processed = match PostProcessor::new(size.0, size.1).process(&raw, &options)? {
                Cow::Owned(frames) => Some(frames),
                Cow::Borrowed(_) => None,
            };
            Ok(processed.unwrap_or(raw))
        })
        .await
        .map_err(|e| BackendError::Unknown(format!("post-processing task failed: {e}")))??;

        let (width, height) = frames.dimensions().unwrap_or(size);
        let summary = RunSummary {
            scene,
            enhanced_prompt,
            keyframes: keyframes.len(),
            placeholder_keyframes,
            held_segments: interpolation.held_segments,
            frames: frames.len(),
            width,
            height,
        };
        Ok((frames, summary))
    }
}

#[async_trait]
impl VideoSource for LocalPipeline {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn generate(&self, request: &VideoRequest, progress: &ProgressReporter) -> BackendResult<PathBuf> {
        let size = request.settings.resolution.dimensions();
        let (frames, summary) = self.render(request, size, progress).await?;

        progress.report(6, STEPS, format!("Encoding {} frames", frames.len()));
        let fps = request.settings.fps.get();
        let output = self.encoder.encode(&frames, fps, self.crf, &request.output).await?;

        info!(
            "✅ Local video complete: {} ({} frames, {:.2}s, {}x{}, {} placeholder keyframes, {} held segments)",
            output.display(),
            summary.frames,
            summary.frames as f32 / fps as f32,
            summary.width,
            summary.height,
            summary.placeholder_keyframes,
            summary.held_segments
        );
        save_preview(frames, preview_path(&output)).await;
        Ok(output)
    }

    fn shutdown(&self) {
        self.image.release_resources();
        self.segments.release_resources();
    }
}

/// Best effort: a missing preview never fails the video.
async fn save_preview(frames: FrameStream, path: PathBuf) {
    let target = path.clone();
    let saved = tokio::task::spawn_blocking(move || match contact_sheet(&create_preview(&frames, PREVIEW_FRAMES), PREVIEW_THUMB_WIDTH) {
        Some(sheet) => sheet.save(&target).map(|_| true),
        None => Ok(false),
    })
    .await;
    match saved {
        Ok(Ok(true)) => info!("🖼️ Preview saved: {}", path.display()),
        Ok(Ok(false)) => {}
        Ok(Err(e)) => warn!("Could not write preview {}: {}", path.display(), e),
        Err(e) => warn!("Preview task failed: {}", e),
    }
}
