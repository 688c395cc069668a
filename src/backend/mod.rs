//! Generation backends and the capability traits the pipeline talks to.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::RgbImage;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::error::{BackendError, BackendResult};
use crate::models::{BackendKind, VideoRequest};
use crate::progress::ProgressReporter;

pub mod chunked;
pub mod huggingface;
pub mod procedural;
pub mod replicate;
pub mod stable_diffusion;

pub use chunked::ChunkedRemote;
pub use huggingface::HuggingFaceApi;
pub use procedural::{ProceduralImageBackend, ProceduralSegmentBackend};
pub use replicate::ReplicateApi;
pub use stable_diffusion::StableDiffusionWebUi;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub seed: Option<u64>,
}

/// Text-to-image model. Same seed and prompt must give the same image.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &ImageRequest) -> BackendResult<RgbImage>;

    /// Hint issued between heavy calls; backends holding accelerator memory free it here.
    fn release_resources(&self) {}
}

/// Image-to-video model. The clip length is the backend's choice.
#[async_trait]
pub trait SegmentBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        start: &RgbImage,
        frame_count: usize,
        motion_bucket_id: u8,
        noise_aug_strength: f32,
    ) -> BackendResult<Vec<RgbImage>>;

    fn release_resources(&self) {}
}

/// Hosted text-to-video API returning an encoded clip.
#[async_trait]
pub trait RemoteVideoApi: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn generate(&self, prompt: &str, duration: u32) -> BackendResult<Bytes>;
}

/// One complete way of turning a request into a video file.
#[async_trait]
pub trait VideoSource: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn generate(&self, request: &VideoRequest, progress: &ProgressReporter) -> BackendResult<PathBuf>;

    fn shutdown(&self) {}
}

/// Maps a failed HTTP response onto the backend error taxonomy.
pub(crate) fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str) -> BackendError {
    match status {
        StatusCode::SERVICE_UNAVAILABLE => BackendError::ModelLoading {
            estimated: serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get("estimated_time").and_then(|t| t.as_f64()))
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64),
        },
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Auth(format!("status={} body={}", status, truncate(body, 300)))
        }
        _ => BackendError::Unknown(format!("status={} body={}", status, truncate(body, 300))),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...[{} chars total]", s.chars().take(max).collect::<String>(), s.chars().count())
    }
}
