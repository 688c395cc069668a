use std::time::Duration;

use thiserror::Error;

use crate::models::{BackendKind, GenerationAttempt};

/// Rejected before any backend is called.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("prompt must be at least {min} characters")]
    PromptTooShort { min: usize },
    #[error("prompt must be at most {max} characters")]
    PromptTooLong { max: usize },
    #[error("duration must be between {min} and {max} seconds, got {got}")]
    DurationOutOfRange { min: u32, max: u32, got: u32 },
    #[error("keyframe count must be between {min} and {max}, got {got}")]
    KeyframesOutOfRange { min: usize, max: usize, got: usize },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("rate limited by backend")]
    RateLimited { retry_after: Option<Duration> },
    #[error("model is still loading on the backend")]
    ModelLoading { estimated: Option<Duration> },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("encoder error: {0}")]
    Encoder(String),
    #[error("no sub-clip succeeded ({attempted} requested): {}", .reasons.join("; "))]
    NoClipsProduced { attempted: usize, reasons: Vec<String> },
    #[error("{0} backend is not configured")]
    NotConfigured(BackendKind),
    #[error("{0}")]
    Unknown(String),
}

impl BackendError {
    /// Worth asking the same backend again after a pause.
    pub fn is_retryable_later(&self) -> bool {
        matches!(self, Self::ModelLoading { .. })
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::ModelLoading { estimated } => *estimated,
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is {got_w}x{got_h}, stream is {want_w}x{want_h}")]
    SizeMismatch {
        want_w: u32,
        want_h: u32,
        got_w: u32,
        got_h: u32,
    },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("all generation methods failed: {}", summarize(.attempts))]
    AllMethodsFailed { attempts: Vec<GenerationAttempt> },
}

fn summarize(attempts: &[GenerationAttempt]) -> String {
    attempts
        .iter()
        .filter_map(|a| a.failure_reason().map(|r| format!("{}: {}", a.backend, r)))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
