use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::postprocess::{CinematicAspect, PostProcessOptions};
use crate::scene::Style;

pub const MIN_PROMPT_CHARS: usize = 5;
pub const MAX_PROMPT_CHARS: usize = 1000;
pub const MIN_DURATION_SECS: u32 = 1;
pub const MAX_DURATION_SECS: u32 = 60;
pub const MIN_KEYFRAMES: usize = 2;
pub const MAX_KEYFRAMES: usize = 16;
/// Render cost of one 1920x1080 frame, the baseline for time estimates.
pub const SECONDS_PER_FULL_HD_FRAME: f64 = 0.5;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default)]
    pub fps: Fps,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_keyframes")]
    pub keyframes: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub style: Option<Style>, // overrides the detected style
    #[serde(default = "enabled")]
    pub color_grading: bool,
    #[serde(default = "enabled")]
    pub upscaling: bool,
    #[serde(default)]
    pub stabilization: bool,
    #[serde(default)]
    pub cinematic_bars: Option<CinematicAspect>,
    #[serde(default)]
    pub method: GenerationMethod,
    #[serde(default)]
    pub prefer_local: Option<bool>,
}

fn default_duration() -> u32 {
    10
}

fn default_keyframes() -> usize {
    5
}

fn enabled() -> bool {
    true
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            duration: default_duration(),
            fps: Fps::default(),
            resolution: Resolution::default(),
            keyframes: default_keyframes(),
            seed: None,
            style: None,
            color_grading: true,
            upscaling: true,
            stabilization: false,
            cinematic_bars: None,
            method: GenerationMethod::Auto,
            prefer_local: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.prompt.trim().chars().count() < MIN_PROMPT_CHARS {
            return Err(ValidationError::PromptTooShort { min: MIN_PROMPT_CHARS });
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(ValidationError::PromptTooLong { max: MAX_PROMPT_CHARS });
        }
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&self.duration) {
            return Err(ValidationError::DurationOutOfRange {
                min: MIN_DURATION_SECS,
                max: MAX_DURATION_SECS,
                got: self.duration,
            });
        }
        if !(MIN_KEYFRAMES..=MAX_KEYFRAMES).contains(&self.keyframes) {
            return Err(ValidationError::KeyframesOutOfRange {
                min: MIN_KEYFRAMES,
                max: MAX_KEYFRAMES,
                got: self.keyframes,
            });
        }
        Ok(())
    }

    /// Validates and resolves the request into what the backends consume.
    pub fn into_video_request(
        self,
        output_dir: &Path,
        now: DateTime<Local>,
    ) -> Result<VideoRequest, ValidationError> {
        self.validate()?;
        let output = output_path(output_dir, &self.prompt, now);
        Ok(VideoRequest {
            settings: RenderSettings {
                fps: self.fps,
                resolution: self.resolution,
                keyframes: self.keyframes,
                seed: self.seed,
                style: self.style,
                post: PostProcessOptions {
                    upscale: self.upscaling,
                    color_grade: self.color_grading,
                    sharpen: true,
                    stabilize: self.stabilization,
                    cinematic_bars: self.cinematic_bars,
                },
            },
            prompt: self.prompt,
            duration: self.duration,
            method: self.method,
            prefer_local: self.prefer_local,
            output,
        })
    }
}

/// A validated request, shared by every backend.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    pub duration: u32,
    pub settings: RenderSettings,
    pub method: GenerationMethod,
    pub prefer_local: Option<bool>,
    pub output: PathBuf,
}

impl VideoRequest {
    /// Frame count times per-frame cost, scaled by pixel area against 1080p.
    pub fn estimated_generation_time(&self) -> Duration {
        let frames = f64::from(self.duration) * f64::from(self.settings.fps.get());
        let (width, height) = self.settings.resolution.dimensions();
        let area = f64::from(width) * f64::from(height) / (1920.0 * 1080.0);
        Duration::from_secs_f64(frames * SECONDS_PER_FULL_HD_FRAME * area)
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub fps: Fps,
    pub resolution: Resolution,
    pub keyframes: usize,
    pub seed: Option<u64>,
    pub style: Option<Style>,
    pub post: PostProcessOptions,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            fps: Fps::default(),
            resolution: Resolution::default(),
            keyframes: default_keyframes(),
            seed: None,
            style: None,
            post: PostProcessOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Fps {
    F24,
    #[default]
    F30,
    F60,
}

impl Fps {
    pub fn get(self) -> u32 {
        match self {
            Self::F24 => 24,
            Self::F30 => 30,
            Self::F60 => 60,
        }
    }
}

impl TryFrom<u32> for Fps {
    type Error = String;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            24 => Ok(Self::F24),
            30 => Ok(Self::F30),
            60 => Ok(Self::F60),
            other => Err(format!("fps must be one of 24, 30, 60, got {other}")),
        }
    }
}

impl From<Fps> for u32 {
    fn from(f: Fps) -> Self {
        f.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "720p")]
    Hd,
    #[default]
    #[serde(rename = "1080p")]
    FullHd,
    #[serde(rename = "4K", alias = "4k")]
    Uhd,
}

impl Resolution {
    /// (width, height) in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Hd => (1280, 720),
            Self::FullHd => (1920, 1080),
            Self::Uhd => (3840, 2160),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    HuggingFace,
    Replicate,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::HuggingFace => "huggingface",
            Self::Replicate => "replicate",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMethod {
    #[default]
    Auto,
    Local,
    #[serde(alias = "hf")]
    HuggingFace,
    Replicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success { output: PathBuf },
    Failure { reason: String },
}

/// One backend invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationAttempt {
    pub backend: BackendKind,
    pub prompt: String,
    pub duration: u32,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl GenerationAttempt {
    pub fn failed(backend: BackendKind, prompt: &str, duration: u32, reason: impl Into<String>) -> Self {
        Self {
            backend,
            prompt: prompt.to_string(),
            duration,
            outcome: AttemptOutcome::Failure { reason: reason.into() },
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            AttemptOutcome::Failure { reason } => Some(reason),
            AttemptOutcome::Success { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub output: PathBuf,
    pub backend: BackendKind,
    pub attempts: Vec<GenerationAttempt>,
}

/// `<dir>/video_<sanitized prompt prefix>_<timestamp>.mp4`
pub fn output_path(dir: &Path, prompt: &str, now: DateTime<Local>) -> PathBuf {
    let prefix: String = prompt.chars().take(30).collect();
    let name = format!(
        "video_{}_{}.mp4",
        sanitize_filename(&prefix),
        now.format("%Y%m%d_%H%M%S")
    );
    dir.join(name)
}

/// Contact sheet written next to a locally rendered video.
pub fn preview_path(output: &Path) -> PathBuf {
    output.with_extension("preview.png")
}

/// `video_x.mp4` -> `video_x_<n>.mp4`
pub fn numbered_path(path: &Path, n: u32) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(name)
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .map(|c| if c == ' ' { '_' } else { c })
        .take(100)
        .collect()
}
