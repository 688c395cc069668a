use std::path::PathBuf;
use std::time::Duration;

use crate::backend::{huggingface, replicate};
use crate::hybrid::{DEFAULT_LOADING_DELAY, DEFAULT_LOADING_RETRIES};
use crate::pipeline::DEFAULT_CRF;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CLIP_SECONDS: u32 = 14;

/// Runtime settings, read once at start-up. Unparseable values fall back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub hf_token: Option<String>,
    pub hf_api_base: String,
    pub hf_model: String,
    pub replicate_token: Option<String>,
    pub replicate_api_base: String,
    pub replicate_model: String,
    /// Stable Diffusion WebUI; the procedural painter is used when unset.
    pub local_sd_url: Option<String>,
    pub prefer_local: bool,
    pub remote_clip_seconds: u32,
    pub loading_retries: u32,
    pub loading_delay: Duration,
    pub ffmpeg_bin: PathBuf,
    pub video_crf: u8,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());

        let output_dir = text("OUTPUT_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("outputs"));
        let work_dir = text("WORK_DIR").map(PathBuf::from).unwrap_or_else(|| output_dir.join("tmp"));

        Self {
            port: parsed("PORT").and_then(|v| u16::try_from(v).ok()).unwrap_or(DEFAULT_PORT),
            output_dir,
            work_dir,
            hf_token: text("HF_TOKEN"),
            hf_api_base: text("HF_API_BASE").unwrap_or_else(|| huggingface::DEFAULT_BASE_URL.to_string()),
            hf_model: text("HF_MODEL").unwrap_or_else(|| huggingface::DEFAULT_MODEL.to_string()),
            replicate_token: text("REPLICATE_API_TOKEN"),
            replicate_api_base: text("REPLICATE_API_BASE").unwrap_or_else(|| replicate::DEFAULT_BASE_URL.to_string()),
            replicate_model: text("REPLICATE_MODEL").unwrap_or_else(|| replicate::DEFAULT_MODEL.to_string()),
            local_sd_url: text("LOCAL_SD_URL"),
            prefer_local: text("PREFER_LOCAL").is_some_and(|v| parse_flag(&v)),
            remote_clip_seconds: parsed("REMOTE_CLIP_SECONDS")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_CLIP_SECONDS),
            loading_retries: parsed("MODEL_LOADING_RETRIES")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(DEFAULT_LOADING_RETRIES),
            loading_delay: parsed("MODEL_LOADING_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LOADING_DELAY),
            ffmpeg_bin: text("FFMPEG_BIN").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("ffmpeg")),
            video_crf: parsed("VIDEO_CRF")
                .filter(|v| *v <= 51)
                .map(|v| v as u8)
                .unwrap_or(DEFAULT_CRF),
        }
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.output_dir, PathBuf::from("outputs"));
        assert_eq!(cfg.work_dir, PathBuf::from("outputs/tmp"));
        assert_eq!(cfg.hf_token, None);
        assert_eq!(cfg.remote_clip_seconds, 14);
        assert_eq!(cfg.loading_retries, 1);
        assert_eq!(cfg.loading_delay, Duration::from_secs(20));
        assert_eq!(cfg.video_crf, 18);
        assert!(!cfg.prefer_local);
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let cfg = config(&[
            ("PORT", "9000"),
            ("OUTPUT_DIR", "/data/videos"),
            ("HF_TOKEN", "  hf_abc "),
            ("REPLICATE_API_TOKEN", ""),
            ("PREFER_LOCAL", "True"),
            ("REMOTE_CLIP_SECONDS", "0"),
            ("VIDEO_CRF", "99"),
            ("MODEL_LOADING_RETRIES", "three"),
        ]);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.work_dir, PathBuf::from("/data/videos/tmp"));
        assert_eq!(cfg.hf_token.as_deref(), Some("hf_abc"));
        assert_eq!(cfg.replicate_token, None);
        assert!(cfg.prefer_local);
        assert_eq!(cfg.remote_clip_seconds, 14);
        assert_eq!(cfg.video_crf, 18);
        assert_eq!(cfg.loading_retries, 1);
    }
}
