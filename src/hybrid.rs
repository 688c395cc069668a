use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::backend::VideoSource;
use crate::error::{BackendError, GenerationError};
use crate::models::{
    AttemptOutcome, BackendKind, GenerationAttempt, GenerationMethod, GenerationReport, VideoRequest,
};
use crate::progress::ProgressReporter;

pub const DEFAULT_LOADING_RETRIES: u32 = 1;
pub const DEFAULT_LOADING_DELAY: Duration = Duration::from_secs(20);
const MAX_LOADING_DELAY: Duration = Duration::from_secs(120);

/// Tries backends in preference order until one produces a video.
pub struct HybridGenerator {
    sources: Vec<Arc<dyn VideoSource>>,
    prefer_local: bool,
    loading_retries: u32,
    loading_delay: Duration,
}

impl HybridGenerator {
    pub fn new(sources: Vec<Arc<dyn VideoSource>>, prefer_local: bool) -> Self {
        Self {
            sources,
            prefer_local,
            loading_retries: DEFAULT_LOADING_RETRIES,
            loading_delay: DEFAULT_LOADING_DELAY,
        }
    }

    /// How often, and after how long, a backend that reports a loading model is asked again.
    pub fn with_loading_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.loading_retries = retries;
        self.loading_delay = delay;
        self
    }

    pub fn available(&self) -> Vec<BackendKind> {
        self.sources.iter().map(|s| s.kind()).collect()
    }

    /// `prefer_local` on the request overrides the generator default.
    pub fn method_order(&self, method: GenerationMethod, prefer_local: Option<bool>) -> Vec<BackendKind> {
        match method {
            GenerationMethod::Local => vec![BackendKind::Local],
            GenerationMethod::HuggingFace => vec![BackendKind::HuggingFace],
            GenerationMethod::Replicate => vec![BackendKind::Replicate],
            GenerationMethod::Auto if prefer_local.unwrap_or(self.prefer_local) => {
                vec![BackendKind::Local, BackendKind::HuggingFace, BackendKind::Replicate]
            }
            GenerationMethod::Auto => vec![BackendKind::HuggingFace, BackendKind::Replicate, BackendKind::Local],
        }
    }

    fn source(&self, kind: BackendKind) -> Option<&Arc<dyn VideoSource>> {
        self.sources.iter().find(|s| s.kind() == kind)
    }

    pub async fn generate(
        &self,
        request: &VideoRequest,
        progress: &ProgressReporter,
    ) -> Result<GenerationReport, GenerationError> {
        let order = self.method_order(request.method, request.prefer_local);
        info!("🚀 Generating \"{}\" ({}s), trying {:?}", request.prompt, request.duration, order);
        let mut attempts = Vec::new();

        for kind in order {
            let Some(source) = self.source(kind) else {
                let reason = BackendError::NotConfigured(kind).to_string();
                warn!("⚠️ {}", reason);
                attempts.push(GenerationAttempt::failed(kind, &request.prompt, request.duration, reason));
                continue;
            };

            let mut retries_left = self.loading_retries;
            loop {
                progress.note(format!("Generating with {kind}"));
                let started_at = Utc::now();
                let clock = Instant::now();
                let result = source.generate(request, progress).await;
                let elapsed_ms = clock.elapsed().as_millis() as u64;

                match result {
                    Ok(output) => {
                        info!("✅ {} produced {} in {}ms", kind, output.display(), elapsed_ms);
                        attempts.push(GenerationAttempt {
                            backend: kind,
                            prompt: request.prompt.clone(),
                            duration: request.duration,
                            outcome: AttemptOutcome::Success { output: output.clone() },
                            started_at,
                            elapsed_ms,
                        });
                        return Ok(GenerationReport { output, backend: kind, attempts });
                    }
                    Err(e) => {
                        warn!("❌ {} failed after {}ms: {}", kind, elapsed_ms, e);
                        let retry = e.is_retryable_later() && retries_left > 0;
                        let delay = e.retry_delay().unwrap_or(self.loading_delay).min(MAX_LOADING_DELAY);
                        attempts.push(GenerationAttempt {
                            backend: kind,
                            prompt: request.prompt.clone(),
                            duration: request.duration,
                            outcome: AttemptOutcome::Failure { reason: e.to_string() },
                            started_at,
                            elapsed_ms,
                        });
                        if !retry {
                            break;
                        }
                        retries_left -= 1;
                        info!("⏳ {} is loading its model, retrying in {:?}", kind, delay);
                        progress.note(format!("{kind} is loading, retrying in {}s", delay.as_secs()));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let err = GenerationError::AllMethodsFailed { attempts };
        error!("💥 {}", err);
        Err(err)
    }

    pub fn shutdown(&self) {
        for source in &self.sources {
            source.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChunkedRemote, RemoteVideoApi};
    use crate::error::BackendResult;
    use crate::models::RenderSettings;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    struct Scripted {
        kind: BackendKind,
        script: Mutex<VecDeque<BackendResult<PathBuf>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(kind: BackendKind, script: Vec<BackendResult<PathBuf>>) -> Arc<Self> {
            Arc::new(Self { kind, script: Mutex::new(script.into()), calls: Mutex::new(0) })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl VideoSource for Scripted {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn generate(&self, _: &VideoRequest, _: &ProgressReporter) -> BackendResult<PathBuf> {
            *self.calls.lock() += 1;
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Unknown("script exhausted".into())))
        }
    }

    fn request(method: GenerationMethod, prefer_local: Option<bool>) -> VideoRequest {
        VideoRequest {
            prompt: "A red balloon floating".into(),
            duration: 10,
            settings: RenderSettings::default(),
            method,
            prefer_local,
            output: PathBuf::from("outputs/out.mp4"),
        }
    }

    fn generator(sources: Vec<Arc<Scripted>>) -> HybridGenerator {
        let sources = sources.into_iter().map(|s| s as Arc<dyn VideoSource>).collect();
        HybridGenerator::new(sources, false).with_loading_retry(1, Duration::ZERO)
    }

    #[test]
    fn method_orders() {
        let g = generator(vec![]);
        assert_eq!(
            g.method_order(GenerationMethod::Auto, None),
            vec![BackendKind::HuggingFace, BackendKind::Replicate, BackendKind::Local]
        );
        assert_eq!(
            g.method_order(GenerationMethod::Auto, Some(true)),
            vec![BackendKind::Local, BackendKind::HuggingFace, BackendKind::Replicate]
        );
        assert_eq!(g.method_order(GenerationMethod::Replicate, Some(true)), vec![BackendKind::Replicate]);
    }

    #[tokio::test]
    async fn first_success_stops_the_search() {
        let hf = Scripted::new(BackendKind::HuggingFace, vec![Err(BackendError::Auth("no token".into()))]);
        let rep = Scripted::new(BackendKind::Replicate, vec![Ok(PathBuf::from("outputs/out.mp4"))]);
        let local = Scripted::new(BackendKind::Local, vec![]);
        let g = generator(vec![local.clone(), hf.clone(), rep.clone()]);

        let report = g.generate(&request(GenerationMethod::Auto, None), &ProgressReporter::disabled()).await.unwrap();

        assert_eq!(report.backend, BackendKind::Replicate);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[0].failure_reason(), Some("authentication failed: no token"));
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let g = generator(vec![
            Scripted::new(BackendKind::HuggingFace, vec![Err(BackendError::RateLimited { retry_after: None })]),
            Scripted::new(BackendKind::Replicate, vec![Err(BackendError::Auth("bad token".into()))]),
            Scripted::new(BackendKind::Local, vec![Err(BackendError::Encoder("ffmpeg missing".into()))]),
        ]);

        let err = g.generate(&request(GenerationMethod::Auto, None), &ProgressReporter::disabled()).await.unwrap_err();

        let GenerationError::AllMethodsFailed { attempts } = &err;
        let order: Vec<_> = attempts.iter().map(|a| a.backend).collect();
        assert_eq!(order, vec![BackendKind::HuggingFace, BackendKind::Replicate, BackendKind::Local]);
        let msg = err.to_string();
        assert!(msg.contains("huggingface: rate limited by backend"));
        assert!(msg.contains("replicate: authentication failed: bad token"));
        assert!(msg.contains("local: encoder error: ffmpeg missing"));
    }

    #[tokio::test]
    async fn loading_model_is_retried_then_abandoned() {
        let hf = Scripted::new(
            BackendKind::HuggingFace,
            vec![
                Err(BackendError::ModelLoading { estimated: None }),
                Err(BackendError::ModelLoading { estimated: None }),
            ],
        );
        let local = Scripted::new(BackendKind::Local, vec![Ok(PathBuf::from("outputs/out.mp4"))]);
        let g = generator(vec![hf.clone(), local]);

        let report = g.generate(&request(GenerationMethod::Auto, None), &ProgressReporter::disabled()).await.unwrap();

        assert_eq!(hf.calls(), 2);
        let backends: Vec<_> = report.attempts.iter().map(|a| a.backend).collect();
        assert_eq!(
            backends,
            vec![BackendKind::HuggingFace, BackendKind::HuggingFace, BackendKind::Replicate, BackendKind::Local]
        );
        assert_eq!(report.attempts[2].failure_reason(), Some("replicate backend is not configured"));
    }

    #[tokio::test]
    async fn loading_retry_can_succeed() {
        let hf = Scripted::new(
            BackendKind::HuggingFace,
            vec![Err(BackendError::ModelLoading { estimated: None }), Ok(PathBuf::from("outputs/out.mp4"))],
        );
        let g = generator(vec![hf.clone()]);

        let report =
            g.generate(&request(GenerationMethod::HuggingFace, None), &ProgressReporter::disabled()).await.unwrap();

        assert_eq!(report.backend, BackendKind::HuggingFace);
        assert_eq!(report.attempts.len(), 2);
        assert!(matches!(report.attempts[1].outcome, AttemptOutcome::Success { .. }));
    }

    struct Clips(BackendKind);

    #[async_trait]
    impl RemoteVideoApi for Clips {
        fn kind(&self) -> BackendKind {
            self.0
        }

        async fn generate(&self, _: &str, _: u32) -> BackendResult<Bytes> {
            Ok(Bytes::from_static(b"clip"))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exhausted_sources_leave_no_output() {
        use crate::encoder::{failing_ffmpeg, Ffmpeg};

        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = Arc::new(Ffmpeg::new(failing_ffmpeg(dir.path())));
        let sources: Vec<Arc<dyn VideoSource>> = [BackendKind::HuggingFace, BackendKind::Replicate]
            .into_iter()
            .map(|kind| {
                let source = ChunkedRemote::new(Arc::new(Clips(kind)), 5, dir.path().join("work"), ffmpeg.clone());
                Arc::new(source) as Arc<dyn VideoSource>
            })
            .collect();
        let g = HybridGenerator::new(sources, false).with_loading_retry(1, Duration::ZERO);
        let output = dir.path().join("out.mp4");
        let request = VideoRequest { output: output.clone(), ..request(GenerationMethod::Auto, None) };

        let err = g.generate(&request, &ProgressReporter::disabled()).await.unwrap_err();

        let GenerationError::AllMethodsFailed { attempts } = &err;
        assert_eq!(attempts.len(), 3);
        assert!(attempts[0].failure_reason().unwrap().contains("ffmpeg concat failed: disk full"));
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }
}
