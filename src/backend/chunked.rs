use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::{RemoteVideoApi, VideoSource};
use crate::encoder::ClipConcatenator;
use crate::error::{BackendError, BackendResult};
use crate::models::{BackendKind, VideoRequest};
use crate::progress::ProgressReporter;

/// Splits long requests into sub-clips no longer than the provider's ceiling
/// and joins whatever comes back.
pub struct ChunkedRemote {
    api: Arc<dyn RemoteVideoApi>,
    ceiling: u32,
    work_dir: PathBuf,
    concat: Arc<dyn ClipConcatenator>,
}

impl ChunkedRemote {
    pub fn new(
        api: Arc<dyn RemoteVideoApi>,
        ceiling: u32,
        work_dir: impl Into<PathBuf>,
        concat: Arc<dyn ClipConcatenator>,
    ) -> Self {
        Self {
            api,
            ceiling: ceiling.max(1),
            work_dir: work_dir.into(),
            concat,
        }
    }

    /// `(sub-prompt, seconds)` for each sub-clip, in playback order.
    pub fn plan(&self, prompt: &str, duration: u32) -> Vec<(String, u32)> {
        let count = duration.div_ceil(self.ceiling).max(1);
        if count == 1 {
            return vec![(prompt.to_string(), duration)];
        }
        let mut remaining = duration;
        (1..=count)
            .map(|i| {
                let secs = remaining.min(self.ceiling);
                remaining -= secs;
                (format!("{prompt} (scene {i}/{count})"), secs)
            })
            .collect()
    }

    async fn finish(&self, clips: &[PathBuf], output: &Path) -> BackendResult<PathBuf> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        match clips {
            [single] => {
                if tokio::fs::rename(single, output).await.is_err() {
                    // Work dir may sit on another filesystem.
                    tokio::fs::copy(single, output).await?;
                }
                Ok(output.to_path_buf())
            }
            _ => self.concat.concat(clips, output).await,
        }
    }

    async fn generate_in(&self, scratch: &Path, request: &VideoRequest, progress: &ProgressReporter) -> BackendResult<PathBuf> {
        let plan = self.plan(&request.prompt, request.duration);
        let total = plan.len() as u32;
        let kind = self.api.kind();

        let mut clips = Vec::with_capacity(plan.len());
        let mut failures = Vec::new();
        for (i, (prompt, secs)) in plan.iter().enumerate() {
            progress.report(i as u32 + 1, total, format!("Requesting {} clip {}/{} ({}s)", kind, i + 1, total, secs));
            let saved = match self.api.generate(prompt, *secs).await {
                Ok(bytes) => {
                    let path = scratch.join(format!("clip_{i}.mp4"));
                    match tokio::fs::write(&path, &bytes).await {
                        Ok(()) => Ok((path, bytes.len())),
                        Err(e) => Err(BackendError::from(e)),
                    }
                }
                Err(e) => Err(e),
            };
            match saved {
                Ok((path, len)) => {
                    info!("✅ {} clip {}/{} saved ({} bytes)", kind, i + 1, total, len);
                    clips.push(path);
                }
                // Single request: surface the backend error as is.
                Err(e) if total == 1 => return Err(e),
                Err(e) => {
                    warn!("⚠️ {} clip {}/{} failed: {}", kind, i + 1, total, e);
                    failures.push((i, e));
                }
            }
        }

        if clips.is_empty() {
            // Cold model on every clip: the generator's loading retry takes over.
            if let Some(loading) = failures.iter().map(|(_, e)| e).find(|e| e.is_retryable_later()) {
                return Err(BackendError::ModelLoading { estimated: loading.retry_delay() });
            }
            let reasons = failures.iter().map(|(i, e)| format!("clip {}: {}", i + 1, e)).collect();
            return Err(BackendError::NoClipsProduced { attempted: plan.len(), reasons });
        }
        if clips.len() < plan.len() {
            warn!("Joining {} of {} clips; video will be shorter than requested", clips.len(), plan.len());
        }

        self.finish(&clips, &request.output).await
    }
}

#[async_trait]
impl VideoSource for ChunkedRemote {
    fn kind(&self) -> BackendKind {
        self.api.kind()
    }

    async fn generate(&self, request: &VideoRequest, progress: &ProgressReporter) -> BackendResult<PathBuf> {
        let scratch = self.work_dir.join(format!("{}_{}", self.api.kind(), Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;
        let result = self.generate_in(&scratch, request, progress).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Could not remove {}: {}", scratch.display(), e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RemoteVideoApi;
    use crate::models::{GenerationMethod, RenderSettings};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct FakeApi {
        calls: Mutex<Vec<(String, u32)>>,
        fail_on: Vec<usize>,
        loading: bool,
        /// Occupies the clip path of this call with a directory so saving it fails.
        block_save: Option<(usize, PathBuf)>,
    }

    impl FakeApi {
        fn new(fail_on: Vec<usize>) -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()), fail_on, loading: false, block_save: None })
        }

        fn loading() -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()), fail_on: vec![0, 1, 2], loading: true, block_save: None })
        }

        fn blocking_save(index: usize, work_dir: PathBuf) -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()), fail_on: vec![], loading: false, block_save: Some((index, work_dir)) })
        }
    }

    #[async_trait]
    impl RemoteVideoApi for FakeApi {
        fn kind(&self) -> BackendKind {
            BackendKind::HuggingFace
        }

        async fn generate(&self, prompt: &str, duration: u32) -> BackendResult<Bytes> {
            let index = {
                let mut calls = self.calls.lock();
                calls.push((prompt.to_string(), duration));
                calls.len() - 1
            };
            if self.fail_on.contains(&index) && self.loading {
                return Err(BackendError::ModelLoading { estimated: Some(Duration::from_secs(20)) });
            }
            if self.fail_on.contains(&index) {
                return Err(BackendError::Unknown(format!("boom {index}")));
            }
            if let Some((at, work_dir)) = &self.block_save {
                if *at == index {
                    let scratch = std::fs::read_dir(work_dir).unwrap().next().unwrap().unwrap().path();
                    std::fs::create_dir(scratch.join(format!("clip_{index}.mp4"))).unwrap();
                }
            }
            Ok(Bytes::from(format!("clip-{index}")))
        }
    }

    struct FakeConcat;

    #[async_trait]
    impl ClipConcatenator for FakeConcat {
        async fn concat(&self, clips: &[PathBuf], output: &Path) -> BackendResult<PathBuf> {
            let mut joined = Vec::new();
            for clip in clips {
                joined.extend(tokio::fs::read(clip).await?);
            }
            tokio::fs::write(output, joined).await?;
            Ok(output.to_path_buf())
        }
    }

    fn request(duration: u32, output: PathBuf) -> VideoRequest {
        VideoRequest {
            prompt: "A fox in the snow".into(),
            duration,
            settings: RenderSettings::default(),
            method: GenerationMethod::Auto,
            prefer_local: None,
            output,
        }
    }

    #[tokio::test]
    async fn long_request_is_split_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new(vec![]);
        let source = ChunkedRemote::new(api.clone(), 14, dir.path().join("tmp"), Arc::new(FakeConcat));
        let out = dir.path().join("out.mp4");

        let path = source.generate(&request(28, out.clone()), &ProgressReporter::disabled()).await.unwrap();

        assert_eq!(path, out);
        assert_eq!(
            *api.calls.lock(),
            vec![
                ("A fox in the snow (scene 1/2)".to_string(), 14),
                ("A fox in the snow (scene 2/2)".to_string(), 14),
            ]
        );
        assert_eq!(std::fs::read(&out).unwrap(), b"clip-0clip-1");
    }

    #[tokio::test]
    async fn failed_clip_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let source = ChunkedRemote::new(FakeApi::new(vec![1]), 14, dir.path().join("tmp"), Arc::new(FakeConcat));
        let out = dir.path().join("out.mp4");

        source.generate(&request(28, out.clone()), &ProgressReporter::disabled()).await.unwrap();

        assert_eq!(std::fs::read(&out).unwrap(), b"clip-0");
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn all_clips_failing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ChunkedRemote::new(FakeApi::new(vec![0, 1, 2]), 14, dir.path().join("tmp"), Arc::new(FakeConcat));

        let err = source
            .generate(&request(30, dir.path().join("out.mp4")), &ProgressReporter::disabled())
            .await
            .unwrap_err();

        match err {
            BackendError::NoClipsProduced { attempted, reasons } => {
                assert_eq!(attempted, 3);
                assert_eq!(reasons.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cold_model_on_every_clip_stays_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let source = ChunkedRemote::new(FakeApi::loading(), 14, dir.path().join("tmp"), Arc::new(FakeConcat));

        let err = source
            .generate(&request(28, dir.path().join("out.mp4")), &ProgressReporter::disabled())
            .await
            .unwrap_err();

        assert!(err.is_retryable_later(), "{err:?}");
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(20)));
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unsaveable_clip_is_skipped_and_saved_clips_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("tmp");
        let api = FakeApi::blocking_save(1, work_dir.clone());
        let source = ChunkedRemote::new(api.clone(), 14, work_dir.clone(), Arc::new(FakeConcat));
        let out = dir.path().join("out.mp4");

        source.generate(&request(42, out.clone()), &ProgressReporter::disabled()).await.unwrap();

        assert_eq!(api.calls.lock().len(), 3);
        assert_eq!(std::fs::read(&out).unwrap(), b"clip-0clip-2");
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    }

    #[test]
    fn plan_handles_remainder_and_short_requests() {
        let source = ChunkedRemote::new(FakeApi::new(vec![]), 14, "tmp", Arc::new(FakeConcat));
        let secs: Vec<u32> = source.plan("p", 30).into_iter().map(|(_, s)| s).collect();
        assert_eq!(secs, vec![14, 14, 2]);
        assert_eq!(source.plan("p", 10), vec![("p".to_string(), 10)]);
    }
}
