//! Background generation jobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_with::skip_serializing_none;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::GenerationError;
use crate::hybrid::HybridGenerator;
use crate::models::{numbered_path, BackendKind, GenerationAttempt, GenerationReport, VideoRequest};
use crate::progress::{Progress, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

struct JobRecord {
    prompt: String,
    /// Output path reserved at submission.
    target: PathBuf,
    estimated_seconds: u64,
    status: JobStatus,
    progress: watch::Receiver<Progress>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    output: Option<PathBuf>,
    backend: Option<BackendKind>,
    attempts: Vec<GenerationAttempt>,
    error: Option<String>,
}

impl JobRecord {
    fn snapshot(&self, id: Uuid) -> JobSnapshot {
        JobSnapshot {
            id,
            prompt: self.prompt.clone(),
            status: self.status,
            progress: self.progress.borrow().clone(),
            estimated_seconds: self.estimated_seconds,
            created_at: self.created_at,
            finished_at: self.finished_at,
            output: self.output.clone(),
            backend: self.backend,
            attempts: self.attempts.clone(),
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a job, as returned to pollers.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub prompt: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub estimated_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<PathBuf>,
    pub backend: Option<BackendKind>,
    pub attempts: Vec<GenerationAttempt>,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the job and starts it in the background.
    pub fn submit(self: &Arc<Self>, generator: Arc<HybridGenerator>, mut request: VideoRequest) -> JobSnapshot {
        let id = Uuid::new_v4();
        let (reporter, progress) = ProgressReporter::channel();
        let snapshot = {
            let mut jobs = self.jobs.write();
            request.output = reserve_output(&jobs, &request.output);
            let record = JobRecord {
                prompt: request.prompt.clone(),
                target: request.output.clone(),
                estimated_seconds: request.estimated_generation_time().as_secs(),
                status: JobStatus::Queued,
                progress,
                created_at: Utc::now(),
                finished_at: None,
                output: None,
                backend: None,
                attempts: Vec::new(),
                error: None,
            };
            let snapshot = record.snapshot(id);
            jobs.insert(id, record);
            snapshot
        };
        info!("📥 Job {} queued (~{}s): {}", id, snapshot.estimated_seconds, request.prompt);

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.set_status(id, JobStatus::Running);
            let work = tokio::spawn(async move { generator.generate(&request, &reporter).await });
            match work.await {
                Ok(outcome) => registry.finish(id, outcome),
                Err(e) => {
                    error!("💥 Job {} task aborted: {}", id, e);
                    registry.fail(id, format!("generation task aborted: {e}"));
                }
            }
        });

        snapshot
    }

    pub fn snapshot(&self, id: Uuid) -> Option<JobSnapshot> {
        self.jobs.read().get(&id).map(|job| job.snapshot(id))
    }

    /// `Ok(path)` once the job completed, otherwise its current status.
    pub fn output_of(&self, id: Uuid) -> Option<Result<PathBuf, JobStatus>> {
        let jobs = self.jobs.read();
        let job = jobs.get(&id)?;
        Some(match (&job.output, job.status) {
            (Some(path), JobStatus::Completed) => Ok(path.clone()),
            (_, status) => Err(status),
        })
    }

    fn set_status(&self, id: Uuid, status: JobStatus) {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.status = status;
        }
    }

    fn finish(&self, id: Uuid, outcome: Result<GenerationReport, GenerationError>) {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&id) else { return };
        job.finished_at = Some(Utc::now());
        match outcome {
            Ok(report) => {
                info!("🎉 Job {} completed via {}: {}", id, report.backend, report.output.display());
                job.output = Some(report.output);
                job.backend = Some(report.backend);
                job.attempts = report.attempts;
                job.status = JobStatus::Completed;
            }
            Err(err) => {
                error!("❌ Job {} failed: {}", id, err);
                job.error = Some(err.to_string());
                let GenerationError::AllMethodsFailed { attempts } = err;
                job.attempts = attempts;
                job.status = JobStatus::Failed;
            }
        }
    }

    fn fail(&self, id: Uuid, reason: String) {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.finished_at = Some(Utc::now());
            job.error = Some(reason);
            job.status = JobStatus::Failed;
        }
    }
}

/// First variant of `wanted` that is neither on disk nor held by another job.
fn reserve_output(jobs: &HashMap<Uuid, JobRecord>, wanted: &Path) -> PathBuf {
    let taken = |path: &Path| path.exists() || jobs.values().any(|job| job.target == path);
    let mut candidate = wanted.to_path_buf();
    let mut n = 1;
    while taken(candidate.as_path()) {
        candidate = numbered_path(wanted, n);
        n += 1;
    }
    if candidate != wanted {
        info!("📛 {} is taken, writing to {}", wanted.display(), candidate.display());
    }
    candidate
}
