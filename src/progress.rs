use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub step: u32,
    pub total: u32,
    pub message: String,
}

/// Write half of a job's progress cell. Cloning shares the same cell; the
/// disabled reporter drops every update.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<Arc<watch::Sender<Progress>>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<Progress>) {
        let (tx, rx) = watch::channel(Progress {
            step: 0,
            total: 0,
            message: "Queued".to_string(),
        });
        (Self { tx: Some(Arc::new(tx)) }, rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn report(&self, step: u32, total: u32, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            tx.send_replace(Progress {
                step,
                total,
                message: message.into(),
            });
        }
    }

    /// Replaces the message, keeping the current step counters.
    pub fn note(&self, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let message = message.into();
            tx.send_modify(|p| p.message = message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poller_sees_latest_update() {
        let (reporter, rx) = ProgressReporter::channel();
        reporter.report(1, 4, "Analyzing prompt");
        reporter.report(2, 4, "Keyframe 1/2");
        reporter.note("Keyframe 1/2 (placeholder)");
        let seen = rx.borrow().clone();
        assert_eq!(
            seen,
            Progress { step: 2, total: 4, message: "Keyframe 1/2 (placeholder)".into() }
        );
    }

    #[test]
    fn disabled_reporter_is_silent() {
        ProgressReporter::disabled().report(1, 1, "ignored");
    }
}
