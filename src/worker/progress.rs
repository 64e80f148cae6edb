//! Progress reporting handle passed to work functions.

use std::sync::Arc;

use serde_json::json;

use crate::error::StateError;
use crate::task::TaskId;
use crate::worker::tracker::StateTracker;

/// Lets a running work function publish intermediate progress.
///
/// Reports are rejected once the attempt has finished (or timed out), so a
/// stray report can never reopen a terminal task.
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Arc<StateTracker>,
}

impl ProgressReporter {
    pub(crate) fn new(tracker: Arc<StateTracker>) -> Self {
        Self { tracker }
    }

    pub fn task_id(&self) -> TaskId {
        self.tracker.task_id()
    }

    /// Record a free-form progress payload.
    ///
    /// Payloads carrying numeric `current` and `total` also advance the
    /// task's completion percentage.
    pub async fn report(&self, payload: serde_json::Value) -> Result<(), StateError> {
        self.tracker.progress(payload).await.map(|_| ())
    }

    /// Report `{"current", "total", "status"}`.
    pub async fn step(
        &self,
        current: u64,
        total: u64,
        label: impl Into<String>,
    ) -> Result<(), StateError> {
        self.report(json!({
            "current": current,
            "total": total,
            "status": label.into(),
        }))
        .await
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.tracker.task_id())
            .finish()
    }
}
