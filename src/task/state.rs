//! Task lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::task::{TaskId, TaskInvocation};

/// Lifecycle phase of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is executing an attempt.
    Started,
    /// The running attempt reported intermediate progress.
    Progress,
    /// The last attempt failed transiently; a redelivery is scheduled.
    Retry,
    /// Finished with a result.
    Success,
    /// Finished with an error.
    Failure,
}

impl Phase {
    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        use Phase::*;

        matches!(
            (self, target),
            // Validation rejections skip straight to Failure
            (Pending, Started) | (Pending, Failure) |
            (Started, Progress) | (Started, Retry) |
            (Started, Success) | (Started, Failure) |
            (Progress, Progress) | (Progress, Retry) |
            (Progress, Success) | (Progress, Failure) |
            (Retry, Started)
        )
    }

    /// Success and Failure are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Whether an execution attempt is in progress.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Started | Self::Progress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Progress => "PROGRESS",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable record tracking one task through its lifecycle.
///
/// Only the worker pool mutates a `TaskState`; everyone else sees snapshots
/// read from the result store or carried by notification events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    /// Name of the handler that executes this task.
    pub task_name: String,
    pub phase: Phase,
    /// Number of execution attempts started.
    pub attempts: u32,
    /// Number of RETRY transitions taken.
    pub retries: u32,
    /// Last progress payload reported by the work function.
    pub progress: Option<serde_json::Value>,
    /// Derived completion percentage, never decreases.
    pub percent: u8,
    /// Success payload.
    pub result: Option<serde_json::Value>,
    /// Failure detail (terminal) or last retry reason.
    pub error: Option<String>,
    /// Incremented on every transition; used to reject stale writes.
    pub version: u64,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    /// Initial PENDING state for a freshly submitted invocation.
    pub fn pending(invocation: &TaskInvocation) -> Self {
        Self {
            task_id: invocation.task_id,
            task_name: invocation.task_name.clone(),
            phase: Phase::Pending,
            attempts: 0,
            retries: 0,
            progress: None,
            percent: 0,
            result: None,
            error: None,
            version: 1,
            submitted_at: invocation.submitted_at,
            updated_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    fn transition_to(&mut self, target: Phase) -> Result<(), StateError> {
        if !self.phase.can_transition_to(target) {
            return Err(StateError::InvalidTransition {
                task_id: self.task_id,
                from: self.phase,
                to: target,
            });
        }

        let now = Utc::now();
        self.phase = target;
        self.version += 1;
        self.updated_at = now;
        if target.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Begin a new execution attempt.
    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition_to(Phase::Started)?;
        self.attempts += 1;
        Ok(())
    }

    /// Record an intermediate progress payload.
    pub fn report_progress(&mut self, payload: serde_json::Value) -> Result<(), StateError> {
        self.transition_to(Phase::Progress)?;
        if let Some(percent) = percent_from_progress(&payload) {
            self.percent = self.percent.max(percent);
        }
        self.progress = Some(payload);
        Ok(())
    }

    /// Schedule another attempt after a transient failure.
    pub fn retry(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        self.transition_to(Phase::Retry)?;
        self.retries += 1;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn succeed(&mut self, result: serde_json::Value) -> Result<(), StateError> {
        self.transition_to(Phase::Success)?;
        self.result = Some(result);
        self.error = None;
        self.percent = 100;
        Ok(())
    }

    pub fn fail(&mut self, detail: impl Into<String>) -> Result<(), StateError> {
        self.transition_to(Phase::Failure)?;
        self.error = Some(detail.into());
        Ok(())
    }
}

/// Percentage implied by a `{"current": n, "total": m}` progress payload.
///
/// Capped at 99 so that only SUCCESS reports 100.
pub fn percent_from_progress(payload: &serde_json::Value) -> Option<u8> {
    let current = payload.get("current")?.as_f64()?;
    let total = payload.get("total")?.as_f64()?;
    if total <= 0.0 || current < 0.0 {
        return None;
    }
    let pct = (current / total * 100.0).floor().min(99.0);
    Some(pct as u8)
}
