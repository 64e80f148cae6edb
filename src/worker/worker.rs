//! Execution of a single claimed delivery.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::NotificationBus;
use crate::queue::Claim;
use crate::store::ResultStore;
use crate::task::{Outcome, Phase, TaskHandler, TaskRegistry, TaskState};
use crate::worker::progress::ProgressReporter;
use crate::worker::tracker::StateTracker;

/// Default bound on a single attempt.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub registry: Arc<TaskRegistry>,
    pub store: Arc<dyn ResultStore>,
    pub bus: Arc<NotificationBus>,
    pub task_timeout: Duration,
}

/// Executes one claim from load to acknowledgment.
pub struct Worker {
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }

    fn store(&self) -> &Arc<dyn ResultStore> {
        &self.deps.store
    }

    /// Run the claimed invocation and finalize the claim.
    ///
    /// Never returns early without finalizing: if this future is dropped or
    /// panics, the claim's drop guard puts the delivery back on the queue.
    pub async fn execute(&self, claim: Claim) {
        let invocation = Arc::clone(claim.invocation());
        let task_id = invocation.task_id;

        let state = match self.store().get(&task_id).await {
            Ok(Some(state)) => state,
            Ok(None) => TaskState::pending(&invocation),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to load task state, starting from PENDING");
                TaskState::pending(&invocation)
            }
        };

        if state.is_terminal() {
            debug!(task_id = %task_id, phase = %state.phase, "Task already finished, skipping delivery");
            claim.ack();
            return;
        }

        let tracker = StateTracker::new(state, self.store().clone(), self.deps.bus.clone());

        let Some(handler) = self.deps.registry.get(&invocation.task_name) else {
            error!(task_id = %task_id, task = %invocation.task_name, "No handler registered for task");
            abandon(&tracker, format!("unknown task '{}'", invocation.task_name)).await;
            claim.ack();
            return;
        };

        let phase = tracker.phase().await;
        if phase == Phase::Pending {
            if let Err(reason) = handler.validate(&invocation.input) {
                info!(task_id = %task_id, reason = %reason, "Task input rejected");
                if let Err(e) = tracker.fail(format!("invalid input: {reason}")).await {
                    error!(task_id = %task_id, error = %e, "Could not record validation failure");
                }
                claim.ack();
                return;
            }
        }

        if phase.is_running() {
            // An earlier claim died mid-attempt; continue it rather than opening a new one.
            warn!(task_id = %task_id, phase = %phase, redelivered = claim.redelivered(), "Resuming interrupted attempt");
        } else if let Err(e) = tracker.start().await {
            error!(task_id = %task_id, error = %e, "Could not start task");
            claim.ack();
            return;
        }

        let attempt = tracker.snapshot().await.attempts;
        info!(task_id = %task_id, task = %invocation.task_name, attempt, "Task started");

        let reporter = ProgressReporter::new(tracker.clone());
        let outcome = self
            .run_attempt(handler, invocation.input.clone(), reporter)
            .await;

        self.finalize(claim, &tracker, outcome).await;
    }

    /// Run the work function in its own task so a panic or timeout cannot
    /// take the worker down with it.
    ///
    /// The task lives in a `JoinSet`, so dropping this future (pool abort)
    /// cancels the work function too. On timeout the attempt is aborted and
    /// awaited: the claim is only finalized once the work function has stopped.
    async fn run_attempt(
        &self,
        handler: Arc<dyn TaskHandler>,
        input: serde_json::Value,
        reporter: ProgressReporter,
    ) -> Outcome {
        let task_id = reporter.task_id();
        let limit = self.deps.task_timeout;
        let mut attempt = JoinSet::new();
        attempt.spawn(async move { handler.run(input, reporter).await });

        let joined = match tokio::time::timeout(limit, attempt.join_next()).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(task_id = %task_id, timeout_ms = limit.as_millis() as u64, "Work function timed out, cancelling");
                attempt.abort_all();
                // Blocking work only observes the abort at its next yield point.
                while attempt.join_next().await.is_some() {}
                debug!(task_id = %task_id, "Timed-out attempt has stopped");
                return Outcome::RetryableFailure(format!("timed out after {}", humanize(limit)));
            }
        };

        match joined {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(task_id = %task_id, panic = %message, "Work function panicked");
                Outcome::RetryableFailure(format!("work function panicked: {message}"))
            }
            Some(Err(e)) => Outcome::RetryableFailure(format!("work function cancelled: {e}")),
            None => Outcome::RetryableFailure("work function was not started".to_string()),
        }
    }

    async fn finalize(&self, claim: Claim, tracker: &StateTracker, outcome: Outcome) {
        let task_id = tracker.task_id();
        let policy = claim.invocation().retry_policy;

        let detail = match outcome {
            Outcome::Success(result) => {
                match tracker.succeed(result).await {
                    Ok(state) => info!(task_id = %task_id, attempts = state.attempts, "Task succeeded"),
                    Err(e) => error!(task_id = %task_id, error = %e, "Could not record success"),
                }
                claim.ack();
                return;
            }
            Outcome::RetryableFailure(reason) => {
                let retries = tracker.snapshot().await.retries;
                if policy.allows_retry(retries) {
                    match tracker.retry(reason.clone()).await {
                        Ok(state) => {
                            let delay = policy.backoff.delay_for(state.retries);
                            warn!(
                                task_id = %task_id,
                                retry = state.retries,
                                max_retries = policy.max_retries,
                                delay_ms = delay.as_millis() as u64,
                                reason = %reason,
                                "Task failed, retrying"
                            );
                            claim.retry_after(delay);
                        }
                        Err(e) => {
                            error!(task_id = %task_id, error = %e, "Could not record retry");
                            claim.ack();
                        }
                    }
                    return;
                }
                format!("{reason} (gave up after {retries} retries)")
            }
            Outcome::TerminalFailure(reason) => reason,
        };

        match tracker.fail(detail.clone()).await {
            Ok(_) => info!(task_id = %task_id, error = %detail, "Task failed"),
            Err(e) => error!(task_id = %task_id, error = %e, "Could not record failure"),
        }
        claim.ack();
    }
}

/// Terminal failure from whatever phase the task is in.
async fn abandon(tracker: &StateTracker, detail: String) {
    if tracker.phase().await == Phase::Retry {
        // RETRY may only move to STARTED.
        if let Err(e) = tracker.start().await {
            error!(task_id = %tracker.task_id(), error = %e, "Could not reopen task");
            return;
        }
    }
    if let Err(e) = tracker.fail(detail).await {
        error!(task_id = %tracker.task_id(), error = %e, "Could not record failure");
    }
}

fn humanize(limit: Duration) -> String {
    if limit.subsec_millis() == 0 {
        format!("{}s", limit.as_secs())
    } else {
        format!("{}ms", limit.as_millis())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
