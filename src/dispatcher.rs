//! Producer API: turn a named request into a queued invocation.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::SubmitError;
use crate::queue::TaskQueue;
use crate::store::ResultStore;
use crate::task::{RetryPolicy, TaskId, TaskInvocation, TaskRegistry, TaskState};

/// Validates the task name, seeds PENDING, and enqueues.
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    queue: Arc<TaskQueue>,
    store: Arc<dyn ResultStore>,
    default_policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        queue: Arc<TaskQueue>,
        store: Arc<dyn ResultStore>,
        default_policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            queue,
            store,
            default_policy,
        }
    }

    /// Submit `input` for the handler registered as `task_name`.
    ///
    /// On success the task is already readable as PENDING. On error nothing
    /// was queued and no record is left behind.
    pub async fn submit(
        &self,
        task_name: &str,
        input: serde_json::Value,
    ) -> Result<TaskId, SubmitError> {
        let handler = self
            .registry
            .get(task_name)
            .ok_or_else(|| SubmitError::UnknownTask {
                name: task_name.to_string(),
            })?;

        let policy = handler.retry_policy().unwrap_or(self.default_policy);
        let invocation = TaskInvocation::new(task_name, input, policy);
        let task_id = invocation.task_id;

        self.store.put(&TaskState::pending(&invocation)).await?;

        if let Err(e) = self.queue.enqueue(invocation) {
            if let Err(rollback) = self.store.remove(&task_id).await {
                warn!(task_id = %task_id, error = %rollback, "Failed to roll back PENDING record");
            }
            warn!(task_id = %task_id, task = %task_name, error = %e, "Submission rejected");
            return Err(e.into());
        }

        info!(task_id = %task_id, task = %task_name, "Task submitted");
        Ok(task_id)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }
}
