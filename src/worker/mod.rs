//! Worker pool: bounded concurrent execution of queued invocations.
//!
//! Core components:
//! - `tracker`: `StateTracker`, the single path every transition takes
//! - `progress`: `ProgressReporter` handed to work functions
//! - `worker`: per-claim execution, outcome classification, retries

pub mod progress;
pub mod tracker;
pub mod worker;

pub use progress::ProgressReporter;
pub use tracker::StateTracker;
pub use worker::{DEFAULT_TASK_TIMEOUT, Worker, WorkerDeps};

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::queue::TaskQueue;

/// Default number of execution slots.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Fixed set of slots pulling from one queue.
pub struct WorkerPool {
    slots: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` slots. Each runs until the queue is closed and drained.
    pub fn start(size: usize, queue: Arc<TaskQueue>, deps: WorkerDeps) -> Self {
        let size = size.max(1);
        let mut slots = JoinSet::new();
        for slot in 0..size {
            slots.spawn(run_slot(slot, queue.clone(), deps.clone()));
        }
        info!(workers = size, "Worker pool started");
        Self { slots, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every slot to exit. Only returns after the queue is closed.
    ///
    /// Cancel-safe: slots not yet joined stay in the pool for `abort`.
    pub async fn join(&mut self) {
        while let Some(result) = self.slots.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Worker slot exited abnormally");
                }
            }
        }
        info!("Worker pool stopped");
    }

    /// Cancel every remaining slot along with the attempt it is running.
    ///
    /// Cancelled claims are dropped unfinalized and go back on the queue.
    pub async fn abort(&mut self) {
        let remaining = self.slots.len();
        self.slots.abort_all();
        while self.slots.join_next().await.is_some() {}
        warn!(slots = remaining, "Worker pool aborted");
    }
}

async fn run_slot(slot: usize, queue: Arc<TaskQueue>, deps: WorkerDeps) {
    info!(slot, "Worker started");
    let worker = Arc::new(Worker::new(deps));
    while let Some(claim) = queue.dequeue().await {
        let task_id = claim.task_id();
        let worker = worker.clone();
        // Dropping the set (slot aborted) cancels the execution; a panic
        // outside the work function drops the claim. Both redeliver it.
        let mut execution = JoinSet::new();
        execution.spawn(async move { worker.execute(claim).await });
        if let Some(Err(e)) = execution.join_next().await {
            error!(slot, task_id = %task_id, error = %e, "Worker crashed while executing task");
        }
    }
    info!(slot, "Worker stopped");
}
