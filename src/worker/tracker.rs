//! Single write path for task transitions: validate, persist, then publish.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::{NotificationBus, NotificationEvent};
use crate::error::StateError;
use crate::store::{PutOutcome, ResultStore};
use crate::task::{Phase, TaskId, TaskState};

/// Owns the in-memory `TaskState` of one execution and applies every
/// transition to it, the result store, and the notification bus in that order.
pub struct StateTracker {
    task_id: TaskId,
    state: Mutex<TaskState>,
    store: Arc<dyn ResultStore>,
    bus: Arc<NotificationBus>,
}

impl StateTracker {
    pub fn new(state: TaskState, store: Arc<dyn ResultStore>, bus: Arc<NotificationBus>) -> Arc<Self> {
        Arc::new(Self {
            task_id: state.task_id,
            state: Mutex::new(state),
            store,
            bus,
        })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn snapshot(&self) -> TaskState {
        self.state.lock().await.clone()
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Apply `transition` and, if the edge is legal, persist and publish.
    ///
    /// The lock is held until publication so concurrent reporters cannot
    /// reorder events for this task.
    pub async fn apply<F>(&self, transition: F) -> Result<TaskState, StateError>
    where
        F: FnOnce(&mut TaskState) -> Result<(), StateError>,
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        transition(&mut next)?;
        *guard = next.clone();

        match self.store.put(&next).await {
            Ok(PutOutcome::Written) => {}
            Ok(PutOutcome::Stale) => {
                warn!(
                    task_id = %self.task_id,
                    phase = %next.phase,
                    version = next.version,
                    "Result store already holds a newer state, event not published"
                );
                return Ok(next);
            }
            Err(e) => {
                warn!(task_id = %self.task_id, phase = %next.phase, error = %e, "Failed to persist task state");
            }
        }

        let delivered = self.bus.publish(NotificationEvent::transition(next.clone()));
        debug!(
            task_id = %self.task_id,
            phase = %next.phase,
            version = next.version,
            subscribers = delivered,
            "Transition applied"
        );
        Ok(next)
    }

    pub async fn start(&self) -> Result<TaskState, StateError> {
        self.apply(|s| s.start()).await
    }

    pub async fn progress(&self, payload: serde_json::Value) -> Result<TaskState, StateError> {
        self.apply(|s| s.report_progress(payload)).await
    }

    pub async fn retry(&self, reason: String) -> Result<TaskState, StateError> {
        self.apply(|s| s.retry(reason)).await
    }

    pub async fn succeed(&self, result: serde_json::Value) -> Result<TaskState, StateError> {
        self.apply(|s| s.succeed(result)).await
    }

    pub async fn fail(&self, detail: String) -> Result<TaskState, StateError> {
        self.apply(|s| s.fail(detail)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::bus::{DEFAULT_BUS_CAPACITY, EventKind};
    use crate::store::MemoryResultStore;
    use crate::task::{RetryPolicy, TaskInvocation};

    fn setup() -> (Arc<StateTracker>, Arc<MemoryResultStore>, Arc<NotificationBus>) {
        let inv = TaskInvocation::new("echo", json!({}), RetryPolicy::default());
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let bus = NotificationBus::new(DEFAULT_BUS_CAPACITY);
        let tracker = StateTracker::new(TaskState::pending(&inv), store.clone(), bus.clone());
        (tracker, store, bus)
    }

    #[tokio::test]
    async fn transitions_are_stored_then_published() {
        let (tracker, store, bus) = setup();
        let mut sub = bus.subscribe(tracker.task_id());

        tracker.start().await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::PhaseChanged);
        // The store already has what the subscriber was told about.
        let stored = store.get(&tracker.task_id()).await.unwrap().unwrap();
        assert_eq!(stored.version, event.version());

        tracker.succeed(json!("ok")).await.unwrap();
        assert!(sub.recv().await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn illegal_transition_changes_nothing() {
        let (tracker, store, bus) = setup();
        let sub = bus.subscribe(tracker.task_id());

        let err = tracker.progress(json!({"current": 1, "total": 2})).await;
        assert!(err.is_err());
        assert_eq!(tracker.phase().await, Phase::Pending);
        assert!(store.get(&tracker.task_id()).await.unwrap().is_none());
        drop(sub);
    }

    #[tokio::test]
    async fn stale_store_write_is_not_published() {
        let (tracker, store, bus) = setup();
        let mut ahead = tracker.snapshot().await;
        ahead.version = 100;
        store.put(&ahead).await.unwrap();

        let mut sub = bus.subscribe(tracker.task_id());
        tracker.start().await.unwrap();
        tracker.fail("boom".into()).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), sub.recv())
                .await
                .is_err()
        );
    }
}
