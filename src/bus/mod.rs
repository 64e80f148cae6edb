//! Notification bus: per-task fan-out of state transitions to live subscribers.
//!
//! Delivery is at-most-once. Events published while nobody is subscribed to a
//! task are dropped; late readers go to the result store instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::task::{TaskId, TaskState};

pub use tokio::sync::broadcast::error::RecvError;

/// Default per-subscriber buffer.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// What a notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PhaseChanged,
    /// Keep-alive with no state change.
    Ping,
    /// The task reached SUCCESS or FAILURE; nothing follows.
    Terminal,
}

impl EventKind {
    /// SSE event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseChanged => "phase-changed",
            Self::Ping => "ping",
            Self::Terminal => "terminal",
        }
    }
}

/// A state transition announced on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub task_id: TaskId,
    pub kind: EventKind,
    pub state: TaskState,
}

impl NotificationEvent {
    /// Event for a freshly applied transition; terminal phases get `Terminal`.
    pub fn transition(state: TaskState) -> Self {
        let kind = if state.is_terminal() {
            EventKind::Terminal
        } else {
            EventKind::PhaseChanged
        };
        Self {
            task_id: state.task_id,
            kind,
            state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::Terminal
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }
}

/// Per-task broadcast channels, created on first subscribe and removed when
/// the last subscriber leaves.
pub struct NotificationBus {
    channels: Mutex<HashMap<TaskId, broadcast::Sender<NotificationEvent>>>,
    capacity: usize,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, broadcast::Sender<NotificationEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver to everyone currently subscribed to the event's task.
    ///
    /// Returns the number of subscribers reached; zero means the event was dropped.
    pub fn publish(&self, event: NotificationEvent) -> usize {
        let task_id = event.task_id;
        let kind = event.kind;
        let delivered = match self.lock().get(&task_id) {
            // Fails only when every receiver is gone, which `release` is about to clean up.
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };
        debug!(task_id = %task_id, kind = kind.as_str(), subscribers = delivered, "Event published");
        delivered
    }

    /// Attach to a task's channel. Only events published after this call are seen.
    pub fn subscribe(self: &Arc<Self>, task_id: TaskId) -> Subscription {
        let rx = {
            let mut channels = self.lock();
            channels
                .entry(task_id)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        debug!(task_id = %task_id, "Subscriber attached");
        Subscription {
            bus: Arc::clone(self),
            task_id,
            rx: Some(rx),
        }
    }

    /// Live subscribers for one task.
    pub fn subscriber_count(&self, task_id: &TaskId) -> usize {
        self.lock()
            .get(task_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Tasks with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    /// Total live subscribers across all tasks.
    pub fn total_subscribers(&self) -> usize {
        self.lock().values().map(|tx| tx.receiver_count()).sum()
    }

    fn release(&self, task_id: &TaskId) {
        let mut channels = self.lock();
        if channels
            .get(task_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(task_id);
            debug!(task_id = %task_id, "Last subscriber left, channel removed");
        }
    }
}

/// One consumer's binding to one task's channel.
///
/// Dropping it detaches the consumer and frees the channel if it was the last.
pub struct Subscription {
    bus: Arc<NotificationBus>,
    task_id: TaskId,
    rx: Option<broadcast::Receiver<NotificationEvent>>,
}

impl Subscription {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Next event in publication order.
    ///
    /// `Err(RecvError::Lagged(n))` means `n` events were overwritten because
    /// this subscriber fell behind; the caller should resynchronize.
    pub async fn recv(&mut self) -> Result<NotificationEvent, RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver must be gone before `release` reads the count.
        drop(self.rx.take());
        self.bus.release(&self.task_id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("task_id", &self.task_id)
            .finish()
    }
}
