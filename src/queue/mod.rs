//! In-process task queue with late acknowledgment.
//!
//! Producers `enqueue` synchronously; workers `dequeue` a [`Claim`] and must
//! finalize it with [`Claim::ack`] or [`Claim::retry_after`]. A claim that is
//! dropped unfinalized (the worker panicked or was aborted) is put back at the
//! front of the queue, so every invocation is attempted at least once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::task::{TaskId, TaskInvocation};

/// Default maximum number of queued (ready + delayed) deliveries.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// One delivery of an invocation to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub invocation: Arc<TaskInvocation>,
    /// RETRY transitions taken before this delivery.
    pub retries: u32,
    /// Set when a previous claim on this delivery was lost.
    pub redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    /// Retries waiting for their backoff to elapse, unordered.
    delayed: Vec<(Instant, Delivery)>,
    in_flight: HashSet<TaskId>,
    closed: bool,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, delivery) = self.delayed.swap_remove(i);
                self.ready.push_back(delivery);
            } else {
                i += 1;
            }
        }
    }

    /// First ready delivery whose task is not already claimed.
    fn take_ready(&mut self) -> Option<Delivery> {
        let pos = self
            .ready
            .iter()
            .position(|d| !self.in_flight.contains(&d.invocation.task_id))?;
        self.ready.remove(pos)
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// Bounded at-least-once queue shared by producers and the worker pool.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an invocation for execution. Never waits for a worker.
    pub fn enqueue(&self, invocation: TaskInvocation) -> Result<TaskId, QueueError> {
        let task_id = invocation.task_id;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.queued() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            state.ready.push_back(Delivery {
                invocation: Arc::new(invocation),
                retries: 0,
                redelivered: false,
            });
        }
        debug!(task_id = %task_id, "Invocation enqueued");
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the queue is closed and no ready delivery remains.
    pub async fn dequeue(self: &Arc<Self>) -> Option<Claim> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(delivery) = state.take_ready() {
                    state.in_flight.insert(delivery.invocation.task_id);
                    return Some(Claim {
                        queue: Arc::clone(self),
                        delivery: Some(delivery),
                    });
                }
                if state.closed {
                    return None;
                }
                state.next_due()
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop accepting invocations and wake idle workers.
    ///
    /// Ready deliveries are still handed out; retries whose backoff has not
    /// elapsed are abandoned.
    pub fn close(&self) {
        let abandoned = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.promote_due(Instant::now());
            let abandoned = state.delayed.len();
            state.delayed.clear();
            abandoned
        };
        info!(abandoned_retries = abandoned, "Task queue closed");
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Deliveries ready to be claimed.
    pub fn pending_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Retries waiting on their backoff.
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Deliveries currently claimed by workers.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn finish(&self, delivery: &Delivery) {
        self.lock().in_flight.remove(&delivery.invocation.task_id);
        // A ready delivery for the same task may have been skipped while claimed.
        self.notify.notify_one();
    }

    fn schedule(&self, delivery: Delivery, delay: Duration) {
        let task_id = delivery.invocation.task_id;
        {
            let mut state = self.lock();
            state.in_flight.remove(&task_id);
            if state.closed {
                warn!(task_id = %task_id, "Queue closed, retry abandoned");
                return;
            }
            state.delayed.push((Instant::now() + delay, delivery));
        }
        debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        self.notify.notify_one();
    }

    fn redeliver(&self, mut delivery: Delivery) {
        let task_id = delivery.invocation.task_id;
        delivery.redelivered = true;
        {
            let mut state = self.lock();
            state.in_flight.remove(&task_id);
            state.ready.push_front(delivery);
        }
        warn!(task_id = %task_id, "Claim lost before acknowledgment, redelivering");
        self.notify.notify_one();
    }
}

/// A worker's exclusive hold on one delivery.
pub struct Claim {
    queue: Arc<TaskQueue>,
    delivery: Option<Delivery>,
}

impl Claim {
    fn delivery(&self) -> &Delivery {
        // Only `ack`/`retry_after` (which consume self) and Drop take it.
        self.delivery
            .as_ref()
            .unwrap_or_else(|| unreachable!("claim used after finalization"))
    }

    pub fn invocation(&self) -> &Arc<TaskInvocation> {
        &self.delivery().invocation
    }

    pub fn task_id(&self) -> TaskId {
        self.delivery().invocation.task_id
    }

    pub fn retries(&self) -> u32 {
        self.delivery().retries
    }

    pub fn redelivered(&self) -> bool {
        self.delivery().redelivered
    }

    /// Finalize: the invocation is done with, successfully or not.
    pub fn ack(mut self) {
        if let Some(delivery) = self.delivery.take() {
            self.queue.finish(&delivery);
        }
    }

    /// Finalize by scheduling the next attempt after `delay`.
    pub fn retry_after(mut self, delay: Duration) {
        if let Some(mut delivery) = self.delivery.take() {
            delivery.retries += 1;
            delivery.redelivered = false;
            self.queue.schedule(delivery, delay);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            self.queue.redeliver(delivery);
        }
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("delivery", &self.delivery)
            .finish()
    }
}
