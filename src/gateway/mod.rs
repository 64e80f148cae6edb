//! Delivery gateway: poll and live-stream access to task state.
//!
//! The poll path is a single store lookup. The stream path subscribes to the
//! bus before reading the store, so no transition between the two is lost;
//! duplicates from that window are dropped by version.

pub mod model;
pub mod routes;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use model::{PingView, StatusView, StreamEvent};
pub use routes::{AppState, router};

use crate::bus::{NotificationBus, RecvError, Subscription};
use crate::error::GatewayError;
use crate::store::ResultStore;
use crate::task::TaskId;

/// Default keep-alive period on an idle stream.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on how long a stream waits without a phase change.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Live event feed for one task. Dropping it releases the subscription.
pub type TaskEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

pub struct Gateway {
    store: Arc<dyn ResultStore>,
    bus: Arc<NotificationBus>,
    ping_interval: Duration,
    idle_timeout: Duration,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn ResultStore>,
        bus: Arc<NotificationBus>,
        ping_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            ping_interval,
            idle_timeout,
        }
    }

    /// Parse a client-supplied id.
    pub fn parse_id(raw: &str) -> Result<TaskId, GatewayError> {
        raw.parse()
            .map_err(|_| GatewayError::MalformedId(raw.to_string()))
    }

    /// Current status. Unknown and expired tasks are `UnknownTask`.
    pub async fn status(&self, task_id: TaskId) -> Result<StatusView, GatewayError> {
        match self.store.get(&task_id).await? {
            Some(state) => Ok(StatusView::from(&state)),
            None => Err(GatewayError::UnknownTask(task_id)),
        }
    }

    /// Open a live stream.
    ///
    /// Yields the current state first, then every newer transition, with a
    /// ping after each quiet `ping_interval`. Ends after the terminal event or
    /// when no transition arrives within the idle timeout.
    pub async fn stream(&self, task_id: TaskId) -> Result<TaskEventStream, GatewayError> {
        let subscription = self.bus.subscribe(task_id);
        let state = self
            .store
            .get(&task_id)
            .await?
            .ok_or(GatewayError::UnknownTask(task_id))?;

        debug!(task_id = %task_id, phase = %state.phase, "Stream opened");
        let now = Instant::now();
        let cursor = StreamCursor {
            subscription,
            store: self.store.clone(),
            last_version: state.version,
            pending: Some(StreamEvent::from_state(&state)),
            finished: false,
            ping_interval: self.ping_interval,
            idle_timeout: self.idle_timeout,
            next_ping: now + self.ping_interval,
            idle_deadline: now + self.idle_timeout,
        };

        Ok(Box::pin(futures::stream::unfold(cursor, |mut cursor| async move {
            let event = cursor.next_event().await?;
            Some((event, cursor))
        })))
    }
}

/// Per-connection stream position.
struct StreamCursor {
    subscription: Subscription,
    store: Arc<dyn ResultStore>,
    /// Highest version already forwarded.
    last_version: u64,
    /// Synthesized event waiting to be yielded.
    pending: Option<StreamEvent>,
    finished: bool,
    ping_interval: Duration,
    idle_timeout: Duration,
    next_ping: Instant,
    idle_deadline: Instant,
}

impl StreamCursor {
    fn task_id(&self) -> TaskId {
        self.subscription.task_id()
    }

    /// Yield `event`, closing the stream after a terminal one.
    fn emit(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        let now = Instant::now();
        self.next_ping = now + self.ping_interval;
        if let Some(view) = event.status() {
            self.last_version = view.version;
            self.idle_deadline = now + self.idle_timeout;
        }
        if event.is_terminal() {
            self.finished = true;
            debug!(task_id = %self.task_id(), "Stream reached terminal state");
        }
        Some(event)
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.pending.take() {
            return self.emit(event);
        }

        while !self.finished {
            let next_ping = self.next_ping;
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                biased;

                received = self.subscription.recv() => match received {
                    Ok(event) if event.version() <= self.last_version => {
                        debug!(task_id = %self.task_id(), version = event.version(), "Skipping already-delivered event");
                    }
                    Ok(event) => return self.emit(StreamEvent::from_state(&event.state)),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(task_id = %self.task_id(), missed, "Stream subscriber lagged, resyncing from store");
                        match self.store.get(&self.task_id()).await {
                            Ok(Some(state)) if state.version > self.last_version => {
                                return self.emit(StreamEvent::from_state(&state));
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => return None,
                            Err(e) => warn!(task_id = %self.task_id(), error = %e, "Resync read failed"),
                        }
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = tokio::time::sleep_until(idle_deadline) => {
                    info!(
                        task_id = %self.task_id(),
                        idle_secs = self.idle_timeout.as_secs(),
                        "No phase change within idle timeout, closing stream"
                    );
                    return None;
                }
                _ = tokio::time::sleep_until(next_ping) => {
                    return self.emit(StreamEvent::ping(self.task_id()));
                }
            }
        }
        None
    }
}
