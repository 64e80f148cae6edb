//! `ResultStore` trait: backend-agnostic, expiring storage of task state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::StoreError;
use crate::task::{TaskId, TaskState};

/// Default time a terminal result stays readable.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// What a `put` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was inserted or replaced.
    Written,
    /// The stored record is terminal or at least as new; nothing changed.
    Stale,
}

impl PutOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Keyed storage for `TaskState`, shared by the worker pool and the gateway.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Upsert a task's state.
    ///
    /// Rejected as `Stale` when the stored state is terminal or its version is
    /// not older than `state.version`. Terminal states start their expiry clock.
    async fn put(&self, state: &TaskState) -> Result<PutOutcome, StoreError>;

    /// Current state, or `None` for unknown and expired tasks.
    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskState>, StoreError>;

    /// Drop a record regardless of its phase. Returns whether one existed.
    async fn remove(&self, task_id: &TaskId) -> Result<bool, StoreError>;

    /// Physically delete expired records. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// 9999-12-31T23:59:59Z, the last instant with a four-digit RFC 3339 year.
/// Later expiries would stop sorting correctly as text in SQL.
const LATEST_EXPIRY_SECS: i64 = 253_402_300_799;

fn latest_expiry() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_EXPIRY_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// When a state written now should stop being readable.
pub(crate) fn expiry_for(state: &TaskState, ttl: Duration) -> Option<DateTime<Utc>> {
    if !state.is_terminal() {
        return None;
    }
    let finished = state.finished_at.unwrap_or(state.updated_at);
    let expires = TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| finished.checked_add_signed(ttl))
        .unwrap_or_else(latest_expiry);
    Some(expires.min(latest_expiry()))
}
