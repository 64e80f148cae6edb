//! In-process result store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::store::traits::{PutOutcome, ResultStore, expiry_for};
use crate::task::{TaskId, TaskState};

struct Entry {
    state: TaskState,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `ResultStore` backed by a `HashMap`. Contents are lost on restart.
pub struct MemoryResultStore {
    entries: RwLock<HashMap<TaskId, Entry>>,
    ttl: Duration,
}

impl MemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Records held, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, state: &TaskState) -> Result<PutOutcome, StoreError> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(&state.task_id) {
            if existing.state.is_terminal() || existing.state.version >= state.version {
                debug!(
                    task_id = %state.task_id,
                    stored_version = existing.state.version,
                    incoming_version = state.version,
                    "Stale result write rejected"
                );
                return Ok(PutOutcome::Stale);
            }
        }

        entries.insert(
            state.task_id,
            Entry {
                state: state.clone(),
                expires_at: expiry_for(state, self.ttl),
            },
        );
        Ok(PutOutcome::Written)
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskState>, StoreError> {
        let entries = self.entries.read().await;
        let now = Utc::now();
        Ok(entries
            .get(task_id)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.state.clone()))
    }

    async fn remove(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(task_id).is_some())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}
