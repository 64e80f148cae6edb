//! Result store: expiring persistence of task state, memory or libSQL backed.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use libsql_backend::LibSqlResultStore;
pub use memory::MemoryResultStore;
pub use traits::{DEFAULT_RESULT_TTL, PutOutcome, ResultStore};

use crate::config::ResultBackend;
use crate::error::{ConfigError, Error};

/// Build the configured backend.
pub async fn open(backend: &ResultBackend, ttl: Duration) -> Result<Arc<dyn ResultStore>, Error> {
    match backend {
        ResultBackend::Memory => {
            info!(ttl_secs = ttl.as_secs(), "Using in-memory result store");
            Ok(Arc::new(MemoryResultStore::new(ttl)))
        }
        ResultBackend::LibSql(path) => {
            let store = LibSqlResultStore::new_local(path, ttl).await.map_err(|e| {
                ConfigError::ResultBackend {
                    location: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Arc::new(store))
        }
    }
}

/// Spawn the background sweep that physically removes expired results.
///
/// Reads already hide expired entries; this only reclaims space.
pub fn spawn_expiry_task(store: Arc<dyn ResultStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => debug!(purged = n, "Expiry sweep"),
                Err(e) => warn!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}
