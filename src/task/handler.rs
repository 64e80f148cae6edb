//! Work function contract and registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::task::RetryPolicy;
use crate::worker::ProgressReporter;

/// Classified result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Work finished; the payload becomes the task result.
    Success(serde_json::Value),
    /// Transient failure; retried while the retry budget lasts.
    RetryableFailure(String),
    /// Permanent failure; retrying cannot change the outcome.
    TerminalFailure(String),
}

impl Outcome {
    /// Map a work function's `Result` onto an outcome.
    ///
    /// Unexpected errors are retried like transient ones, but logged loudly.
    pub fn from_result(result: Result<serde_json::Value, WorkError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(WorkError::Transient(reason)) => Self::RetryableFailure(reason),
            Err(WorkError::Invalid(reason)) => Self::TerminalFailure(reason),
            Err(WorkError::Unexpected(reason)) => {
                tracing::error!(error = %reason, "Unexpected error in work function");
                Self::RetryableFailure(format!("unexpected: {reason}"))
            }
        }
    }
}

impl From<Result<serde_json::Value, WorkError>> for Outcome {
    fn from(result: Result<serde_json::Value, WorkError>) -> Self {
        Self::from_result(result)
    }
}

/// Errors a work function can raise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// Network-class or otherwise temporary failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed input or any failure a retry cannot fix.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Anything not classified above.
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

/// A unit of business logic the worker pool can execute.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Registry name producers submit against.
    fn name(&self) -> &str;

    /// Reject input before the first attempt starts.
    ///
    /// A rejection moves the task from PENDING straight to FAILURE.
    fn validate(&self, _input: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }

    /// Per-handler override of the configured retry policy.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Execute one attempt.
    async fn run(&self, input: serde_json::Value, progress: ProgressReporter) -> Outcome;
}

/// Registry of work functions keyed by name.
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name().to_string();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), handler)
            .is_some();
        if replaced {
            tracing::warn!(task = %name, "Replaced existing task handler");
        } else {
            tracing::debug!(task = %name, "Registered task handler");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
