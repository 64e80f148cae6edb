//! Error types for taskrelay.

use crate::task::{Phase, TaskId};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to open result store at {location}: {reason}")]
    ResultBackend { location: String, reason: String },
}

/// Task queue errors. Both variants mean the invocation was NOT queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Task queue is closed")]
    Closed,

    #[error("Task queue is full ({capacity} queued invocations)")]
    Full { capacity: usize },
}

/// Result store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned to a producer by `Dispatcher::submit`.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("No task registered under name '{name}'")]
    UnknownTask { name: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Task state machine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Task {task_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: Phase,
        to: Phase,
    },
}

/// Delivery gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unknown task {0}")]
    UnknownTask(TaskId),

    #[error("Malformed task id '{0}'")]
    MalformedId(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
