//! Task data model.
//!
//! - `id`: opaque `TaskId`
//! - `state`: lifecycle phases and the per-task `TaskState` record
//! - `invocation`: immutable `TaskInvocation` plus retry policy
//! - `handler`: work function trait, `Outcome`, and the handler registry
//! - `builtin`: demo handlers registered by the server binary

pub mod builtin;
pub mod handler;
pub mod id;
pub mod invocation;
pub mod state;

pub use handler::{Outcome, TaskHandler, TaskRegistry, WorkError};
pub use id::TaskId;
pub use invocation::{Backoff, RetryPolicy, TaskInvocation};
pub use state::{Phase, TaskState};
