//! taskrelay: deferred task execution with live progress notification.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod task;
pub mod worker;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use runtime::TaskRuntime;
