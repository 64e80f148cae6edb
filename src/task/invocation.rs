//! Immutable task invocations and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::task::TaskId;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `initial * 2^(n-1)` before the n-th retry, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        /// Randomize each delay into `[d/2, d]`.
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential {
                initial,
                max,
                jitter,
            } => {
                let exp = retry.saturating_sub(1).min(31);
                let delay = initial.saturating_mul(1u32 << exp).min(max);
                if jitter && !delay.is_zero() {
                    let factor = rand::thread_rng().gen_range(0.5..=1.0);
                    delay.mul_f64(factor)
                } else {
                    delay
                }
            }
        }
    }
}

/// How many times, and how far apart, a transiently failing task is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Backoff::Fixed(Duration::ZERO))
    }

    /// Whether a task that has already been retried `retries` times may retry again.
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::Fixed(Duration::from_secs(60)))
    }
}

/// One submitted unit of work. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    /// Registry name of the work function.
    pub task_name: String,
    pub input: serde_json::Value,
    pub retry_policy: RetryPolicy,
    pub submitted_at: DateTime<Utc>,
}

impl TaskInvocation {
    pub fn new(
        task_name: impl Into<String>,
        input: serde_json::Value,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            task_name: task_name.into(),
            input,
            retry_policy,
            submitted_at: Utc::now(),
        }
    }
}
