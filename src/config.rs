//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::error::ConfigError;
use crate::gateway::{DEFAULT_PING_INTERVAL, DEFAULT_STREAM_IDLE_TIMEOUT};
use crate::queue::DEFAULT_CAPACITY;
use crate::store::DEFAULT_RESULT_TTL;
use crate::task::{Backoff, RetryPolicy};
use crate::worker::{DEFAULT_CONCURRENCY, DEFAULT_TASK_TIMEOUT};

/// Prefix shared by every environment variable.
const ENV_PREFIX: &str = "TASKRELAY_";

/// Where task results are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultBackend {
    /// Process memory; lost on restart.
    Memory,
    /// libSQL database file.
    LibSql(PathBuf),
}

impl FromStr for ResultBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}RESULT_STORE"),
                message: "must be 'memory' or a database path".to_string(),
            }),
            "memory" => Ok(Self::Memory),
            path => Ok(Self::LibSql(PathBuf::from(path))),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Number of worker slots.
    pub worker_concurrency: usize,
    /// Maximum queued (ready + delayed) invocations.
    pub queue_capacity: usize,
    pub result_backend: ResultBackend,
    /// How long a terminal result stays readable.
    pub result_ttl: Duration,
    /// Period of the expired-result sweep.
    pub expiry_sweep_interval: Duration,
    /// Applied to handlers that do not override it.
    pub retry: RetryPolicy,
    /// Upper bound on a single attempt.
    pub task_timeout: Duration,
    /// Keep-alive period on idle streams.
    pub ping_interval: Duration,
    /// Streams with no phase change for this long are closed.
    pub stream_idle_timeout: Duration,
    /// Per-subscriber event buffer.
    pub bus_capacity: usize,
    /// Grace period for in-flight work on shutdown.
    pub shutdown_timeout: Duration,
    /// Directory for the rolling log file, if any.
    pub log_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            worker_concurrency: DEFAULT_CONCURRENCY,
            queue_capacity: DEFAULT_CAPACITY,
            result_backend: ResultBackend::Memory,
            result_ttl: DEFAULT_RESULT_TTL,
            expiry_sweep_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            shutdown_timeout: Duration::from_secs(30),
            log_dir: None,
        }
    }
}

impl RelayConfig {
    /// Read `TASKRELAY_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let retry_delay = env.secs("RETRY_DELAY_SECS")?.unwrap_or(Duration::from_secs(60));
        let retry_max_delay = env
            .secs("RETRY_MAX_DELAY_SECS")?
            .unwrap_or(Duration::from_secs(600));
        let backoff = match env.get("RETRY_BACKOFF").as_deref().map(str::trim) {
            None | Some("fixed") => Backoff::Fixed(retry_delay),
            Some("exponential") => Backoff::Exponential {
                initial: retry_delay,
                max: retry_max_delay.max(retry_delay),
                jitter: true,
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}RETRY_BACKOFF"),
                    message: format!("expected 'fixed' or 'exponential', got '{other}'"),
                });
            }
        };
        let max_retries = env
            .parse::<u32>("MAX_RETRIES")?
            .unwrap_or(defaults.retry.max_retries);

        let worker_concurrency = env
            .parse::<usize>("WORKERS")?
            .unwrap_or(defaults.worker_concurrency);
        if worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}WORKERS"),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            host: env.get("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT")?.unwrap_or(defaults.port),
            worker_concurrency,
            queue_capacity: env
                .parse("QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            result_backend: match env.get("RESULT_STORE") {
                Some(raw) => raw.parse()?,
                None => defaults.result_backend,
            },
            result_ttl: env.secs("RESULT_TTL_SECS")?.unwrap_or(defaults.result_ttl),
            expiry_sweep_interval: env
                .secs("EXPIRY_SWEEP_SECS")?
                .unwrap_or(defaults.expiry_sweep_interval)
                .max(Duration::from_secs(1)),
            retry: RetryPolicy::new(max_retries, backoff),
            task_timeout: env
                .secs("TASK_TIMEOUT_SECS")?
                .unwrap_or(defaults.task_timeout),
            ping_interval: env
                .secs("PING_INTERVAL_SECS")?
                .unwrap_or(defaults.ping_interval)
                .max(Duration::from_secs(1)),
            stream_idle_timeout: env
                .secs("STREAM_IDLE_TIMEOUT_SECS")?
                .unwrap_or(defaults.stream_idle_timeout),
            bus_capacity: env
                .parse::<usize>("BUS_CAPACITY")?
                .unwrap_or(defaults.bus_capacity)
                .max(1),
            shutdown_timeout: env
                .secs("SHUTDOWN_TIMEOUT_SECS")?
                .unwrap_or(defaults.shutdown_timeout),
            log_dir: env.get("LOG_DIR").filter(|s| !s.is_empty()).map(PathBuf::from),
        })
    }

    /// `host:port` for the HTTP listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{name}"),
                    message: format!("'{raw}': {e}"),
                }),
        }
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }
}
