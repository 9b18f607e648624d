//! Environment-sourced configuration.
//!
//! Every setting has a default, so an empty environment yields a usable configuration. Durations
//! use the `humantime` format, e.g. `250ms`, `5s` or `1m 30s`.

use crate::error::ConfigError;
use crate::managed_process::{DEFAULT_STOP_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT, StopOptions};
use crate::process::DEFAULT_READY_TIMEOUT;
use crate::CommandLine;
use std::time::Duration;

pub const ENV_READY_TIMEOUT: &str = "HARNESS_READY_TIMEOUT";
pub const ENV_STOP_TIMEOUT: &str = "HARNESS_STOP_TIMEOUT";
pub const ENV_STOP_POLL_INTERVAL: &str = "HARNESS_STOP_POLL_INTERVAL";
pub const ENV_RESULT_POLL_INTERVAL: &str = "HARNESS_RESULT_POLL_INTERVAL";
pub const ENV_RESULT_TIMEOUT: &str = "HARNESS_RESULT_TIMEOUT";
pub const ENV_WORKER_COMMAND: &str = "HARNESS_WORKER_COMMAND";
pub const ENV_STORE_URL: &str = "QUEUE_STORE_URL";
pub const ENV_BROKER_URL: &str = "QUEUE_BROKER_URL";
pub const ENV_DEFAULT_QUEUE: &str = "QUEUE_DEFAULT_QUEUE";

pub const DEFAULT_RESULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WORKER_COMMAND: &str = "mrq-worker";
pub const DEFAULT_STORE_URL: &str = "mongodb://127.0.0.1:27017/queue";
pub const DEFAULT_BROKER_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_QUEUE: &str = "default";

/// Where the local queue client submits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Connection string of the document store holding jobs and results.
    pub store_url: String,

    /// Connection string of the broker holding the queues.
    pub broker_url: String,

    /// Queue used when a submission does not name one.
    pub default_queue: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_owned(),
            broker_url: DEFAULT_BROKER_URL.to_owned(),
            default_queue: DEFAULT_QUEUE.to_owned(),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            store_url: non_empty(lookup(ENV_STORE_URL)).unwrap_or(defaults.store_url),
            broker_url: non_empty(lookup(ENV_BROKER_URL)).unwrap_or(defaults.broker_url),
            default_queue: non_empty(lookup(ENV_DEFAULT_QUEUE)).unwrap_or(defaults.default_queue),
        }
    }
}

/// Timeouts and binaries used by the fixtures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Bound for service readiness ports.
    pub ready_timeout: Duration,

    /// How services and workers are stopped.
    pub stop: StopOptions,

    /// Interval at which job results are polled.
    pub result_poll_interval: Duration,

    /// Bound for a single job result to become available. `None` waits forever.
    pub result_timeout: Option<Duration>,

    /// The worker program and any leading arguments, before flags and queue names.
    pub worker_command: CommandLine,

    pub queue: QueueConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stop: StopOptions {
                force: false,
                timeout: DEFAULT_STOP_TIMEOUT,
                poll_interval: DEFAULT_STOP_POLL_INTERVAL,
            },
            result_poll_interval: DEFAULT_RESULT_POLL_INTERVAL,
            result_timeout: Some(DEFAULT_RESULT_TIMEOUT),
            worker_command: CommandLine::parse(DEFAULT_WORKER_COMMAND),
            queue: QueueConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Reads the configuration from the environment of the current process.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps variable names to values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ready_timeout =
            duration(ENV_READY_TIMEOUT, lookup(ENV_READY_TIMEOUT))?.unwrap_or(defaults.ready_timeout);
        let stop_timeout =
            duration(ENV_STOP_TIMEOUT, lookup(ENV_STOP_TIMEOUT))?.unwrap_or(defaults.stop.timeout);
        let stop_poll_interval = duration(ENV_STOP_POLL_INTERVAL, lookup(ENV_STOP_POLL_INTERVAL))?
            .unwrap_or(defaults.stop.poll_interval);
        let result_poll_interval =
            duration(ENV_RESULT_POLL_INTERVAL, lookup(ENV_RESULT_POLL_INTERVAL))?
                .unwrap_or(defaults.result_poll_interval);

        let result_timeout = match non_empty(lookup(ENV_RESULT_TIMEOUT)) {
            None => defaults.result_timeout,
            Some(value) if value.eq_ignore_ascii_case("none") => None,
            Some(value) => Some(parse_duration(ENV_RESULT_TIMEOUT, value)?),
        };

        let worker_command = non_empty(lookup(ENV_WORKER_COMMAND))
            .map(|value| CommandLine::parse(&value))
            .unwrap_or(defaults.worker_command);

        let config = Self {
            ready_timeout,
            stop: StopOptions {
                force: false,
                timeout: stop_timeout,
                poll_interval: stop_poll_interval,
            },
            result_poll_interval,
            result_timeout,
            worker_command,
            queue: QueueConfig::from_lookup(&lookup),
        };
        tracing::debug!(?config, "Loaded harness configuration");
        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn duration(key: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    non_empty(value)
        .map(|value| parse_duration(key, value))
        .transpose()
}

fn parse_duration(key: &'static str, value: String) -> Result<Duration, ConfigError> {
    humantime::parse_duration(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}
