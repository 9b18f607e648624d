//! Error types for fixture operations.

use crate::ProcessStatus;
use std::borrow::Cow;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while waiting for a TCP port.
#[derive(Debug, Error)]
pub enum PortError {
    /// Nothing accepted a connection within the timeout.
    #[error("Service at {host}:{port} did not accept connections within {timeout:?}")]
    ServiceUnavailable {
        /// The host that was polled.
        host: String,
        /// The port that was polled.
        port: u16,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },
}

/// Errors that can occur when starting a managed process.
#[derive(Debug, Error)]
pub enum StartError {
    /// `start` was called on a process that is running or was already stopped.
    #[error("Process '{process_name}' was already started")]
    AlreadyStarted {
        /// The name of the process.
        process_name: Cow<'static, str>,
    },

    /// The command line did not name a program.
    #[error("Process '{process_name}' has an empty command line")]
    EmptyCommandLine {
        /// The name of the process.
        process_name: Cow<'static, str>,
    },

    /// Failed to spawn the process.
    #[error("Failed to spawn process '{process_name}' ({command}): {source}")]
    SpawnFailed {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The rendered command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The process terminated before its readiness port became reachable.
    #[error("Process '{process_name}' ({command}) exited with {status} before becoming ready")]
    ExitedBeforeReady {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The rendered command line.
        command: String,
        /// Status the process exited with.
        status: ExitStatus,
    },

    /// The readiness port never became reachable.
    #[error("Process '{process_name}' did not become ready: {source}")]
    ServiceUnavailable {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The failed port wait.
        #[source]
        source: PortError,
    },
}

/// Errors that can occur when stopping a managed process.
#[derive(Debug, Error)]
pub enum StopError {
    /// Failed to send a signal to the process.
    #[error("Failed to send '{signal}' signal to process '{process_name}': {source}")]
    SignallingFailed {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        source: io::Error,
        /// The signal that could not be sent.
        signal: &'static str,
    },

    /// The process did not terminate within the stop bound.
    #[error("Process '{command}' was still in state {last_status:?} after {timeout:?}")]
    StillRunning {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The rendered command line.
        command: String,
        /// The bound that was exceeded.
        timeout: Duration,
        /// The status observed on the last poll.
        last_status: ProcessStatus,
    },
}

/// Errors reported by a [crate::TaskQueue] implementation.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue backend could not be reached.
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected a submission.
    #[error("Submission of task '{path}' was rejected: {reason}")]
    Rejected {
        /// The task path.
        path: String,
        /// Why the backend rejected it.
        reason: String,
    },

    /// A job id was not known to the backend.
    #[error("Unknown job '{0}'")]
    UnknownJob(String),

    /// Payloads could not be (de)serialized.
    #[error("Malformed payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur when dispatching tasks and awaiting their results.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue client failed.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// A job result did not become available in time.
    #[error("Result of job '{job_id}' was not available within {timeout:?}")]
    ResultTimeout {
        /// The job that was awaited.
        job_id: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },
}

/// Errors that can occur when operating a [crate::WorkerFixture].
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker or one of its services failed to start.
    #[error("Could not start worker environment: {0}")]
    Start(#[from] StartError),

    /// The worker or one of its services failed to stop.
    #[error("Could not stop worker environment: {0}")]
    Stop(#[from] StopError),

    /// The local queue client could not be created.
    #[error("Could not connect queue client: {0}")]
    Connect(#[source] QueueError),

    /// The worker was started before, but no queue client is available.
    #[error("Worker was started but has no queue client; lazy start is not retried")]
    NotConnected,

    /// Dispatching tasks failed.
    #[error("Task dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable held a value that could not be parsed.
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// The variable name.
        key: &'static str,
        /// The offending value.
        value: String,
        /// Why parsing failed.
        reason: String,
    },
}
