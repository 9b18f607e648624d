//! Fixtures for integration tests of a job-queue system.
//!
//! [ManagedProcess] spawns a child process, optionally waits for it to accept connections on a
//! TCP port and stops it again, forcefully if needed. [ServiceFixture] preconfigures it for the
//! document store and the broker. [WorkerFixture] runs a worker on top of both and submits tasks
//! through a [TaskDispatcher].

mod async_drop;
mod command_line;
mod config;
mod dispatch;
mod error;
mod managed_process;
mod port;
mod process;
mod service;
mod signal;
mod worker;

pub use command_line::{CommandLine, EnvMode, Environment};
pub use config::{
    DEFAULT_BROKER_URL, DEFAULT_QUEUE, DEFAULT_RESULT_POLL_INTERVAL, DEFAULT_RESULT_TIMEOUT,
    DEFAULT_STORE_URL, DEFAULT_WORKER_COMMAND, ENV_BROKER_URL, ENV_DEFAULT_QUEUE,
    ENV_READY_TIMEOUT, ENV_RESULT_POLL_INTERVAL, ENV_RESULT_TIMEOUT, ENV_STOP_POLL_INTERVAL,
    ENV_STOP_TIMEOUT, ENV_STORE_URL, ENV_WORKER_COMMAND, HarnessConfig, QueueConfig,
};
pub use dispatch::{
    JobId, JobResult, JobStatus, SendOptions, SendOutcome, SingleSendOutcome, TaskDispatcher,
    TaskQueue, TaskRequest,
};
pub use error::{
    ConfigError, DispatchError, PortError, QueueError, StartError, StopError, WorkerError,
};
pub use managed_process::{
    DEFAULT_STOP_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT, ManagedProcess, ProcessStatus, Readiness,
    StopOptions,
};
pub use port::{DEFAULT_PORT_POLL_INTERVAL, wait_ready, wait_ready_with_interval};
pub use process::{DEFAULT_READY_TIMEOUT, LOCALHOST, ProcessBuilder};
pub use service::{BROKER_PORT, DOCUMENT_STORE_PORT, ServiceFixture};
pub use worker::{
    DEFAULT_WORKER_QUEUES, QueueConnector, WorkerFixture, WorkerStartOptions, worker_command_line,
};

#[cfg(test)]
mod test {
    use crate::{ManagedProcess, ProcessStatus, StartError, StopOptions, wait_ready};
    use assertr::prelude::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn start_wait_and_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut process = ManagedProcess::builder("sleep 1000")
            .with_name("sleeper")
            .ready_on_port(port)
            .ready_timeout(Duration::from_secs(5))
            .build();
        process.start().await.unwrap();
        assert_that(process.is_running()).is_true();
        wait_ready("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();

        process.stop().await.unwrap();
        assert_that(process.is_running()).is_false();
        assert_that(matches!(process.status(), ProcessStatus::Stopped(Some(_)))).is_true();
    }

    #[tokio::test]
    async fn stopped_process_cannot_be_restarted() {
        let mut process = ManagedProcess::new("sleep 1000");
        process.start().await.unwrap();
        process.stop_with(StopOptions::forced()).await.unwrap();

        let restarted = process.start().await;
        assert_that(matches!(restarted, Err(StartError::AlreadyStarted { .. }))).is_true();
    }
}
