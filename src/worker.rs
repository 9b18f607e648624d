//! A worker process together with the services it depends on.

use crate::config::{HarnessConfig, QueueConfig};
use crate::dispatch::{SendOptions, SendOutcome, SingleSendOutcome, TaskDispatcher, TaskQueue};
use crate::error::{ConfigError, QueueError, StopError, WorkerError};
use crate::managed_process::{ManagedProcess, StopOptions};
use crate::service::ServiceFixture;
use crate::{CommandLine, Environment};
use serde_json::Value;
use std::fmt;

/// Queues a worker consumes from, in descending priority.
pub const DEFAULT_WORKER_QUEUES: [&str; 3] = ["high", "default", "low"];

/// Creates the local queue client once the services are up.
pub type QueueConnector<Q> = Box<dyn FnMut(&QueueConfig) -> Result<Q, QueueError> + Send>;

/// Options for [WorkerFixture::start_with].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStartOptions {
    /// Passed to the worker before the queue names.
    pub flags: Vec<String>,
    pub env: Environment,
}

impl WorkerStartOptions {
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }
}

/// Builds `<worker command> [flags] <queues>`.
pub fn worker_command_line(base: &CommandLine, flags: &[String], queues: &[String]) -> CommandLine {
    base.clone().extend(flags.iter().cloned()).extend(queues.iter().cloned())
}

/// A worker process, the document store and broker it depends on, and a local client to submit
/// tasks with.
///
/// Nothing is started on construction. The first [WorkerFixture::send_tasks] starts everything
/// implicitly, unless [WorkerFixture::start] was called before. Lazy start happens only once: if
/// it fails, later submissions fail with [WorkerError::NotConnected] instead of retrying.
///
/// Dropping the fixture stops the worker first, then the store, then the broker.
pub struct WorkerFixture<Q> {
    // Field order is drop order.
    worker: ManagedProcess,
    store: ServiceFixture,
    broker: ServiceFixture,
    queues: Vec<String>,
    config: HarnessConfig,
    connector: QueueConnector<Q>,
    dispatcher: Option<TaskDispatcher<Q>>,
    started: bool,
}

impl<Q: TaskQueue> WorkerFixture<Q> {
    /// A worker using [HarnessConfig::default].
    ///
    /// `QUEUE_*` and `HARNESS_*` variables are not consulted, the client connects to the default
    /// local services. Use [WorkerFixture::from_env] to honor them.
    pub fn new(
        store: ServiceFixture,
        broker: ServiceFixture,
        connector: impl FnMut(&QueueConfig) -> Result<Q, QueueError> + Send + 'static,
    ) -> Self {
        Self::with_config(HarnessConfig::default(), store, broker, connector)
    }

    /// A worker configured from the environment, see [HarnessConfig::from_env].
    pub fn from_env(
        store: ServiceFixture,
        broker: ServiceFixture,
        connector: impl FnMut(&QueueConfig) -> Result<Q, QueueError> + Send + 'static,
    ) -> Result<Self, ConfigError> {
        Ok(Self::with_config(HarnessConfig::from_env()?, store, broker, connector))
    }

    /// A worker using `config`. The connector is called with `config.queue` once the services
    /// are ready.
    pub fn with_config(
        config: HarnessConfig,
        store: ServiceFixture,
        broker: ServiceFixture,
        connector: impl FnMut(&QueueConfig) -> Result<Q, QueueError> + Send + 'static,
    ) -> Self {
        let worker = ManagedProcess::builder(config.worker_command.clone())
            .with_name("worker")
            .stop_options(config.stop)
            .build();
        Self {
            worker,
            store,
            broker,
            queues: DEFAULT_WORKER_QUEUES.iter().map(|q| q.to_string()).collect(),
            config,
            connector: Box::new(connector),
            dispatcher: None,
            started: false,
        }
    }

    /// Replaces the queues the worker consumes from.
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn worker(&self) -> &ManagedProcess {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut ManagedProcess {
        &mut self.worker
    }

    pub fn store(&self) -> &ServiceFixture {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ServiceFixture {
        &mut self.store
    }

    pub fn broker(&self) -> &ServiceFixture {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut ServiceFixture {
        &mut self.broker
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The local submission client, available once started.
    pub fn dispatcher(&self) -> Option<&TaskDispatcher<Q>> {
        self.dispatcher.as_ref()
    }

    pub async fn start(&mut self) -> Result<(), WorkerError> {
        self.start_with(WorkerStartOptions::default()).await
    }

    /// Starts the store, then the broker, then the worker, and connects the local client.
    ///
    /// Marks the fixture as started even if this fails.
    pub async fn start_with(&mut self, options: WorkerStartOptions) -> Result<(), WorkerError> {
        self.started = true;

        self.store.start().await?;
        self.broker.start().await?;

        let command = worker_command_line(&self.config.worker_command, &options.flags, &self.queues);
        self.worker.start_with(command, options.env).await?;

        let client = (self.connector)(&self.config.queue).map_err(WorkerError::Connect)?;
        self.dispatcher = Some(TaskDispatcher::with_config(client, &self.config));
        tracing::info!(
            command = %self.worker.command_line(),
            store = %self.config.queue.store_url,
            broker = %self.config.queue.broker_url,
            "Worker environment is up"
        );
        Ok(())
    }

    /// Stops the worker, then the store, then the broker, each with its own stop options.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        let results = [
            self.worker.stop().await,
            self.store.stop().await,
            self.broker.stop().await,
        ];
        first_error(results)
    }

    /// Like [WorkerFixture::stop], with the same `options` for all three processes.
    pub async fn stop_with(&mut self, options: StopOptions) -> Result<(), WorkerError> {
        let results = [
            self.worker.stop_with(options).await,
            self.store.stop_with(options).await,
            self.broker.stop_with(options).await,
        ];
        first_error(results)
    }

    /// Submits one `path` task per entry of `params_list`, starting everything first if needed.
    ///
    /// Returns job ids or results, in the order of `params_list`, depending on
    /// [SendOptions::block].
    pub async fn send_tasks(
        &mut self,
        path: &str,
        params_list: &[Value],
        options: SendOptions,
    ) -> Result<SendOutcome, WorkerError> {
        let dispatcher = self.connected_dispatcher().await?;
        Ok(dispatcher.send(path, params_list, &options).await?)
    }

    /// [WorkerFixture::send_tasks] for a single task.
    pub async fn send_task(
        &mut self,
        path: &str,
        params: Value,
        options: SendOptions,
    ) -> Result<SingleSendOutcome, WorkerError> {
        let dispatcher = self.connected_dispatcher().await?;
        Ok(dispatcher.send_one(path, &params, &options).await?)
    }

    async fn connected_dispatcher(&mut self) -> Result<&TaskDispatcher<Q>, WorkerError> {
        if !self.started {
            tracing::debug!("Starting worker environment on first submission");
            self.start().await?;
        }
        self.dispatcher.as_ref().ok_or(WorkerError::NotConnected)
    }
}

fn first_error(results: [Result<(), StopError>; 3]) -> Result<(), WorkerError> {
    let mut first = None;
    for result in results {
        if let Err(err) = result {
            match first {
                None => first = Some(err),
                Some(_) => tracing::error!(error = %err, "Additional failure while stopping"),
            }
        }
    }
    match first {
        None => Ok(()),
        Some(err) => Err(WorkerError::Stop(err)),
    }
}

impl<Q> fmt::Debug for WorkerFixture<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerFixture")
            .field("worker", &self.worker)
            .field("store", &self.store)
            .field("broker", &self.broker)
            .field("queues", &self.queues)
            .field("connected", &self.dispatcher.is_some())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
