//! Builder API for configuring a managed process before it is started.

use crate::managed_process::{ManagedProcess, Readiness, StopOptions};
use crate::port::DEFAULT_PORT_POLL_INTERVAL;
use crate::{CommandLine, Environment};
use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

/// Default bound for a readiness port to accept connections.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Host polled by [ProcessBuilder::ready_on_port].
pub const LOCALHOST: &str = "127.0.0.1";

/// A builder for configuring a [ManagedProcess].
///
/// Nothing is spawned by the builder. Call [ManagedProcess::start] on the built process.
///
/// # Examples
///
/// ```no_run
/// use queue_harness::ManagedProcess;
///
/// async fn with_store() -> Result<(), Box<dyn std::error::Error>> {
///     let mut store = ManagedProcess::builder("mongod --nojournal")
///         .with_name("document-store")
///         .ready_on_port(27017)
///         .quiet(true)
///         .build();
///
///     store.start().await?;
///     // ...
///     store.stop().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    command: CommandLine,
    name: Option<Cow<'static, str>>,
    env: Environment,
    current_dir: Option<PathBuf>,
    readiness: Option<Readiness>,
    quiet: bool,
    stop_options: StopOptions,
}

impl ProcessBuilder {
    pub fn new(command: impl Into<CommandLine>) -> Self {
        Self {
            command: command.into(),
            name: None,
            env: Environment::default(),
            current_dir: None,
            readiness: None,
            quiet: false,
            stop_options: StopOptions::default(),
        }
    }

    /// Sets the name used in logs and errors.
    ///
    /// Defaults to the rendered command line.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the environment the process is started with, unless overridden on start.
    pub fn env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Sets the working directory. Defaults to the current directory of this process.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// `start` only returns once `host:port` accepts TCP connections.
    pub fn ready_on(mut self, host: impl Into<String>, port: u16) -> Self {
        let timeout = self
            .readiness
            .as_ref()
            .map(|r| r.timeout)
            .unwrap_or(DEFAULT_READY_TIMEOUT);
        self.readiness = Some(Readiness {
            host: host.into(),
            port,
            timeout,
            poll_interval: DEFAULT_PORT_POLL_INTERVAL,
        });
        self
    }

    /// Shorthand for `ready_on("127.0.0.1", port)`.
    pub fn ready_on_port(self, port: u16) -> Self {
        self.ready_on(LOCALHOST, port)
    }

    /// Bounds the readiness wait. Has no effect unless a readiness port is configured.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        if let Some(readiness) = self.readiness.as_mut() {
            readiness.timeout = timeout;
        }
        self
    }

    /// When set, the child's stdout is discarded.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Options used by [ManagedProcess::stop] and by drop-time teardown.
    pub fn stop_options(mut self, options: StopOptions) -> Self {
        self.stop_options = options;
        self
    }

    pub fn build(self) -> ManagedProcess {
        let name = self
            .name
            .unwrap_or_else(|| Cow::Owned(self.command.to_string()));
        ManagedProcess::from_parts(
            name,
            self.command,
            self.env,
            self.current_dir,
            self.readiness,
            self.quiet,
            self.stop_options,
        )
    }
}
