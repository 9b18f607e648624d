use crate::error::{StartError, StopError};
use crate::process::ProcessBuilder;
use crate::{CommandLine, Environment, async_drop, port, signal};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

/// Default bound for a stopped process to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval at which a stopping process is polled.
pub const DEFAULT_STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A `(host, port)` pair that must accept TCP connections before a process counts as started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// How [ManagedProcess::stop_with] terminates a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Send `SIGKILL` instead of `SIGINT`.
    pub force: bool,

    /// How long the process may take to exit after being signalled.
    pub timeout: Duration,

    /// How often the process status is polled while waiting.
    pub poll_interval: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            force: false,
            timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: DEFAULT_STOP_POLL_INTERVAL,
        }
    }
}

impl StopOptions {
    /// Kill instead of interrupt.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Externally observable state of a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// `start` was never called.
    NotStarted,

    /// The process is alive.
    Running,

    /// The process exited on its own, `stop` was not called yet.
    Exited(ExitStatus),

    /// `stop` was called. Carries the exit status if one was observed.
    Stopped(Option<ExitStatus>),

    /// The OS could not tell.
    Uncertain(String),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

#[derive(Debug)]
enum State {
    NotStarted,
    Running(Child),
    Stopped(Option<ExitStatus>),
}

/// Owns one external OS process, from launch through readiness to termination.
///
/// The lifecycle is `NotStarted → Running → Stopped`, where `Stopped` is terminal:
///
/// - [ManagedProcess::start] launches the process and, if a readiness port is configured, only
///   returns once that port accepts connections.
/// - [ManagedProcess::stop] interrupts the process and polls until it exited. Only the first
///   call has an effect.
///
/// # Teardown
///
/// Dropping a process that is still running stops it with the configured [StopOptions] and
/// panics if it does not exit in time. This requires a multithreaded tokio runtime. On any other
/// runtime a warning is logged and the child is killed without waiting.
#[derive(Debug)]
pub struct ManagedProcess {
    name: Cow<'static, str>,
    command: CommandLine,
    env: Environment,
    current_dir: Option<PathBuf>,
    readiness: Option<Readiness>,
    quiet: bool,
    stop_options: StopOptions,
    state: State,
}

impl ManagedProcess {
    /// A process with no readiness gate and default options.
    pub fn new(command: impl Into<CommandLine>) -> Self {
        Self::builder(command).build()
    }

    pub fn builder(command: impl Into<CommandLine>) -> ProcessBuilder {
        ProcessBuilder::new(command)
    }

    pub(crate) fn from_parts(
        name: Cow<'static, str>,
        command: CommandLine,
        env: Environment,
        current_dir: Option<PathBuf>,
        readiness: Option<Readiness>,
        quiet: bool,
        stop_options: StopOptions,
    ) -> Self {
        Self {
            name,
            command,
            env,
            current_dir,
            readiness,
            quiet,
            stop_options,
            state: State::NotStarted,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The command line of the last start, or the configured one if never started.
    pub fn command_line(&self) -> &CommandLine {
        &self.command
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn readiness(&self) -> Option<&Readiness> {
        self.readiness.as_ref()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// The OS process id, while the process is running and not yet reaped.
    pub fn id(&self) -> Option<u32> {
        match &self.state {
            State::Running(child) => child.id(),
            State::NotStarted | State::Stopped(_) => None,
        }
    }

    /// Queries the OS for the current state of the process. Does not block.
    //noinspection RsSelfConvention
    pub fn status(&mut self) -> ProcessStatus {
        match &mut self.state {
            State::NotStarted => ProcessStatus::NotStarted,
            State::Stopped(exit_status) => ProcessStatus::Stopped(*exit_status),
            State::Running(child) => running_status(child),
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.status().is_running()
    }

    /// Launches the process with its configured command line and environment.
    ///
    /// If a readiness port is configured, this only returns once it accepts connections. A
    /// process failing its readiness check stays owned by this fixture and is terminated on
    /// [ManagedProcess::stop] or drop.
    pub async fn start(&mut self) -> Result<(), StartError> {
        if !matches!(self.state, State::NotStarted) {
            return Err(StartError::AlreadyStarted {
                process_name: self.name.clone(),
            });
        }

        let Some(mut cmd) = self.command.to_command() else {
            return Err(StartError::EmptyCommandLine {
                process_name: self.name.clone(),
            });
        };
        self.env.apply(&mut cmd);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        if self.quiet {
            // The parent's handle on the null device is closed as soon as the child is spawned.
            cmd.stdout(Stdio::null());
        }
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| StartError::SpawnFailed {
            process_name: self.name.clone(),
            command: self.command.to_string(),
            source,
        })?;
        tracing::info!(
            process = %self.name,
            pid = ?child.id(),
            command = %self.command,
            "Started process"
        );
        self.state = State::Running(child);

        if let Some(readiness) = self.readiness.clone() {
            self.await_readiness(&readiness).await?;
        }
        Ok(())
    }

    /// Replaces the stored command line and environment, then starts the process.
    pub async fn start_with(
        &mut self,
        command: impl Into<CommandLine>,
        env: Environment,
    ) -> Result<(), StartError> {
        if !matches!(self.state, State::NotStarted) {
            return Err(StartError::AlreadyStarted {
                process_name: self.name.clone(),
            });
        }
        self.command = command.into();
        self.env = env;
        self.start().await
    }

    async fn await_readiness(&mut self, readiness: &Readiness) -> Result<(), StartError> {
        let State::Running(child) = &mut self.state else {
            unreachable!("readiness is only awaited right after spawning");
        };

        let ready = port::wait_ready_with_interval(
            &readiness.host,
            readiness.port,
            readiness.timeout,
            readiness.poll_interval,
        );
        tokio::pin!(ready);

        let result = tokio::select! {
            result = &mut ready => result,
            exited = child.wait() => match exited {
                Ok(status) => {
                    return Err(StartError::ExitedBeforeReady {
                        process_name: self.name.clone(),
                        command: self.command.to_string(),
                        status,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        process = %self.name,
                        error = %err,
                        "Could not watch process while awaiting readiness"
                    );
                    ready.await
                }
            },
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    process = %self.name,
                    host = %readiness.host,
                    port = readiness.port,
                    "Process is ready"
                );
                Ok(())
            }
            Err(source) => Err(StartError::ServiceUnavailable {
                process_name: self.name.clone(),
                source,
            }),
        }
    }

    /// Stops the process using the options it was built with.
    pub async fn stop(&mut self) -> Result<(), StopError> {
        self.stop_with(self.stop_options).await
    }

    /// Stops the process.
    ///
    /// Only the first call has an effect, every later call returns `Ok(())` immediately. The
    /// first call sends `SIGINT` (or `SIGKILL` when `options.force` is set) and then polls the
    /// process every `options.poll_interval` until it exited.
    ///
    /// Returns [StopError::StillRunning] if the process did not exit within `options.timeout`.
    /// The child is killed without further waiting in that case.
    pub async fn stop_with(&mut self, options: StopOptions) -> Result<(), StopError> {
        let previous = std::mem::replace(&mut self.state, State::Stopped(None));
        let mut child = match previous {
            State::NotStarted => {
                tracing::debug!(process = %self.name, "Process was never started");
                return Ok(());
            }
            State::Stopped(exit_status) => {
                self.state = State::Stopped(exit_status);
                return Ok(());
            }
            State::Running(child) => child,
        };

        let (signal_name, sent) = if options.force {
            ("SIGKILL", signal::send_kill(&mut child))
        } else {
            ("SIGINT", signal::send_interrupt(&child))
        };
        if let Err(source) = sent {
            return Err(StopError::SignallingFailed {
                process_name: self.name.clone(),
                source,
                signal: signal_name,
            });
        }
        tracing::debug!(process = %self.name, signal = signal_name, "Signalled process");

        let exit_status = self.await_exit(&mut child, options).await?;
        tracing::info!(process = %self.name, ?exit_status, "Stopped process");
        self.state = State::Stopped(exit_status);
        Ok(())
    }

    /// Polls `child` until it exited. `Ok(None)` means it was already reaped elsewhere.
    async fn await_exit(
        &self,
        child: &mut Child,
        options: StopOptions,
    ) -> Result<Option<ExitStatus>, StopError> {
        let deadline = Instant::now() + options.timeout;
        loop {
            let last_status = match child.try_wait() {
                Ok(Some(exit_status)) => return Ok(Some(exit_status)),
                Ok(None) => ProcessStatus::Running,
                Err(err) if is_already_reaped(&err) => return Ok(None),
                Err(err) => ProcessStatus::Uncertain(err.to_string()),
            };

            if Instant::now() >= deadline {
                tracing::error!(
                    process = %self.name,
                    ?last_status,
                    timeout = ?options.timeout,
                    "Process did not exit in time"
                );
                return Err(StopError::StillRunning {
                    process_name: self.name.clone(),
                    command: self.command.to_string(),
                    timeout: options.timeout,
                    last_status,
                });
            }
            tokio::time::sleep(options.poll_interval).await;
        }
    }
}

fn running_status(child: &mut Child) -> ProcessStatus {
    match child.try_wait() {
        Ok(None) => ProcessStatus::Running,
        Ok(Some(exit_status)) => ProcessStatus::Exited(exit_status),
        Err(err) => ProcessStatus::Uncertain(err.to_string()),
    }
}

fn is_already_reaped(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::ECHILD as i32)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if !matches!(self.state, State::Running(_)) {
            return;
        }

        let name = self.name.clone();
        let options = self.stop_options;
        let executed = async_drop::run_future(async {
            tracing::debug!(process = %name, "Stopping process on drop");
            if let Err(err) = self.stop_with(options).await {
                if std::thread::panicking() {
                    tracing::error!(process = %name, error = %err, "Failed to stop process");
                } else {
                    panic!("Failed to stop process '{name}': {err}");
                }
            }
        });

        if !executed {
            tracing::warn!(
                process = %name,
                "Process dropped without being stopped outside of a multithreaded runtime, killing it"
            );
            if let State::Running(child) = &mut self.state {
                let _ = signal::send_kill(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertr::prelude::*;
    use std::time::Instant as StdInstant;
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    /// A shell that ignores `SIGINT` and keeps running for a while.
    fn ignoring_sigint() -> CommandLine {
        CommandLine::from(vec!["sh", "-c", "trap '' INT; exec sleep 5"])
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for_exit(process: &mut ManagedProcess) -> ExitStatus {
        let deadline = StdInstant::now() + Duration::from_secs(5);
        loop {
            match process.status() {
                ProcessStatus::Exited(exit_status) => return exit_status,
                ProcessStatus::Running if StdInstant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => panic!("Process did not exit on its own, status: {other:?}"),
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn start_and_stop() {
        let mut process = ManagedProcess::new("sleep 1000");
        assert_that(process.status()).is_equal_to(ProcessStatus::NotStarted);

        process.start().await.unwrap();
        assert_that(process.status()).is_equal_to(ProcessStatus::Running);
        assert_that(process.id()).is_some();

        process.stop().await.unwrap();
        match process.status() {
            ProcessStatus::Stopped(Some(exit_status)) => {
                // Terminating a process with a signal results in no code being emitted (on linux).
                assert_that(exit_status.code()).is_none();
                assert_that(exit_status.success()).is_false();
            }
            other => {
                assert_that(other).fail("Process should be stopped with an exit status");
            }
        }
        assert_that(process.id()).is_none();
        assert_that(logs_contain("Stopped process")).is_true();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut process = ManagedProcess::new("sleep 1000");
        process.start().await.unwrap();

        process.stop().await.unwrap();
        let first = process.status();

        process.stop().await.unwrap();
        process.stop_with(StopOptions::forced()).await.unwrap();
        assert_that(process.status()).is_equal_to(first);
    }

    #[tokio::test]
    async fn stopping_a_never_started_process_is_a_no_op_and_final() {
        let mut process = ManagedProcess::new("sleep 1000");
        process.stop().await.unwrap();
        assert_that(process.status()).is_equal_to(ProcessStatus::Stopped(None));

        let result = process.start().await;
        assert_that(matches!(result, Err(StartError::AlreadyStarted { .. }))).is_true();
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let mut process = ManagedProcess::new("sleep 1000");
        process.start().await.unwrap();

        let result = process.start_with("sleep 2000", Environment::inherit()).await;
        assert_that(matches!(result, Err(StartError::AlreadyStarted { .. }))).is_true();
        assert_that(process.command_line().to_string()).is_equal_to("sleep 1000");

        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_succeeds_when_process_already_exited() {
        let mut process = ManagedProcess::new("true");
        process.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.stop().await.unwrap();
        match process.status() {
            ProcessStatus::Stopped(Some(exit_status)) => {
                assert_that(exit_status.success()).is_true();
            }
            ProcessStatus::Stopped(None) => {}
            other => {
                assert_that(other).fail("Process should be stopped");
            }
        }
    }

    #[tokio::test]
    async fn stop_succeeds_when_exit_was_already_observed() {
        let mut process = ManagedProcess::new("true");
        process.start().await.unwrap();
        let exit_status = wait_for_exit(&mut process).await;
        assert_that(exit_status.success()).is_true();

        process.stop().await.unwrap();
        assert_that(process.status()).is_equal_to(ProcessStatus::Stopped(Some(exit_status)));
    }

    #[tokio::test]
    #[traced_test]
    async fn stop_reports_process_still_running_after_timeout() {
        let mut process = ManagedProcess::new(ignoring_sigint());
        process.start().await.unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = StdInstant::now();
        let result = process
            .stop_with(StopOptions::default().with_timeout(Duration::from_millis(300)))
            .await;
        assert_that(started.elapsed() < Duration::from_secs(2)).is_true();

        match result {
            Err(StopError::StillRunning {
                command,
                timeout,
                last_status,
                ..
            }) => {
                assert_that(command).is_equal_to("sh -c \"trap '' INT; exec sleep 5\"");
                assert_that(timeout).is_equal_to(Duration::from_millis(300));
                assert_that(last_status).is_equal_to(ProcessStatus::Running);
            }
            other => {
                assert_that(other.is_ok()).fail("Stop should have timed out");
            }
        }
        assert_that(logs_contain("Process did not exit in time")).is_true();

        // The latch is set even though the first stop failed.
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn forced_stop_kills_process_ignoring_interrupts() {
        let mut process = ManagedProcess::new(ignoring_sigint());
        process.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.stop_with(StopOptions::forced()).await.unwrap();
        match process.status() {
            ProcessStatus::Stopped(Some(exit_status)) => {
                assert_that(exit_status.success()).is_false();
            }
            other => {
                assert_that(other).fail("Process should be stopped with an exit status");
            }
        }
    }

    #[tokio::test]
    async fn start_waits_for_readiness_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut process = ManagedProcess::builder("sleep 1000")
            .ready_on_port(port)
            .ready_timeout(Duration::from_secs(5))
            .build();
        process.start().await.unwrap();
        assert_that(process.is_running()).is_true();

        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_with_service_unavailable_when_port_stays_closed() {
        let port = unused_port().await;
        let mut process = ManagedProcess::builder("sleep 1000")
            .with_name("wrong-port")
            .ready_on_port(port)
            .ready_timeout(Duration::from_secs(1))
            .build();

        let started = StdInstant::now();
        let result = process.start().await;
        let elapsed = started.elapsed();

        assert_that(matches!(result, Err(StartError::ServiceUnavailable { .. }))).is_true();
        assert_that(elapsed >= Duration::from_secs(1)).is_true();
        assert_that(elapsed < Duration::from_secs(3)).is_true();

        // The process is still owned and must be stopped cleanly.
        assert_that(process.is_running()).is_true();
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_fast_when_process_exits_before_ready() {
        let port = unused_port().await;
        let mut process = ManagedProcess::builder("false")
            .ready_on_port(port)
            .ready_timeout(Duration::from_secs(30))
            .build();

        let started = StdInstant::now();
        let result = process.start().await;
        assert_that(started.elapsed() < Duration::from_secs(5)).is_true();

        match result {
            Err(StartError::ExitedBeforeReady { status, .. }) => {
                assert_that(status.code()).is_some().is_equal_to(1);
            }
            other => {
                assert_that(other.is_ok()).fail("Start should have failed");
            }
        }
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_names_the_command() {
        let mut process = ManagedProcess::new("queue-harness-no-such-binary --flag");
        match process.start().await {
            Err(StartError::SpawnFailed { command, .. }) => {
                assert_that(command).is_equal_to("queue-harness-no-such-binary --flag");
            }
            other => {
                assert_that(other.is_ok()).fail("Spawning should have failed");
            }
        }
        assert_that(process.status()).is_equal_to(ProcessStatus::NotStarted);
    }

    #[tokio::test]
    async fn empty_command_line_is_rejected() {
        let mut process = ManagedProcess::new("");
        let result = process.start().await;
        assert_that(matches!(result, Err(StartError::EmptyCommandLine { .. }))).is_true();
    }

    #[tokio::test]
    async fn inherited_environment_is_merged_with_overrides() {
        let mut process = ManagedProcess::builder(vec![
            "sh",
            "-c",
            "test \"$HARNESS_TEST_VALUE\" = 42 && test -n \"$CARGO_MANIFEST_DIR\"",
        ])
        .env(Environment::inherit().var("HARNESS_TEST_VALUE", "42"))
        .build();
        process.start().await.unwrap();

        let exit_status = wait_for_exit(&mut process).await;
        assert_that(exit_status.code()).is_some().is_equal_to(0);
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn replaced_environment_hides_parent_variables() {
        let cmd = CommandLine::from(vec![
            "/bin/sh",
            "-c",
            "test \"$HARNESS_TEST_VALUE\" = 42 && test -z \"$CARGO_MANIFEST_DIR\"",
        ]);
        let mut process = ManagedProcess::new("placeholder");
        process
            .start_with(cmd, Environment::replace().var("HARNESS_TEST_VALUE", "42"))
            .await
            .unwrap();
        assert_that(process.command_line().program()).is_some().is_equal_to("/bin/sh");

        let exit_status = wait_for_exit(&mut process).await;
        assert_that(exit_status.code()).is_some().is_equal_to(0);
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn runs_in_configured_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap();

        let mut process = ManagedProcess::builder(vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "test \"$(pwd -P)\" = \"$1\"".to_owned(),
            "sh".to_owned(),
            path.to_string_lossy().into_owned(),
        ])
        .current_dir(&path)
        .build();
        process.start().await.unwrap();

        let exit_status = wait_for_exit(&mut process).await;
        assert_that(exit_status.code()).is_some().is_equal_to(0);
        process.stop().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn quiet_process_writes_to_null_device() {
        let mut process = ManagedProcess::builder(vec![
            "sh",
            "-c",
            "test \"$(readlink /proc/$$/fd/1)\" = /dev/null",
        ])
        .quiet(true)
        .build();
        process.start().await.unwrap();

        let exit_status = wait_for_exit(&mut process).await;
        assert_that(exit_status.code()).is_some().is_equal_to(0);
        process.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn drop_stops_running_process() {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let mut process = ManagedProcess::new("sleep 1000");
        process.start().await.unwrap();
        let pid = Pid::from_raw(process.id().unwrap() as i32);

        drop(process);

        assert_that(kill(pid, None)).is_equal_to(Err(Errno::ESRCH));
    }
}
