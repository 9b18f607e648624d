//! Preconfigured backing services.

use crate::config::HarnessConfig;
use crate::managed_process::ManagedProcess;
use crate::CommandLine;
use std::borrow::Cow;
use std::ops::{Deref, DerefMut};

/// Default port of the document store.
pub const DOCUMENT_STORE_PORT: u16 = 27017;

/// Default port of the broker.
pub const BROKER_PORT: u16 = 6379;

/// A [ManagedProcess] running a backing service on a fixed readiness port.
///
/// Services are always quiet, their logs would drown the test output.
#[derive(Debug)]
pub struct ServiceFixture {
    process: ManagedProcess,
}

impl ServiceFixture {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        command: impl Into<CommandLine>,
        port: u16,
    ) -> Self {
        Self::with_config(name, command, port, &HarnessConfig::default())
    }

    /// Like [ServiceFixture::new], taking ready and stop timeouts from `config`.
    pub fn with_config(
        name: impl Into<Cow<'static, str>>,
        command: impl Into<CommandLine>,
        port: u16,
        config: &HarnessConfig,
    ) -> Self {
        Self {
            process: ManagedProcess::builder(command)
                .with_name(name)
                .ready_on_port(port)
                .ready_timeout(config.ready_timeout)
                .stop_options(config.stop)
                .quiet(true)
                .build(),
        }
    }

    /// `mongod` on its default port.
    pub fn document_store() -> Self {
        Self::document_store_with(&HarnessConfig::default())
    }

    pub fn document_store_with(config: &HarnessConfig) -> Self {
        Self::with_config("document-store", "mongod", DOCUMENT_STORE_PORT, config)
    }

    /// `redis-server` on its default port, with snapshotting disabled.
    pub fn broker() -> Self {
        Self::broker_with(&HarnessConfig::default())
    }

    pub fn broker_with(config: &HarnessConfig) -> Self {
        Self::with_config(
            "broker",
            vec!["redis-server", "--save", ""],
            BROKER_PORT,
            config,
        )
    }

    /// Wraps a process configured by hand, e.g. one exposing no readiness port.
    pub fn from_process(process: ManagedProcess) -> Self {
        Self { process }
    }

    pub fn into_inner(self) -> ManagedProcess {
        self.process
    }
}

impl Deref for ServiceFixture {
    type Target = ManagedProcess;

    fn deref(&self) -> &Self::Target {
        &self.process
    }
}

impl DerefMut for ServiceFixture {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StartError;
    use crate::ProcessStatus;
    use assertr::prelude::*;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    #[test]
    fn document_store_defaults() {
        let store = ServiceFixture::document_store();
        assert_that(store.name()).is_equal_to("document-store");
        assert_that(store.command_line().to_string()).is_equal_to("mongod");
        assert_that(store.readiness().map(|r| r.port)).is_equal_to(Some(27017));
        assert_that(store.is_quiet()).is_true();
    }

    #[test]
    fn broker_disables_persistence() {
        let broker = ServiceFixture::broker();
        assert_that(broker.command_line().args().to_vec()).contains_exactly(&["--save", ""]);
        assert_that(broker.readiness().map(|r| r.port)).is_equal_to(Some(6379));
        assert_that(broker.is_quiet()).is_true();
    }

    #[test]
    fn config_timeouts_are_applied() {
        let config = HarnessConfig {
            ready_timeout: Duration::from_secs(2),
            ..HarnessConfig::default()
        };
        let store = ServiceFixture::document_store_with(&config);
        assert_that(store.readiness().map(|r| r.timeout)).is_equal_to(Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn wrong_port_fails_within_timeout() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = HarnessConfig {
            ready_timeout: Duration::from_secs(1),
            ..HarnessConfig::default()
        };
        let mut service = ServiceFixture::with_config("sleeper", "sleep 1000", port, &config);

        let started = Instant::now();
        let result = service.start().await;
        assert_that(started.elapsed() < Duration::from_secs(3)).is_true();
        assert_that(matches!(result, Err(StartError::ServiceUnavailable { .. }))).is_true();

        service.stop().await.unwrap();
        assert_that(matches!(service.status(), ProcessStatus::Stopped(_))).is_true();
    }

    #[tokio::test]
    async fn ready_service_is_running() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut service = ServiceFixture::new("sleeper", "sleep 1000", port);
        service.start().await.unwrap();
        assert_that(service.is_running()).is_true();
        service.stop().await.unwrap();
    }
}
