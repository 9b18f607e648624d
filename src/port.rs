//! Waiting for a TCP service to accept connections.

use crate::error::PortError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Interval between two connection attempts.
pub const DEFAULT_PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Waits until `host:port` accepts a TCP connection, polling every
/// [DEFAULT_PORT_POLL_INTERVAL].
///
/// Returns [PortError::ServiceUnavailable] once `timeout` elapsed without a successful connect.
pub async fn wait_ready(host: &str, port: u16, timeout: Duration) -> Result<(), PortError> {
    wait_ready_with_interval(host, port, timeout, DEFAULT_PORT_POLL_INTERVAL).await
}

/// Like [wait_ready], with a custom `interval` between connection attempts.
pub async fn wait_ready_with_interval(
    host: &str,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> Result<(), PortError> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        attempts += 1;

        // A single attempt may hang on unroutable hosts, never let it outlive the deadline.
        match tokio::time::timeout(remaining, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                tracing::debug!(host, port, attempts, "Port is accepting connections");
                return Ok(());
            }
            Ok(Err(err)) => {
                tracing::trace!(host, port, attempts, error = %err, "Port not ready yet");
            }
            Err(_elapsed) => break,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(interval.min(remaining)).await;
    }

    tracing::warn!(host, port, attempts, ?timeout, "Port did not become ready");
    Err(PortError::ServiceUnavailable {
        host: host.to_owned(),
        port,
        timeout,
    })
}
