//! Bounded TCP reachability probe for pod SSH endpoints.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Result of a single reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint accepted a TCP connection.
    Open,
    /// The endpoint refused the connection.
    Closed,
    /// No answer within the deadline.
    TimedOut,
}

/// Probe `ip:port` with a hard deadline. Never blocks past `timeout`.
pub async fn tcp_probe(ip: &str, port: u16, timeout: Duration) -> ProbeOutcome {
    let addr = format!("{ip}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => ProbeOutcome::Open,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "probe connection failed");
            ProbeOutcome::Closed
        }
        Err(_) => {
            debug!(%addr, "probe timed out");
            ProbeOutcome::TimedOut
        }
    }
}
