//! Bounded-time raw TCP connect.
//!
//! Opens a transport to a single endpoint with one deadline governing the
//! whole attempt. All failure modes normalize to the crate error taxonomy:
//! the deadline wins as `TimedOut`, anything from the stack below as
//! `ConnectError`. Whichever signal arrives first settles the attempt; the
//! loser is cancelled and the socket is dropped.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::error::{AgentError, Result};
use crate::types::Endpoint;

/// Default connect-phase deadline
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket options applied to every dialed transport.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// TCP keepalive probe interval, `None` to leave the OS default
    pub keepalive: Option<Duration>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl TcpOptions {
    /// Create options with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set TCP_NODELAY.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set the keepalive probe interval.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    fn apply(&self, stream: &TcpStream) -> Result<()> {
        stream
            .set_nodelay(self.nodelay)
            .map_err(|e| AgentError::ConnectError(format!("Failed to set nodelay: {}", e)))?;
        if let Some(interval) = self.keepalive {
            let sock = SockRef::from(stream);
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))
                .map_err(|e| {
                    AgentError::ConnectError(format!("Failed to set keepalive: {}", e))
                })?;
        }
        Ok(())
    }
}

/// Open a TCP transport to `endpoint`, bounded by `timeout`.
///
/// `None` disables the deadline; that is an explicit configuration choice,
/// not an oversight. On any failure the socket is destroyed before returning.
pub async fn dial(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<TcpStream> {
    dial_with_options(endpoint, timeout, &TcpOptions::default()).await
}

/// Like [`dial`], with explicit socket options.
pub async fn dial_with_options(
    endpoint: &Endpoint,
    timeout: Option<Duration>,
    options: &TcpOptions,
) -> Result<TcpStream> {
    endpoint.validate("endpoint")?;

    let addr = endpoint.addr_string();
    let stream = match timeout {
        Some(deadline) => tokio::time::timeout(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| AgentError::TimedOut)?
            .map_err(|e| AgentError::ConnectError(format!("Failed to connect: {}", e)))?,
        None => TcpStream::connect(&addr)
            .await
            .map_err(|e| AgentError::ConnectError(format!("Failed to connect: {}", e)))?,
    };

    options.apply(&stream)?;
    Ok(stream)
}
