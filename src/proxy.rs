//! Proxied connect: bounded dial plus full SOCKS5 negotiation as one
//! operation.
//!
//! A single deadline covers the raw connect and every negotiation stage,
//! including both hops when a bridge is configured; there is no per-stage
//! timeout. The attempt completes exactly once: if the deadline fires, the
//! in-flight leg is cancelled and the partial transport is dropped.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::dial::{self, TcpOptions, DEFAULT_DIAL_TIMEOUT};
use crate::error::{AgentError, Result};
use crate::socks5;
use crate::types::{Endpoint, ProxyRoute};

/// Options for a single proxied connect attempt.
#[derive(Debug, Clone)]
pub struct ProxyConnectOptions {
    /// The real target to tunnel to.
    pub endpoint: Endpoint,
    /// The proxy (and optional bridge/credentials) to tunnel through.
    pub route: ProxyRoute,
    /// Deadline covering dial plus all negotiation stages; `None` is
    /// unbounded.
    pub timeout: Option<Duration>,
    /// Socket options for the raw transport.
    pub tcp: TcpOptions,
}

impl ProxyConnectOptions {
    /// Create options with the default deadline and socket options.
    pub fn new(endpoint: Endpoint, route: ProxyRoute) -> Self {
        Self {
            endpoint,
            route,
            timeout: Some(DEFAULT_DIAL_TIMEOUT),
            tcp: TcpOptions::default(),
        }
    }

    /// Set the connect-phase deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        self.endpoint.validate("endpoint")?;
        self.route.validate()
    }
}

/// Connect to `options.endpoint` through `options.route`.
///
/// Preconditions are validated before any I/O; violations return
/// [`AgentError::InvalidOption`]. A deadline failure is
/// [`AgentError::TimedOut`] (see [`AgentError::is_timeout`]), which callers
/// use to tell an unreachable proxy apart from one that rejected the
/// request. On any failure the transport is destroyed.
pub async fn connect(options: &ProxyConnectOptions) -> Result<TcpStream> {
    options.validate()?;

    match options.timeout {
        Some(deadline) => tokio::time::timeout(deadline, connect_inner(options))
            .await
            .map_err(|_| AgentError::TimedOut)?,
        None => connect_inner(options).await,
    }
}

async fn connect_inner(options: &ProxyConnectOptions) -> Result<TcpStream> {
    // The outer deadline owns the clock for the whole attempt.
    let mut stream =
        dial::dial_with_options(options.route.first_hop(), None, &options.tcp).await?;
    socks5::establish_route(&mut stream, &options.route, &options.endpoint).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credentials;

    fn sample_route() -> ProxyRoute {
        ProxyRoute::new(Endpoint::new("proxy.example.com", 1080))
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_endpoint_host() {
        let options =
            ProxyConnectOptions::new(Endpoint::new("", 80), sample_route());
        let result = connect(&options).await;
        assert!(matches!(result, Err(AgentError::InvalidOption(_))));
    }

    #[tokio::test]
    async fn test_validation_rejects_oversized_credentials() {
        let route = sample_route()
            .with_credentials(Credentials::new("user", "p".repeat(300)));
        let options = ProxyConnectOptions::new(Endpoint::new("example.com", 80), route);
        let result = connect(&options).await;
        assert!(matches!(result, Err(AgentError::InvalidOption(_))));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_bridge() {
        let route = sample_route().with_bridge(Endpoint::new("", 1080));
        let options = ProxyConnectOptions::new(Endpoint::new("example.com", 80), route);
        let result = connect(&options).await;
        assert!(matches!(result, Err(AgentError::InvalidOption(_))));
    }
}
