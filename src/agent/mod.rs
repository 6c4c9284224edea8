//! Pooled agents: endpoint-keyed transport reuse through SOCKS5 routes.
//!
//! Two flavors share one lifecycle: [`HttpAgent`] pools plain/TLS transports
//! with an exclusive in-use lock per request, [`H2Agent`] pools multiplexed
//! HTTP/2 sessions that concurrent requests share. Both resolve their proxy
//! route the same way (static, or lazily via a [`ProxySelector`]), rotate it
//! on connect timeouts, and tear the pool down when a configured request
//! limit is reached.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::dial::{TcpOptions, DEFAULT_DIAL_TIMEOUT};
use crate::error::{AgentError, Result};
use crate::types::ProxyRoute;

mod h2;
mod http;

pub use self::h2::{H2Agent, H2Key};
pub use self::http::{HttpAgent, PoolKey, PooledStream};

/// Default steady-state idle timeout for pooled entries
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle state of a pooled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Idle in the pool and available for reuse.
    Ready,
    /// Checked out by one request (non-multiplexed flavor only).
    InUse,
    /// Removed from reuse; resources destroyed or about to be.
    Revoked,
}

/// Proxy selection callback, invoked lazily when no static route is
/// configured. The selected route is cached until the pool discards it.
#[async_trait]
pub trait ProxySelector: Send + Sync {
    async fn select_route(&self) -> Result<ProxyRoute>;
}

/// Configuration shared by both pooled agent flavors.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Static proxy route. Mutually exclusive with a selector.
    pub route: Option<ProxyRoute>,
    /// Deadline for dial plus full SOCKS5 negotiation.
    pub connect_timeout: Duration,
    /// How long an idle pooled entry stays reusable.
    pub idle_timeout: Duration,
    /// Verify the TLS peer (default). Disabling is an explicit opt-out.
    pub verify_peer: bool,
    /// Destroy the pool and re-select after this many requests.
    /// Only valid together with dynamic selection.
    pub request_limit: Option<u64>,
    /// Socket options for dialed transports.
    pub tcp: TcpOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            route: None,
            connect_timeout: DEFAULT_DIAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            verify_peer: true,
            request_limit: None,
            tcp: TcpOptions::default(),
        }
    }
}

impl AgentConfig {
    /// Create a configuration with a static proxy route.
    pub fn with_route(route: ProxyRoute) -> Self {
        Self {
            route: Some(route),
            ..Self::default()
        }
    }

    /// Set the connect-phase deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the steady-state idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable or disable TLS peer verification.
    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Set the request-count limit that forces pool destruction.
    pub fn with_request_limit(mut self, limit: u64) -> Self {
        self.request_limit = Some(limit);
        self
    }

    /// Set socket options for dialed transports.
    pub fn with_tcp(mut self, tcp: TcpOptions) -> Self {
        self.tcp = tcp;
        self
    }
}

/// Route cache, selector, and request accounting shared by both flavors.
pub(crate) struct AgentCore {
    config: AgentConfig,
    selector: Option<Arc<dyn ProxySelector>>,
    route: Mutex<Option<ProxyRoute>>,
    request_count: Mutex<u64>,
}

impl AgentCore {
    pub(crate) fn new(
        config: AgentConfig,
        selector: Option<Arc<dyn ProxySelector>>,
    ) -> Result<Self> {
        match (&config.route, &selector) {
            (Some(_), Some(_)) => {
                return Err(AgentError::InvalidOption(
                    "static route and proxy selector are mutually exclusive".to_string(),
                ));
            }
            (None, None) => {
                return Err(AgentError::InvalidOption(
                    "either a proxy route or a proxy selector is required".to_string(),
                ));
            }
            _ => {}
        }
        if config.request_limit.is_some() && selector.is_none() {
            return Err(AgentError::InvalidOption(
                "request limit requires dynamic proxy selection".to_string(),
            ));
        }
        if let Some(ref route) = config.route {
            route.validate()?;
        }

        let route = Mutex::new(config.route.clone());
        Ok(Self {
            config,
            selector,
            route,
            request_count: Mutex::new(0),
        })
    }

    pub(crate) fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Account for one request routed through the pool.
    ///
    /// Returns true when the configured limit has been reached and the pool
    /// must be destroyed before this request is served (the counter then
    /// restarts at this request, which runs against a fresh pool).
    pub(crate) fn begin_request(&self) -> bool {
        let mut count = self.request_count.lock();
        if let Some(limit) = self.config.request_limit {
            if *count >= limit {
                *count = 1;
                return true;
            }
        }
        *count += 1;
        false
    }

    /// The active route, selecting one first if none is cached.
    pub(crate) async fn resolve_route(&self) -> Result<ProxyRoute> {
        if let Some(route) = self.route.lock().clone() {
            return Ok(route);
        }
        let selector = match self.selector {
            Some(ref selector) => Arc::clone(selector),
            // Unreachable through the public constructors, which require a
            // route or a selector.
            None => {
                return Err(AgentError::InvalidOption(
                    "no proxy route configured".to_string(),
                ));
            }
        };
        let route = selector.select_route().await?;
        route.validate()?;
        debug!(proxy = %route.proxy, "selected proxy route");
        *self.route.lock() = Some(route.clone());
        Ok(route)
    }

    /// Discard the cached route after a connect failure when the failure was
    /// the deadline and selection is dynamic: the selected proxy is assumed
    /// to have gone bad, and the next request re-selects.
    pub(crate) fn note_connect_failure(&self, err: &AgentError) {
        if err.is_timeout() && self.selector.is_some() {
            debug!("connect timed out, discarding selected proxy route");
            self.clear_route();
        }
    }

    /// Clear the cached route so the next request re-selects. A static route
    /// is never cleared.
    pub(crate) fn clear_route(&self) {
        if self.selector.is_some() {
            *self.route.lock() = None;
        }
    }

    /// Reset route cache and request counter (pool destruction).
    pub(crate) fn reset(&self) {
        self.clear_route();
        *self.request_count.lock() = 0;
    }

    pub(crate) fn active_route(&self) -> Option<ProxyRoute> {
        self.route.lock().clone()
    }
}

/// A pooled client transport: plain TCP or TLS.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
