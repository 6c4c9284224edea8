//! HTTP/2 multiplexed-session pooled agent.
//!
//! One session per (scheme, authority) carries many concurrent requests, so
//! entries have no in-use lock. Each session's connection future runs on a
//! spawned driver task; when it errors or closes the entry is flagged
//! revoked and pruned on the next pool access.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use h2::client::SendRequest;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::proxy::{self, ProxyConnectOptions};
use crate::tls::TlsClient;
use crate::types::{Endpoint, ProxyRoute, Scheme};

use super::{AgentConfig, AgentCore, ClientStream, ProxySelector};

/// Reuse key for multiplexed-session pooling: the authority is the
/// `host:port` string the remote presents itself as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct H2Key {
    pub scheme: Scheme,
    pub authority: String,
}

impl H2Key {
    pub fn new(scheme: Scheme, authority: impl Into<String>) -> Self {
        Self {
            scheme,
            authority: authority.into(),
        }
    }
}

struct H2Shared {
    revoked: AtomicBool,
}

struct H2Entry {
    key: H2Key,
    sender: SendRequest<Bytes>,
    shared: Arc<H2Shared>,
    driver: tokio::task::JoinHandle<()>,
    idle_since: Instant,
}

/// Pooled agent for HTTP/2 multiplexed sessions.
pub struct H2Agent {
    core: AgentCore,
    tls: TlsClient,
    entries: Mutex<Vec<H2Entry>>,
}

impl H2Agent {
    /// Create an agent with a static proxy route.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let core = AgentCore::new(config, None)?;
        Self::from_core(core)
    }

    /// Create an agent with dynamic proxy selection.
    pub fn with_selector(config: AgentConfig, selector: Arc<dyn ProxySelector>) -> Result<Self> {
        let core = AgentCore::new(config, Some(selector))?;
        Self::from_core(core)
    }

    fn from_core(core: AgentCore) -> Result<Self> {
        let tls = TlsClient::new(core.config().verify_peer, &[b"h2"])?;
        Ok(Self {
            core,
            tls,
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Get a request handle on a ready session for the destination, reusing
    /// the pooled session when one exists.
    ///
    /// Handles are cheap clones; concurrent requests share the session by
    /// protocol design, so there is nothing to release.
    pub async fn acquire(
        &self,
        scheme: Scheme,
        host: &str,
        port: u16,
    ) -> Result<SendRequest<Bytes>> {
        if self.core.begin_request() {
            debug!("request limit reached, destroying pool before serving");
            self.teardown_entries();
            self.core.clear_route();
        }
        self.prune();

        let key = H2Key::new(scheme, format!("{}:{}", host, port));
        if let Some(sender) = self.reuse(&key) {
            debug!(authority = %key.authority, "reusing pooled session");
            return Ok(sender);
        }

        let sender = self.open_session(scheme, host, port, key).await?;
        Ok(sender)
    }

    /// Revoke every session, clear the pool, and reset route and counter.
    pub fn destroy(&self) {
        self.teardown_entries();
        self.core.reset();
    }

    /// Number of live sessions in the pool.
    pub fn pooled(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| !e.shared.revoked.load(Ordering::SeqCst))
            .count()
    }

    /// The route requests are currently tunneled through, if resolved.
    pub fn active_route(&self) -> Option<ProxyRoute> {
        self.core.active_route()
    }

    fn reuse(&self, key: &H2Key) -> Option<SendRequest<Bytes>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.key == *key && !e.shared.revoked.load(Ordering::SeqCst))?;
        entry.idle_since = Instant::now();
        Some(entry.sender.clone())
    }

    async fn open_session(
        &self,
        scheme: Scheme,
        host: &str,
        port: u16,
        key: H2Key,
    ) -> Result<SendRequest<Bytes>> {
        let route = self.core.resolve_route().await?;
        let options = ProxyConnectOptions {
            endpoint: Endpoint::new(host, port),
            route,
            timeout: Some(self.core.config().connect_timeout),
            tcp: self.core.config().tcp.clone(),
        };
        let stream = match proxy::connect(&options).await {
            Ok(stream) => stream,
            Err(err) => {
                self.core.note_connect_failure(&err);
                return Err(err);
            }
        };

        let stream = if scheme.is_secure() {
            ClientStream::Tls(Box::new(self.tls.wrap(stream, host).await?))
        } else {
            ClientStream::Plain(stream)
        };

        let (sender, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| AgentError::SessionFailed(e.to_string()))?;

        let shared = Arc::new(H2Shared {
            revoked: AtomicBool::new(false),
        });
        let driver_shared = Arc::clone(&shared);
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP/2 connection terminated: {}", e);
            }
            driver_shared.revoked.store(true, Ordering::SeqCst);
        });

        // The session is not usable until the protocol reports readiness;
        // failing before that destroys session and transport together.
        let sender = match sender.ready().await {
            Ok(sender) => sender,
            Err(e) => {
                driver.abort();
                return Err(AgentError::SessionFailed(e.to_string()));
            }
        };

        let handle = sender.clone();
        self.entries.lock().push(H2Entry {
            key,
            sender,
            shared,
            driver,
            idle_since: Instant::now(),
        });
        Ok(handle)
    }

    fn teardown_entries(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.drain(..) {
            entry.shared.revoked.store(true, Ordering::SeqCst);
            entry.driver.abort();
        }
    }

    /// Drop sessions whose driver observed an error/close, and sessions idle
    /// past the steady-state timeout.
    fn prune(&self) {
        let idle_timeout = self.core.config().idle_timeout;
        let mut entries = self.entries.lock();
        entries.retain(|entry| {
            if entry.shared.revoked.load(Ordering::SeqCst) {
                return false;
            }
            if entry.idle_since.elapsed() > idle_timeout {
                entry.shared.revoked.store(true, Ordering::SeqCst);
                entry.driver.abort();
                return false;
            }
            true
        });
    }
}

impl Drop for H2Agent {
    fn drop(&mut self) {
        // Driver tasks hold the sockets; abort them so an agent dropped
        // without destroy() does not leak connections.
        self.teardown_entries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h2_key_uses_authority() {
        let a = H2Key::new(Scheme::Https, "example.com:443");
        let b = H2Key::new(Scheme::Https, "example.com:443");
        let c = H2Key::new(Scheme::Https, "example.com:8443");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_agent_requires_route_or_selector() {
        assert!(matches!(
            H2Agent::new(AgentConfig::default()),
            Err(AgentError::InvalidOption(_))
        ));
    }
}
