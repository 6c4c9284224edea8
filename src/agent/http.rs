//! Plain/TLS pooled agent.
//!
//! Pools one transport per request/response cycle: an entry is locked while
//! checked out and returns to the idle pool only once the caller releases it
//! after consuming the response. The lock is ownership: a checked-out
//! stream lives inside the guard, so two requests can never share it.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::proxy::{self, ProxyConnectOptions};
use crate::tls::TlsClient;
use crate::types::{Endpoint, ProxyRoute, Scheme};

use super::{AgentConfig, AgentCore, ClientStream, EntryState, ProxySelector};

/// Reuse key for plain/TLS pooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }
}

struct PoolEntry {
    id: u64,
    key: PoolKey,
    state: EntryState,
    /// Present while the entry is idle; owned by the guard while checked out.
    stream: Option<ClientStream>,
    idle_since: Instant,
}

/// Pooled agent for HTTP/1.x-style exclusive transports.
pub struct HttpAgent {
    core: AgentCore,
    tls: TlsClient,
    entries: Mutex<Vec<PoolEntry>>,
    next_id: AtomicU64,
}

impl HttpAgent {
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
        let tls = TlsClient::new(core.config().verify_peer, &[])?;
        Ok(Self {
            core,
            tls,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Get a ready transport for the destination, reusing an idle pooled
    /// entry when one exists.
    ///
    /// The returned guard locks the entry for one request/response cycle:
    /// call [`PooledStream::release`] once the response has been fully
    /// consumed, or drop the guard to revoke the entry.
    pub async fn acquire(&self, scheme: Scheme, host: &str, port: u16) -> Result<PooledStream<'_>> {
        if self.core.begin_request() {
            debug!("request limit reached, destroying pool before serving");
            self.teardown_entries();
            self.core.clear_route();
        }
        self.prune_idle();

        let key = PoolKey::new(scheme, host, port);
        if let Some(stream) = self.checkout(&key) {
            debug!(host, port, "reusing pooled transport");
            return Ok(PooledStream {
                agent: self,
                entry_id: self.insert_in_use(key),
                stream: Some(stream),
            });
        }

        let stream = self.open_transport(scheme, host, port).await?;
        Ok(PooledStream {
            agent: self,
            entry_id: self.insert_in_use(key),
            stream: Some(stream),
        })
    }

    /// Revoke every entry, clear the pool, and reset route and counter.
    pub fn destroy(&self) {
        self.teardown_entries();
        self.core.reset();
    }

    /// Number of entries currently tracked by the pool.
    pub fn pooled(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.state != EntryState::Revoked)
            .count()
    }

    /// The route requests are currently tunneled through, if resolved.
    pub fn active_route(&self) -> Option<ProxyRoute> {
        self.core.active_route()
    }

    async fn open_transport(&self, scheme: Scheme, host: &str, port: u16) -> Result<ClientStream> {
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

        if scheme.is_secure() {
            let tls_stream = self.tls.wrap(stream, host).await?;
            Ok(ClientStream::Tls(Box::new(tls_stream)))
        } else {
            Ok(ClientStream::Plain(stream))
        }
    }

    /// Take the stream out of a matching idle entry, removing the entry.
    fn checkout(&self, key: &PoolKey) -> Option<ClientStream> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.state == EntryState::Ready && e.key == *key)?;
        let entry = entries.remove(pos);
        entry.stream
    }

    fn insert_in_use(&self, key: PoolKey) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(PoolEntry {
            id,
            key,
            state: EntryState::InUse,
            stream: None,
            idle_since: Instant::now(),
        });
        id
    }

    fn checkin(&self, id: u64, stream: ClientStream) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.id == id) {
            Some(pos) if entries[pos].state == EntryState::Revoked => {
                entries.remove(pos);
                Err(AgentError::ConnectionLost(
                    "pooled transport was revoked".to_string(),
                ))
            }
            Some(pos) => {
                let entry = &mut entries[pos];
                entry.state = EntryState::Ready;
                entry.stream = Some(stream);
                entry.idle_since = Instant::now();
                Ok(())
            }
            None => Err(AgentError::ConnectionLost(
                "pooled transport was revoked".to_string(),
            )),
        }
    }

    /// Forget a checked-out entry whose request failed mid-flight.
    fn discard(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Revoke every entry. Idle streams are destroyed immediately; in-use
    /// entries stay as revoked markers until their guard checks in.
    /// Already-revoked entries are untouched.
    fn teardown_entries(&self) {
        let mut entries = self.entries.lock();
        entries.retain_mut(|entry| match entry.state {
            EntryState::Ready => false,
            EntryState::InUse | EntryState::Revoked => {
                entry.state = EntryState::Revoked;
                true
            }
        });
    }

    /// Drop idle entries whose steady-state timeout elapsed. In-use entries
    /// carry no idle clock.
    fn prune_idle(&self) {
        let idle_timeout = self.core.config().idle_timeout;
        let mut entries = self.entries.lock();
        entries.retain(|e| {
            !(e.state == EntryState::Ready && e.idle_since.elapsed() > idle_timeout)
        });
    }
}

/// A checked-out pooled transport.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]; the entry stays locked until
/// [`release`](Self::release) is called after the response has been fully
/// consumed. Dropping the guard without releasing revokes the entry and
/// destroys the transport.
pub struct PooledStream<'a> {
    agent: &'a HttpAgent,
    entry_id: u64,
    stream: Option<ClientStream>,
}

impl std::fmt::Debug for PooledStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledStream")
            .field("entry_id", &self.entry_id)
            .field("released", &self.stream.is_none())
            .finish()
    }
}

impl PooledStream<'_> {
    /// Return the transport to the idle pool.
    ///
    /// Fails with [`AgentError::ConnectionLost`] when the entry was revoked
    /// while this request held it (pool destruction or request-limit
    /// teardown); the transport is destroyed in that case.
    pub fn release(mut self) -> Result<()> {
        match self.stream.take() {
            Some(stream) => self.agent.checkin(self.entry_id, stream),
            None => Ok(()),
        }
    }
}

impl Drop for PooledStream<'_> {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.agent.discard(self.entry_id);
        }
    }
}

impl AsyncRead for PooledStream<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(released())),
        }
    }
}

impl AsyncWrite for PooledStream<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Err(released())),
        }
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pooled stream already released")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_key_equality() {
        let a = PoolKey::new(Scheme::Http, "example.com", 80);
        let b = PoolKey::new(Scheme::Http, "example.com", 80);
        let c = PoolKey::new(Scheme::Https, "example.com", 80);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_agent_requires_route_or_selector() {
        assert!(matches!(
            HttpAgent::new(AgentConfig::default()),
            Err(AgentError::InvalidOption(_))
        ));
    }
}
