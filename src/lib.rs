//! SOCKS Agent - a SOCKS5 client and pooled HTTP/HTTP2 agent engine for Rust
//!
//! This library routes HTTP and HTTP/2 client traffic through one or two
//! chained SOCKS5 proxies, with support for:
//! - Bounded-time raw connect (one deadline for dial plus negotiation)
//! - SOCKS5 method negotiation and username/password authentication
//! - Two-hop "bridge" chaining (proxy reached through a first proxy)
//! - Endpoint-keyed transport pooling with in-use locking (HTTP flavor)
//! - Multiplexed HTTP/2 session pooling keyed by scheme and authority
//! - Lazy proxy selection with rotation on connect timeout and after a
//!   configured number of requests
//! - TLS wrapping of pooled transports with optional verification opt-out
//!
//! # Example
//!
//! ```rust,no_run
//! use socks_agent_r::{AgentConfig, Credentials, Endpoint, HttpAgent, ProxyRoute, Scheme};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> socks_agent_r::Result<()> {
//!     let route = ProxyRoute::new(Endpoint::new("proxy.example.com", 1080))
//!         .with_credentials(Credentials::new("user", "pass"));
//!     let agent = HttpAgent::new(AgentConfig::with_route(route))?;
//!
//!     let mut stream = agent.acquire(Scheme::Http, "example.com", 80).await?;
//!     stream
//!         .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
//!         .await
//!         .map_err(|e| socks_agent_r::AgentError::ConnectError(e.to_string()))?;
//!
//!     let mut response = vec![0u8; 4096];
//!     let n = stream
//!         .read(&mut response)
//!         .await
//!         .map_err(|e| socks_agent_r::AgentError::ConnectError(e.to_string()))?;
//!     println!("{}", String::from_utf8_lossy(&response[..n]));
//!
//!     // Return the transport to the pool once the response is consumed.
//!     stream.release()?;
//!     Ok(())
//! }
//! ```
//!
//! # Proxy routes
//!
//! A [`ProxyRoute`] names the SOCKS5 proxy, an optional bridge proxy, and
//! optional credentials. With a bridge the client negotiates twice: once with
//! the bridge (CONNECT target = the real proxy, never authenticated), then a
//! second full session with the proxy over the tunneled stream. Routes are
//! either static or produced lazily by a [`ProxySelector`]; a selected route
//! is discarded after a connect timeout or when the configured request limit
//! tears the pool down, so the next request picks a fresh proxy.

pub mod agent;
pub mod dial;
pub mod error;
pub mod proxy;
pub mod socks5;
pub mod tls;
pub mod types;

// Re-export commonly used items
pub use error::{AgentError, Hop, Result};
pub use types::{Credentials, Endpoint, ProxyRoute, Scheme};

// Re-export dial types
pub use dial::{dial, TcpOptions, DEFAULT_DIAL_TIMEOUT};

// Re-export proxy connect types
pub use proxy::ProxyConnectOptions;

// Re-export agent types
pub use agent::{
    AgentConfig, EntryState, H2Agent, H2Key, HttpAgent, PoolKey, PooledStream, ProxySelector,
    DEFAULT_IDLE_TIMEOUT,
};

// Re-export TLS types
pub use tls::TlsClient;
