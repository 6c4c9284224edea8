use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// A network destination: hostname (or IP literal) and port.
///
/// Identifies any destination the crate talks to: the real target, a proxy,
/// or a bridge. The host is sent to proxies verbatim using the SOCKS5
/// domain-name encoding, so it must fit in a single length-prefixed byte
/// (255 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new Endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the address string in host:port format
    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn validate(&self, what: &str) -> Result<()> {
        if self.host.is_empty() {
            return Err(AgentError::InvalidOption(format!(
                "{} host must not be empty",
                what
            )));
        }
        if self.host.len() > 255 {
            return Err(AgentError::InvalidOption(format!(
                "{} host exceeds 255 bytes",
                what
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Username/password pair for SOCKS5 sub-negotiation (RFC 1929).
///
/// Each field is limited to 255 UTF-8 bytes by the wire format; exceeding
/// that is a configuration error caught before anything is written.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Create a new credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.username.len() > 255 {
            return Err(AgentError::InvalidOption(
                "proxy username exceeds 255 bytes".to_string(),
            ));
        }
        if self.password.len() > 255 {
            return Err(AgentError::InvalidOption(
                "proxy password exceeds 255 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach targets: a SOCKS5 proxy, optionally behind a bridge proxy,
/// optionally authenticating at the final hop.
///
/// With a bridge configured the client first opens a SOCKS5 session to the
/// bridge whose CONNECT target is the proxy, then runs a second full session
/// to the proxy over that tunneled stream. Only the second hop carries
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    /// The SOCKS5 proxy that opens the final connection.
    pub proxy: Endpoint,
    /// Optional first-hop proxy used only to reach `proxy`.
    pub bridge: Option<Endpoint>,
    /// Optional credentials, applied at the final hop only.
    pub credentials: Option<Credentials>,
}

impl ProxyRoute {
    /// Create a direct (bridge-less, unauthenticated) route.
    pub fn new(proxy: Endpoint) -> Self {
        Self {
            proxy,
            bridge: None,
            credentials: None,
        }
    }

    /// Set a bridge proxy.
    pub fn with_bridge(mut self, bridge: Endpoint) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Set credentials for the final hop.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// The endpoint the raw transport is opened to.
    pub(crate) fn first_hop(&self) -> &Endpoint {
        self.bridge.as_ref().unwrap_or(&self.proxy)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.proxy.validate("proxy")?;
        if let Some(ref bridge) = self.bridge {
            bridge.validate("bridge")?;
        }
        if let Some(ref credentials) = self.credentials {
            credentials.validate()?;
        }
        Ok(())
    }
}

/// URL scheme of a pooled destination.
///
/// Decides whether the pooled transport is wrapped in TLS before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// True when the transport must be wrapped in a secure channel.
    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Https)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
