use std::fmt;

use thiserror::Error;

/// Which SOCKS5 hop an error occurred on.
///
/// With bridge chaining the client runs two full negotiations; callers that
/// see a protocol error need to know which of the two servers produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// The first hop (the bridge proxy). Never carries credentials.
    Bridge,
    /// The final hop (the real proxy).
    Proxy,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Bridge => write!(f, "bridge"),
            Hop::Proxy => write!(f, "proxy"),
        }
    }
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Bad configuration or arguments, detected before any I/O.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Raw-transport connect or I/O failure.
    #[error("Connect error: {0}")]
    ConnectError(String),

    /// The connect-phase deadline elapsed before the transport was usable.
    #[error("Connect timed out")]
    TimedOut,

    /// The transport closed before the attempt completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// SOCKS5 method negotiation was rejected or malformed.
    #[error("SOCKS5 handshake with {hop} failed: {message}")]
    HandshakeFailed { hop: Hop, message: String },

    /// SOCKS5 username/password sub-negotiation failed.
    #[error("SOCKS5 authentication with {hop} failed: {message}")]
    AuthFailed { hop: Hop, message: String },

    /// The SOCKS5 CONNECT request was refused or the reply was malformed.
    #[error("SOCKS5 request to {hop} failed: {message}")]
    RequestFailed { hop: Hop, message: String },

    /// Secure-channel establishment failed or the peer was not verified.
    #[error("TLS error: {0}")]
    TlsFailed(String),

    /// HTTP/2 session negotiation failed before the session became usable.
    #[error("HTTP/2 session error: {0}")]
    SessionFailed(String),

    /// A pooled transport was revoked while a request was attached to it.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl AgentError {
    /// True when the failure cause was the connect-phase deadline.
    ///
    /// Pools use this to tell "proxy unreachable or slow" apart from "proxy
    /// rejected us" when deciding whether to discard a selected route.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::TimedOut)
    }

    /// The hop a SOCKS5 protocol error occurred on, if any.
    pub fn hop(&self) -> Option<Hop> {
        match self {
            AgentError::HandshakeFailed { hop, .. }
            | AgentError::AuthFailed { hop, .. }
            | AgentError::RequestFailed { hop, .. } => Some(*hop),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_matchable() {
        // Rotation policy matches on the error, not on message strings.
        let err = AgentError::TimedOut;
        assert!(err.is_timeout());
        assert!(!AgentError::ConnectionClosed.is_timeout());
    }

    #[test]
    fn test_protocol_errors_carry_hop() {
        let err = AgentError::RequestFailed {
            hop: Hop::Bridge,
            message: "general SOCKS server failure".into(),
        };
        assert_eq!(err.hop(), Some(Hop::Bridge));
        assert_eq!(AgentError::TimedOut.hop(), None);
    }

    #[test]
    fn test_display_includes_hop_and_message() {
        let err = AgentError::AuthFailed {
            hop: Hop::Proxy,
            message: "status 0x01".into(),
        };
        let display = format!("{}", err);
        assert!(display.contains("proxy"), "got: {}", display);
        assert!(display.contains("status 0x01"), "got: {}", display);
    }
}
