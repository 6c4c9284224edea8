//! SOCKS5 client negotiation.
//!
//! Drives the SOCKS5 wire protocol over an already-connected transport:
//! method negotiation, optional username/password authentication (RFC 1929),
//! and the CONNECT request. Targets are always sent with the domain-name
//! address encoding so the proxy performs name resolution; raw IPv4/IPv6
//! request encodings are not used.
//!
//! Stages run strictly in order and any wire-level mismatch is fatal to the
//! session; there are no retries. A reply that arrives fragmented is simply
//! awaited until the stage's discrete unit is complete; the caller's overall
//! deadline bounds the wait.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{AgentError, Hop, Result};
use crate::types::{Credentials, Endpoint, ProxyRoute};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_VERSION: u8 = 0x01;
const SOCKS5_AUTH_SUCCESS: u8 = 0x00;

const SOCKS5_CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS5_REP_SUCCESS: u8 = 0x00;

/// Run the full client side of a route over one transport.
///
/// With a bridge configured the negotiation sequence runs twice: first
/// addressed at the bridge with CONNECT target = the real proxy, then a
/// second full sequence over the tunneled stream addressed at the proxy with
/// CONNECT target = `endpoint`. The first hop never carries credentials.
pub async fn establish_route<S>(
    stream: &mut S,
    route: &ProxyRoute,
    endpoint: &Endpoint,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if route.bridge.is_some() {
        establish(stream, &route.proxy, None, Hop::Bridge).await?;
    }
    establish(stream, endpoint, route.credentials.as_ref(), Hop::Proxy).await
}

/// Run one SOCKS5 session: method negotiation, optional authentication, and
/// a CONNECT request for `target`.
///
/// On success the stream is the tunneled connection to `target`, with no
/// negotiation bytes left unconsumed.
pub async fn establish<S>(
    stream: &mut S,
    target: &Endpoint,
    credentials: Option<&Credentials>,
    hop: Hop,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, credentials.is_some(), hop).await?;
    if let Some(credentials) = credentials {
        authenticate(stream, credentials, hop).await?;
    }
    request_connect(stream, target, hop).await
}

/// Offer exactly one auth method and require the server to echo it.
async fn negotiate_method<S>(stream: &mut S, with_auth: bool, hop: Hop) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = if with_auth {
        SOCKS5_AUTH_PASSWORD
    } else {
        SOCKS5_AUTH_NONE
    };
    debug!(%hop, method, "negotiating auth method");

    stream
        .write_all(&[SOCKS5_VERSION, 1, method])
        .await
        .map_err(map_io_err)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(map_io_err)?;

    if reply[0] != SOCKS5_VERSION {
        return Err(AgentError::HandshakeFailed {
            hop,
            message: format!("unexpected version byte {:#04x}", reply[0]),
        });
    }
    if reply[1] != method {
        return Err(AgentError::HandshakeFailed {
            hop,
            message: format!(
                "server selected method {:#04x}, offered {:#04x}",
                reply[1], method
            ),
        });
    }
    Ok(())
}

/// RFC 1929 username/password sub-negotiation.
async fn authenticate<S>(stream: &mut S, credentials: &Credentials, hop: Hop) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Length limits are enforced before anything reaches the wire.
    credentials.validate()?;
    debug!(%hop, "authenticating");

    let user = credentials.username.as_bytes();
    let pass = credentials.password.as_bytes();
    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(SOCKS5_AUTH_VERSION);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);

    stream.write_all(&req).await.map_err(map_io_err)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(map_io_err)?;

    if reply[0] != SOCKS5_AUTH_VERSION {
        return Err(AgentError::AuthFailed {
            hop,
            message: format!("unexpected sub-negotiation version {:#04x}", reply[0]),
        });
    }
    if reply[1] != SOCKS5_AUTH_SUCCESS {
        return Err(AgentError::AuthFailed {
            hop,
            message: format!("status {:#04x}", reply[1]),
        });
    }
    Ok(())
}

/// Send a CONNECT request for `target` and consume the full reply.
async fn request_connect<S>(stream: &mut S, target: &Endpoint, hop: Hop) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    target.validate("target")?;
    debug!(%hop, target = %target, "requesting CONNECT");

    let host = target.host.as_bytes();
    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00, SOCKS5_ATYP_DOMAIN]);
    req.push(host.len() as u8);
    req.extend_from_slice(host);
    req.extend_from_slice(&target.port.to_be_bytes());

    stream.write_all(&req).await.map_err(map_io_err)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(map_io_err)?;

    if header[0] != SOCKS5_VERSION {
        return Err(AgentError::RequestFailed {
            hop,
            message: format!("unexpected version byte {:#04x}", header[0]),
        });
    }
    if header[1] != SOCKS5_REP_SUCCESS {
        return Err(AgentError::RequestFailed {
            hop,
            message: rep_to_string(header[1]).to_string(),
        });
    }

    // The bound address is accepted as-is, but it must be drained so the
    // tunneled stream starts clean (the next hop's negotiation, or the
    // caller's data, begins right after it).
    drain_bound_addr(stream, header[3], hop).await
}

async fn drain_bound_addr<S>(stream: &mut S, atyp: u8, hop: Hop) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr_len = match atyp {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(map_io_err)?;
            len[0] as usize
        }
        atyp => {
            return Err(AgentError::RequestFailed {
                hop,
                message: format!("unknown address type {:#04x} in reply", atyp),
            });
        }
    };

    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.map_err(map_io_err)?;
    Ok(())
}

/// Convert an RFC 1928 reply code to its meaning.
fn rep_to_string(rep: u8) -> &'static str {
    match rep {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "undefined",
    }
}

fn map_io_err(e: std::io::Error) -> AgentError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        AgentError::ConnectionClosed
    } else {
        AgentError::ConnectError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_negotiate_method_no_auth_frame() {
        let (mut client, mut server) = duplex(64);
        let session = tokio::spawn(async move {
            negotiate_method(&mut client, false, Hop::Proxy).await
        });

        let mut offer = [0u8; 3];
        server.read_exact(&mut offer).await.unwrap();
        assert_eq!(offer, [0x05, 0x01, 0x00]);
        server.write_all(&[0x05, 0x00]).await.unwrap();

        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_method_rejects_wrong_echo() {
        let (mut client, mut server) = duplex(64);
        let session =
            tokio::spawn(async move { negotiate_method(&mut client, false, Hop::Proxy).await });

        let mut offer = [0u8; 3];
        server.read_exact(&mut offer).await.unwrap();
        // Server picks auth although none was offered.
        server.write_all(&[0x05, 0x02]).await.unwrap();

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::HandshakeFailed { hop: Hop::Proxy, .. }));
    }

    #[tokio::test]
    async fn test_authenticate_frame_and_success() {
        let (mut client, mut server) = duplex(64);
        let credentials = Credentials::new("user", "pw");
        let session = tokio::spawn(async move {
            authenticate(&mut client, &credentials, Hop::Proxy).await
        });

        let mut frame = [0u8; 9];
        server.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"\x01\x04user\x02pw");
        server.write_all(&[0x01, 0x00]).await.unwrap();

        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_authenticate_rejected_status() {
        let (mut client, mut server) = duplex(64);
        let credentials = Credentials::new("user", "pw");
        let session = tokio::spawn(async move {
            authenticate(&mut client, &credentials, Hop::Bridge).await
        });

        let mut frame = [0u8; 9];
        server.read_exact(&mut frame).await.unwrap();
        server.write_all(&[0x01, 0x01]).await.unwrap();

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::AuthFailed { hop: Hop::Bridge, .. }));
    }

    #[tokio::test]
    async fn test_oversized_credentials_never_reach_wire() {
        let (mut client, mut server) = duplex(64);
        let credentials = Credentials::new("u".repeat(256), "pw");
        let err = authenticate(&mut client, &credentials, Hop::Proxy)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidOption(_)));

        // Nothing was written: the peer sees EOF once the writer is dropped.
        drop(client);
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_request_connect_domain_encoding() {
        let (mut client, mut server) = duplex(128);
        let target = Endpoint::new("example.com", 443);
        let session =
            tokio::spawn(async move { request_connect(&mut client, &target, Hop::Proxy).await });

        let mut frame = [0u8; 18];
        server.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
        assert_eq!(&frame[5..16], b"example.com");
        assert_eq!(&frame[16..], &[0x01, 0xbb]);

        server
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_request_connect_drains_domain_reply() {
        let (mut client, mut server) = duplex(128);
        let target = Endpoint::new("example.com", 80);
        let session = tokio::spawn(async move {
            request_connect(&mut client, &target, Hop::Proxy).await?;
            // The next read must see tunneled data, not reply leftovers.
            let mut follow = [0u8; 4];
            client.read_exact(&mut follow).await.map_err(map_io_err)?;
            Ok::<_, AgentError>(follow)
        });

        let mut frame = [0u8; 18];
        server.read_exact(&mut frame).await.unwrap();
        server
            .write_all(&[0x05, 0x00, 0x00, 0x03, 4, b'p', b'r', b'x', b'y', 0x04, 0x38])
            .await
            .unwrap();
        server.write_all(b"data").await.unwrap();

        assert_eq!(&session.await.unwrap().unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_request_connect_failure_code() {
        let (mut client, mut server) = duplex(128);
        let target = Endpoint::new("example.com", 80);
        let session =
            tokio::spawn(async move { request_connect(&mut client, &target, Hop::Proxy).await });

        let mut frame = [0u8; 18];
        server.read_exact(&mut frame).await.unwrap();
        server
            .write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = session.await.unwrap().unwrap_err();
        match err {
            AgentError::RequestFailed { hop, message } => {
                assert_eq!(hop, Hop::Proxy);
                assert_eq!(message, "general SOCKS server failure");
            }
            other => panic!("expected RequestFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fragmented_reply_is_deferred() {
        let (mut client, mut server) = duplex(64);
        let session =
            tokio::spawn(async move { negotiate_method(&mut client, false, Hop::Proxy).await });

        let mut offer = [0u8; 3];
        server.read_exact(&mut offer).await.unwrap();
        // Deliver the 2-byte reply one byte at a time.
        server.write_all(&[0x05]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        server.write_all(&[0x00]).await.unwrap();

        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_peer_eof_is_connection_closed() {
        let (mut client, mut server) = duplex(64);
        let session =
            tokio::spawn(async move { negotiate_method(&mut client, false, Hop::Proxy).await });

        let mut offer = [0u8; 3];
        server.read_exact(&mut offer).await.unwrap();
        drop(server);

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::ConnectionClosed));
    }

    #[test]
    fn test_rep_to_string_table() {
        assert_eq!(rep_to_string(0x00), "succeeded");
        assert_eq!(rep_to_string(0x05), "connection refused");
        assert_eq!(rep_to_string(0xAA), "undefined");
    }
}
