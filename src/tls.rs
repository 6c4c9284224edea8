//! Secure-channel wrapper for pooled transports.
//!
//! Builds one rustls client configuration per agent (system trust roots,
//! optional ALPN, optional verification bypass) and wraps raw transports in
//! TLS addressed at the destination host.

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::warn;

use crate::error::{AgentError, Result};

/// TLS client for wrapping pooled transports.
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    /// Build a client configuration.
    ///
    /// `verify_peer: false` installs a verifier that accepts any certificate;
    /// connections then succeed without peer verification, which is the
    /// explicit opt-out the pool configuration exposes.
    pub fn new(verify_peer: bool, alpn: &[&[u8]]) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                for cert in certs {
                    // Skip anchors the parser rejects; the store only needs
                    // enough roots to verify the peers actually contacted.
                    let _ = root_store.add(&rustls::Certificate(cert.0));
                }
            }
            // Verified handshakes will fail per-connection instead; agents
            // that never wrap a transport are unaffected.
            Err(e) => warn!("failed to load native root certificates: {}", e),
        }
        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        if !verify_peer {
            warn!("peer verification disabled for pooled transports");
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerify));
        }

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Wrap `stream` in a secure channel addressed at `host`.
    pub async fn wrap<S>(&self, stream: S, host: &str) -> Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(host)
            .map_err(|_| AgentError::TlsFailed(format!("invalid server name: {}", host)))?;
        self.connector
            .connect(name, stream)
            .await
            .map_err(|e| AgentError::TlsFailed(e.to_string()))
    }
}

struct NoVerify;

impl rustls::client::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
