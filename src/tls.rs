//! TLS termination with on-demand leaf certificates.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::Acceptor;
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::debug;

use crate::ca::IssuedCertificate;
use crate::coordinator::{IssuanceCoordinator, IssueError};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid PEM material: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),
    #[error("failed to build TLS configuration: {0}")]
    Config(#[from] rustls::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("no SNI provided by client")]
    NoSni,
    #[error(transparent)]
    Issue(#[from] IssueError),
}

impl IssuedCertificate {
    fn der_material(&self) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), TlsError> {
        let cert = CertificateDer::from_pem_slice(self.certificate_pem().as_bytes())?;
        let key = PrivateKeyDer::from_pem_slice(self.private_key_pem().as_bytes())?;
        Ok((cert, key))
    }

    /// Converts the leaf into a rustls certified key, for use from a
    /// certificate resolver.
    pub fn certified_key(&self) -> Result<CertifiedKey, TlsError> {
        let (cert, key) = self.der_material()?;
        let signing_key = ring::sign::any_supported_type(&key)?;
        Ok(CertifiedKey::new(vec![cert], signing_key))
    }

    /// Builds a server configuration presenting this leaf.
    pub fn server_config(&self, alpn_protocols: &[Vec<u8>]) -> Result<Arc<ServerConfig>, TlsError> {
        let (cert, key) = self.der_material()?;
        let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;
        config.alpn_protocols = alpn_protocols.to_vec();
        Ok(Arc::new(config))
    }
}

/// TLS acceptor that picks the leaf certificate from the client's SNI.
#[derive(Clone)]
pub struct TlsAcceptor {
    coordinator: IssuanceCoordinator,
    alpn_protocols: Arc<Vec<Vec<u8>>>,
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor issuing through the given coordinator.
    pub fn new(coordinator: IssuanceCoordinator) -> Self {
        Self {
            coordinator,
            alpn_protocols: Arc::new(Vec::new()),
        }
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = Arc::new(protocols);
        self
    }

    /// Accepts a TLS connection, performing the handshake.
    /// Returns the TLS stream and the SNI the client asked for.
    ///
    /// The ClientHello is read before any certificate exists, so the leaf
    /// can be requested, and awaited, for exactly the name the client wants.
    pub async fn accept<IO>(&self, stream: IO) -> Result<(TlsStream<IO>, String), TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(TlsError::Handshake)?;

        let Some(sni) = start.client_hello().server_name().map(str::to_owned) else {
            return Err(TlsError::NoSni);
        };
        debug!("resolving certificate for SNI: {}", sni);

        let issued = self.coordinator.request_certificate(&sni).await?;
        let config = issued.server_config(&self.alpn_protocols)?;
        let tls_stream = start
            .into_stream(config)
            .await
            .map_err(TlsError::Handshake)?;

        debug!("TLS handshake completed, SNI: {}", sni);
        Ok((tls_stream, sni))
    }
}
