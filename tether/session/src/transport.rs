//! TCP and TLS transport for tether sessions.
//!
//! Provides the unified stream type used by session loops, plus the TLS
//! acceptor construction that implements the security configuration:
//! certificate/key loading, optional mutual authentication, and optional
//! acceptance of unverifiable client certificates.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// Transport security for accepted connections.
#[derive(Debug, Clone, Default)]
pub enum SecurityConfig {
    /// Plain TCP, no encryption
    #[default]
    None,
    /// TLS with the given settings
    Tls(TlsSettings),
}

/// TLS acceptor settings.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Path to the server certificate chain (PEM)
    pub cert_file: PathBuf,
    /// Path to the server private key (PEM, PKCS#8)
    pub key_file: PathBuf,
    /// Path to the CA bundle used to verify client certificates (PEM).
    /// Required when `require_client_cert` is set and
    /// `accept_invalid_client_certs` is not.
    pub ca_file: Option<PathBuf>,
    /// Accept client certificates without validating them
    pub accept_invalid_client_certs: bool,
    /// Require every client to present a certificate (mutual authentication)
    pub require_client_cert: bool,
}

/// Unified stream type that can be either plain TCP or TLS.
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream, server side
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Create a TCP listener bound to the given address.
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address.
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS acceptor construction and handshake handling.
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
    use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
    use rustls::{DistinguishedName, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::TlsAcceptor;
    use tracing::{debug, info};

    /// TLS server acceptor wrapper.
    pub struct TlsServer {
        acceptor: TlsAcceptor,
    }

    /// Client certificate verifier that accepts any presented certificate.
    ///
    /// Used when `accept_invalid_client_certs` is set: a certificate may
    /// still be demanded (mutual authentication) but its chain is not
    /// validated.
    #[derive(Debug)]
    struct AcceptAnyClientCert {
        mandatory: bool,
        supported: rustls::crypto::WebPkiSupportedAlgorithms,
    }

    impl ClientCertVerifier for AcceptAnyClientCert {
        fn root_hint_subjects(&self) -> &[DistinguishedName] {
            &[]
        }

        fn verify_client_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _now: UnixTime,
        ) -> Result<ClientCertVerified, rustls::Error> {
            Ok(ClientCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.supported.supported_schemes()
        }

        fn offer_client_auth(&self) -> bool {
            true
        }

        fn client_auth_mandatory(&self) -> bool {
            self.mandatory
        }
    }

    /// Create a TLS server configuration from the security settings.
    pub fn make_server_config(settings: &TlsSettings) -> Result<ServerConfig> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let cert_pem = std::fs::read(&settings.cert_file)
            .with_context(|| format!("failed to read {}", settings.cert_file.display()))?;
        let key_pem = std::fs::read(&settings.key_file)
            .with_context(|| format!("failed to read {}", settings.key_file.display()))?;

        let cert_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect();
        let certs = cert_results
            .context("failed to parse certificate chain")?
            .into_iter()
            .collect::<Vec<_>>();
        if certs.is_empty() {
            anyhow::bail!("no certificates found in certificate chain");
        }

        let key = {
            let key_results: Result<Vec<_>, _> =
                rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice()).collect();
            let mut keys = key_results.context("failed to parse private key")?;
            if keys.is_empty() {
                anyhow::bail!("no private key found");
            }
            PrivateKeyDer::from(keys.remove(0))
        };

        let builder = ServerConfig::builder();

        let config = if settings.accept_invalid_client_certs {
            let verifier = Arc::new(AcceptAnyClientCert {
                mandatory: settings.require_client_cert,
                supported: rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms,
            });
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .context("failed to configure server certificate")?
        } else if settings.require_client_cert {
            let ca_file = settings
                .ca_file
                .as_ref()
                .context("mutual authentication requires a CA bundle")?;
            let ca_pem = std::fs::read(ca_file)
                .with_context(|| format!("failed to read {}", ca_file.display()))?;

            let mut roots = RootCertStore::empty();
            let ca_results: Result<Vec<_>, _> =
                rustls_pemfile::certs(&mut ca_pem.as_slice()).collect();
            for ca_cert in ca_results.context("failed to parse CA certificates")? {
                roots
                    .add(ca_cert)
                    .context("failed to add CA certificate to root store")?;
            }

            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("failed to build client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .context("failed to configure server certificate")?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("failed to configure server certificate")?
        };

        info!(
            "TLS server configuration created (mutual_auth={}, accept_invalid={})",
            settings.require_client_cert, settings.accept_invalid_client_certs
        );
        Ok(config)
    }

    /// Create a TLS acceptor from a server configuration.
    pub fn tls_acceptor(config: ServerConfig) -> TlsServer {
        TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Accept a TLS connection.
    ///
    /// Fails closed before any application data when the handshake, or a
    /// mandatory client certificate, is rejected.
    pub async fn accept_tls(acceptor: &TlsServer, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr().ok();
        debug!("accepting TLS connection from {:?}", peer_addr);

        let tls_stream = acceptor
            .acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {:?}", peer_addr))?;

        Ok(IoStream::Tls(Box::new(tls_stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr).await.unwrap();
        let io_stream = IoStream::Plain(stream);

        assert!(io_stream.peer_addr().is_ok());
    }
}
