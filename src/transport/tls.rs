//! # TLS Transport Abstraction
//!
//! Pluggable factory producing TLS engines bound to a logical remote
//! identity, plus the peer-verification strategy a channel applies after the
//! handshake.
//!
//! Verification may block (interactive prompts, revocation checks), so the
//! channel never runs it on a worker thread: [`run_verification`] dispatches
//! it to the blocking executor and the channel awaits the published result.
//!
//! ## Responsibilities
//! - Build rustls client/server engines from PEM material
//! - Certificate pinning by SHA-256 fingerprint
//! - Interactive (trust-on-first-use style) verification via a feedback hook
//! - Self-signed certificate generation for development and tests

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::error::{ProtocolError, Result};

/// Logical identity of a peer, distinct from whatever socket address the
/// connection happens to travel over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used for resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Factory for TLS engines plus the peer-verification strategy.
pub trait TlsTransport: Send + Sync + 'static {
    /// TLS engine for an outbound connection to `remote`.
    fn client_engine(&self, remote: &RemoteAddress) -> Result<(TlsConnector, ServerName)>;

    /// TLS engine for inbound connections.
    fn server_engine(&self) -> Result<TlsAcceptor>;

    /// Whether sessions need an explicit verification step after the TLS
    /// handshake completes.
    fn requires_verification(&self) -> bool {
        false
    }

    /// Verify an established session. May block on interactive I/O or
    /// revocation checks; always invoked on the blocking executor, never on a
    /// worker thread.
    fn verify_session(&self, _remote: &RemoteAddress, _peer_certs: &[Certificate]) -> Result<()> {
        Ok(())
    }

    /// Optional interactive override (e.g. trust-on-first-use prompt).
    fn certificate_feedback(&self, _peer_certs: &[Certificate]) -> bool {
        false
    }
}

/// Dispatch session verification to the blocking executor and wait for its
/// published result without blocking the worker thread.
pub async fn run_verification(
    transport: Arc<dyn TlsTransport>,
    remote: RemoteAddress,
    peer_certs: Vec<Certificate>,
) -> Result<()> {
    tokio::task::spawn_blocking(move || transport.verify_session(&remote, &peer_certs))
        .await
        .map_err(|e| ProtocolError::Tls(format!("verification task failed: {e}")))?
}

/// SHA-256 fingerprint of a certificate, as used for pinning.
pub fn certificate_fingerprint(cert: &Certificate) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(&cert.0);
    hasher.finalize().to_vec()
}

type FeedbackFn = dyn Fn(&[Certificate]) -> bool + Send + Sync;

/// rustls-backed [`TlsTransport`] implementation.
pub struct RustlsTransport {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    feedback: Option<Arc<FeedbackFn>>,
}

impl RustlsTransport {
    pub fn builder() -> RustlsTransportBuilder {
        RustlsTransportBuilder::default()
    }

    /// Generate a self-signed certificate/key pair for development and
    /// testing, returning the certificate's SHA-256 fingerprint for pinning.
    pub fn generate_self_signed<P: AsRef<Path>>(
        cert_path: P,
        key_path: P,
        host: &str,
    ) -> Result<Vec<u8>> {
        let cert = rcgen::generate_simple_self_signed(vec![host.into()])
            .map_err(|e| ProtocolError::Tls(format!("certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(certificate_fingerprint(&Certificate(cert.cert.der().to_vec())))
    }
}

impl TlsTransport for RustlsTransport {
    fn client_engine(&self, remote: &RemoteAddress) -> Result<(TlsConnector, ServerName)> {
        let config = self
            .client
            .as_ref()
            .ok_or_else(|| ProtocolError::Tls("no client trust configuration".into()))?;
        let name = ServerName::try_from(remote.host.as_str())
            .map_err(|_| ProtocolError::Tls(format!("invalid server name: {}", remote.host)))?;
        Ok((TlsConnector::from(config.clone()), name))
    }

    fn server_engine(&self) -> Result<TlsAcceptor> {
        let config = self
            .server
            .as_ref()
            .ok_or_else(|| ProtocolError::Tls("no server certificate configured".into()))?;
        Ok(TlsAcceptor::from(config.clone()))
    }

    fn requires_verification(&self) -> bool {
        self.feedback.is_some()
    }

    fn verify_session(&self, remote: &RemoteAddress, peer_certs: &[Certificate]) -> Result<()> {
        if !self.requires_verification() {
            return Ok(());
        }
        if self.certificate_feedback(peer_certs) {
            Ok(())
        } else {
            Err(ProtocolError::Tls(format!(
                "certificate for {remote} rejected by feedback"
            )))
        }
    }

    fn certificate_feedback(&self, peer_certs: &[Certificate]) -> bool {
        match &self.feedback {
            Some(feedback) => feedback(peer_certs),
            None => false,
        }
    }
}

/// Builder for [`RustlsTransport`].
#[derive(Default)]
pub struct RustlsTransportBuilder {
    server_pem: Option<(PathBuf, PathBuf)>,
    ca_file: Option<PathBuf>,
    insecure: bool,
    pinned_fingerprint: Option<Vec<u8>>,
    feedback: Option<Arc<FeedbackFn>>,
}

impl RustlsTransportBuilder {
    /// Serve with the given PEM certificate chain and PKCS8 private key.
    pub fn with_server_pem<P: AsRef<Path>>(mut self, cert_path: P, key_path: P) -> Self {
        self.server_pem = Some((
            cert_path.as_ref().to_path_buf(),
            key_path.as_ref().to_path_buf(),
        ));
        self
    }

    /// Trust servers signed by the CAs in the given PEM file.
    pub fn with_ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Accept only the server certificate with this exact SHA-256
    /// fingerprint.
    pub fn with_pinned_fingerprint(mut self, fingerprint: Vec<u8>) -> Self {
        if fingerprint.len() != 32 {
            warn!(
                length = fingerprint.len(),
                "certificate fingerprint has unexpected length (expected 32 bytes for SHA-256)"
            );
        }
        self.pinned_fingerprint = Some(fingerprint);
        self
    }

    /// Skip certificate verification entirely.
    ///
    /// # WARNING: Security Risk
    /// Only for development and testing, or together with
    /// [`with_certificate_feedback`](Self::with_certificate_feedback) for
    /// trust-on-first-use schemes.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: certificate verification is disabled");
        self.insecure = true;
        self
    }

    /// Defer trust to an interactive feedback hook: the TLS handshake accepts
    /// any certificate, then the session is verified on the blocking executor
    /// by asking `feedback` (e.g. a trust-on-first-use prompt).
    pub fn with_certificate_feedback<F>(mut self, feedback: F) -> Self
    where
        F: Fn(&[Certificate]) -> bool + Send + Sync + 'static,
    {
        self.feedback = Some(Arc::new(feedback));
        self
    }

    pub fn build(self) -> Result<RustlsTransport> {
        let server = match &self.server_pem {
            Some((cert_path, key_path)) => Some(Arc::new(load_server_config(cert_path, key_path)?)),
            None => None,
        };

        let client = self.build_client_config()?.map(Arc::new);

        Ok(RustlsTransport {
            client,
            server,
            feedback: self.feedback,
        })
    }

    fn build_client_config(&self) -> Result<Option<ClientConfig>> {
        let builder = ClientConfig::builder().with_safe_defaults();

        if let Some(ca_file) = &self.ca_file {
            let file = File::open(ca_file)
                .map_err(|e| ProtocolError::Tls(format!("failed to open CA file: {e}")))?;
            let mut reader = BufReader::new(file);
            let ca_certs = certs(&mut reader)
                .map_err(|_| ProtocolError::Tls("failed to parse CA certificate".into()))?;

            let mut root_store = RootCertStore::empty();
            for cert in ca_certs {
                root_store
                    .add(&Certificate(cert))
                    .map_err(|e| ProtocolError::Tls(format!("failed to add CA cert: {e}")))?;
            }

            return Ok(Some(
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            ));
        }

        if let Some(fingerprint) = &self.pinned_fingerprint {
            let verifier = Arc::new(FingerprintVerifier {
                fingerprint: fingerprint.clone(),
            });
            return Ok(Some(
                builder
                    .with_custom_certificate_verifier(verifier)
                    .with_no_client_auth(),
            ));
        }

        if self.insecure || self.feedback.is_some() {
            return Ok(Some(
                builder
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                    .with_no_client_auth(),
            ));
        }

        Ok(None)
    }
}

fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_file = File::open(cert_path)
        .map_err(|e| ProtocolError::Tls(format!("failed to open cert file: {e}")))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain = certs(&mut cert_reader)
        .map_err(|_| ProtocolError::Tls("failed to parse certificate".into()))?;
    let cert_chain: Vec<Certificate> = cert_chain.into_iter().map(Certificate).collect();

    let key_file = File::open(key_path)
        .map_err(|e| ProtocolError::Tls(format!("failed to open key file: {e}")))?;
    let mut key_reader = BufReader::new(key_file);
    let keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|_| ProtocolError::Tls("failed to parse private key".into()))?;

    if keys.is_empty() {
        return Err(ProtocolError::Tls("no private keys found".into()));
    }
    let private_key = PrivateKey(keys[0].clone());

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| ProtocolError::Tls(format!("TLS error: {e}")))
}

/// Verifier that accepts exactly one certificate, identified by SHA-256
/// fingerprint.
struct FingerprintVerifier {
    fingerprint: Vec<u8>,
}

impl rustls::client::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        if certificate_fingerprint(end_entity) == self.fingerprint {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "pinned certificate fingerprint mismatch".into(),
            ))
        }
    }
}

/// Verifier that accepts any server certificate (insecure/feedback modes).
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_address_authority() {
        let remote = RemoteAddress::new("example.net", 7000);
        assert_eq!(remote.authority(), "example.net:7000");
        assert_eq!(remote.to_string(), "example.net:7000");
    }

    #[test]
    fn remote_address_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let remote = RemoteAddress::from(addr);
        assert_eq!(remote.host, "127.0.0.1");
        assert_eq!(remote.port, 9000);
    }

    #[test]
    fn self_signed_material_loads() {
        let dir = std::env::temp_dir().join(format!("bundle-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("test-cert.pem");
        let key = dir.join("test-key.pem");

        let fingerprint =
            RustlsTransport::generate_self_signed(&cert, &key, "localhost").unwrap();
        assert_eq!(fingerprint.len(), 32);

        let transport = RustlsTransport::builder()
            .with_server_pem(&cert, &key)
            .with_pinned_fingerprint(fingerprint)
            .build()
            .unwrap();

        assert!(transport.server_engine().is_ok());
        let remote = RemoteAddress::new("localhost", 1);
        assert!(transport.client_engine(&remote).is_ok());
        assert!(!transport.requires_verification());
    }

    #[test]
    fn client_engine_without_trust_config_fails() {
        let transport = RustlsTransport::builder().build().unwrap();
        let remote = RemoteAddress::new("localhost", 1);
        assert!(transport.client_engine(&remote).is_err());
    }

    #[test]
    fn feedback_mode_requires_verification() {
        let transport = RustlsTransport::builder()
            .with_certificate_feedback(|_| true)
            .build()
            .unwrap();
        assert!(transport.requires_verification());
        let remote = RemoteAddress::new("localhost", 1);
        assert!(transport.verify_session(&remote, &[]).is_ok());

        let rejecting = RustlsTransport::builder()
            .with_certificate_feedback(|_| false)
            .build()
            .unwrap();
        assert!(rejecting.verify_session(&remote, &[]).is_err());
    }
}
