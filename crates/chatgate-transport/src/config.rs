//! TLS configuration for the listening and dialing sides

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{TransportError, TransportResult};

/// Server certificate material
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsServerConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Load the PEM files and build a rustls acceptor
    pub fn build_acceptor(&self) -> TransportResult<TlsAcceptor> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;
        acceptor_from_der(certs, key)
    }
}

/// Build an acceptor from already-loaded DER material
pub fn acceptor_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> TransportResult<TlsAcceptor> {
    ensure_crypto_provider();

    let server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_crypto)))
}

/// Client-side TLS settings for upstream and control-plane dials
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    /// Verify the peer certificate against `root_certs`
    pub verify_server_cert: bool,

    /// Trust anchors used when verification is on
    pub root_certs: Vec<CertificateDer<'static>>,
}

impl TlsClientConfig {
    /// Skip peer certificate verification (INSECURE).
    ///
    /// Only for dial targets reachable solely through an isolated network path.
    pub fn insecure() -> Self {
        Self {
            verify_server_cert: false,
            root_certs: Vec::new(),
        }
    }

    /// Verify the peer against the given roots
    pub fn with_roots(root_certs: Vec<CertificateDer<'static>>) -> Self {
        Self {
            verify_server_cert: true,
            root_certs,
        }
    }

    pub fn build_connector(&self) -> TransportResult<TlsConnector> {
        ensure_crypto_provider();

        let client_crypto = if self.verify_server_cert {
            if self.root_certs.is_empty() {
                return Err(TransportError::Configuration(
                    "Certificate verification requires at least one root certificate".to_string(),
                ));
            }
            let mut roots = rustls::RootCertStore::empty();
            for cert in &self.root_certs {
                roots.add(cert.clone()).map_err(|e| {
                    TransportError::Configuration(format!("Invalid root cert: {}", e))
                })?;
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(TlsConnector::from(Arc::new(client_crypto)))
    }
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self::insecure()
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::Tls("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
