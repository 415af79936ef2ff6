//! TLS plumbing shared by the gateway daemons
//!
//! Server side: a rustls acceptor built from PEM files (or DER material in
//! tests). Client side: a connector that can skip peer verification for dial
//! targets whose trust boundary is enforced by network placement.

pub mod config;
pub mod dial;

pub use config::{acceptor_from_der, ensure_crypto_provider, TlsClientConfig, TlsServerConfig};
pub use dial::{dial_tls, Endpoint};

use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
