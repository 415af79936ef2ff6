//! Credential gate in front of the upstream chat server
//!
//! The gate reads exactly one credential frame from a fresh connection. Any
//! failure before the credential is accepted drops the connection without
//! dialing upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgate_pool::{BufferPool, Pool};
use chatgate_proto::{CodecError, CredentialRecord, FrameCodec, WireMessage};
use chatgate_transport::{dial_tls, Endpoint, TransportError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pipe::{relay, RelayStats};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Timed out waiting for credential frame")]
    Timeout,

    #[error("Connection closed before credential frame")]
    Closed,

    #[error("Malformed credential frame: {0}")]
    Codec(#[from] CodecError),

    #[error("Credential rejected: {0}")]
    Rejected(#[from] VerifyError),

    #[error("Upstream dial failed: {0}")]
    Dial(#[from] TransportError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("empty id")]
    EmptyId,

    #[error("empty secret")]
    EmptySecret,

    #[error("{field} exceeds {limit} bytes")]
    TooLong { field: &'static str, limit: usize },
}

/// Decides whether a decoded credential may pass the gate.
///
/// This is the only place a credential is judged; a stronger check replaces
/// the implementation without touching the relay path.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, record: &CredentialRecord) -> Result<(), VerifyError>;
}

/// Accepts any structurally well-formed credential
#[derive(Debug, Clone)]
pub struct WellFormedVerifier {
    pub max_id_len: usize,
    pub max_secret_len: usize,
}

impl Default for WellFormedVerifier {
    fn default() -> Self {
        Self {
            max_id_len: 256,
            max_secret_len: 1024,
        }
    }
}

impl CredentialVerifier for WellFormedVerifier {
    fn verify(&self, record: &CredentialRecord) -> Result<(), VerifyError> {
        if record.id.is_empty() {
            return Err(VerifyError::EmptyId);
        }
        if record.secret.is_empty() {
            return Err(VerifyError::EmptySecret);
        }
        if record.id.len() > self.max_id_len {
            return Err(VerifyError::TooLong {
                field: "id",
                limit: self.max_id_len,
            });
        }
        if record.secret.len() > self.max_secret_len {
            return Err(VerifyError::TooLong {
                field: "secret",
                limit: self.max_secret_len,
            });
        }
        Ok(())
    }
}

/// Opens the connection to the upstream server for an admitted client
#[async_trait]
pub trait UpstreamDialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn dial(&self) -> Result<Self::Stream, TransportError>;
}

/// Dials a fixed upstream over TLS
pub struct TlsDialer {
    endpoint: Endpoint,
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new(endpoint: Endpoint, connector: TlsConnector) -> Self {
        Self {
            endpoint,
            connector,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl UpstreamDialer for TlsDialer {
    type Stream = TlsStream<TcpStream>;

    async fn dial(&self) -> Result<Self::Stream, TransportError> {
        dial_tls(&self.connector, &self.endpoint).await
    }
}

/// Gate settings
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Deadline for the credential frame (and the TLS handshake before it)
    pub auth_timeout: Duration,

    /// Largest credential payload accepted
    pub max_credential_frame: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(5),
            max_credential_frame: chatgate_proto::MAX_CREDENTIAL_FRAME,
        }
    }
}

pub struct AuthGate<D> {
    config: GateConfig,
    codec: FrameCodec,
    verifier: Arc<dyn CredentialVerifier>,
    dialer: D,
    buffers: Arc<BufferPool>,
    credentials: Arc<Pool<CredentialRecord>>,
}

impl<D: UpstreamDialer> AuthGate<D> {
    pub fn new(
        config: GateConfig,
        dialer: D,
        buffers: Arc<BufferPool>,
        credentials: Arc<Pool<CredentialRecord>>,
    ) -> Self {
        Self {
            codec: FrameCodec::new(config.max_credential_frame),
            config,
            verifier: Arc::new(WellFormedVerifier::default()),
            dialer,
            buffers,
            credentials,
        }
    }

    /// Replace the default well-formedness check
    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Admit one inbound connection and relay it to upstream.
    ///
    /// On any error the inbound connection is dropped (closed) and no relay
    /// is started. Nothing is written back to the client.
    pub async fn handle<S>(
        &self,
        mut inbound: S,
        shutdown: &CancellationToken,
    ) -> Result<RelayStats, GateError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.admit(&mut inbound).await?;

        let upstream = self.dialer.dial().await?;
        debug!("Upstream connection established");

        Ok(relay(inbound, upstream, &self.buffers, shutdown).await)
    }

    /// Read, decode and verify the credential frame
    async fn admit<S>(&self, inbound: &mut S) -> Result<(), GateError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = self.buffers.get();

        let n = match tokio::time::timeout(
            self.config.auth_timeout,
            self.codec.read_frame(inbound, &mut buf[..]),
        )
        .await
        {
            Err(_) => return Err(GateError::Timeout),
            Ok(Ok(None)) => return Err(GateError::Closed),
            Ok(Ok(Some(n))) => n,
            Ok(Err(e)) => return Err(e.into()),
        };

        let mut credential = self.credentials.get();
        credential.decode_into(&buf[..n])?;
        self.verifier.verify(&credential)?;

        info!(client_id = %credential.id, "Credential accepted");
        Ok(())
    }
}
