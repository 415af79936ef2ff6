//! TLS listener feeding the auth gate
//!
//! One task per accepted connection: TLS handshake, credential gate, relay.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::gate::{AuthGate, GateError, UpstreamDialer};

#[derive(Debug, Error)]
pub enum ProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub bind_addr: SocketAddr,
}

pub struct ProxyServer<D> {
    config: ProxyServerConfig,
    acceptor: TlsAcceptor,
    gate: Arc<AuthGate<D>>,
}

impl<D: UpstreamDialer + 'static> ProxyServer<D> {
    pub fn new(config: ProxyServerConfig, acceptor: TlsAcceptor, gate: AuthGate<D>) -> Self {
        Self {
            config,
            acceptor,
            gate: Arc::new(gate),
        }
    }

    async fn bind_with_retry(&self) -> Result<TcpListener, ProxyServerError> {
        // Retry bind to ride out TIME_WAIT after a restart (up to 3 attempts, 1 second apart)
        for attempt in 1..=3 {
            match TcpListener::bind(&self.config.bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/3",
                            self.config.bind_addr, attempt
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                        self.config.bind_addr.port(), attempt
                    );
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
                Err(e) => return Err(self.bind_error(e.to_string())),
            }
        }

        Err(self.bind_error("Address in use after 3 retry attempts".to_string()))
    }

    fn bind_error(&self, reason: String) -> ProxyServerError {
        ProxyServerError::BindError {
            address: self.config.bind_addr.ip().to_string(),
            port: self.config.bind_addr.port(),
            reason,
        }
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), ProxyServerError> {
        let listener = self.bind_with_retry().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` is cancelled.
    ///
    /// Live connections are cancelled with the same token and awaited before
    /// this returns.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyServerError> {
        let addr = listener.local_addr()?;
        info!("Proxy listening on {}", addr);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let _ = socket.set_nodelay(true);
                        let acceptor = self.acceptor.clone();
                        let gate = self.gate.clone();
                        let token = shutdown.clone();
                        let span = tracing::info_span!(
                            "conn",
                            id = %uuid::Uuid::new_v4(),
                            peer = %peer_addr
                        );
                        connections.spawn(
                            Self::handle_connection(socket, acceptor, gate, token).instrument(span),
                        );
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        info!(
            "Proxy on {} shutting down, waiting for {} connection(s)",
            addr,
            connections.len()
        );
        while connections.join_next().await.is_some() {}

        Ok(())
    }

    async fn handle_connection(
        socket: TcpStream,
        acceptor: TlsAcceptor,
        gate: Arc<AuthGate<D>>,
        shutdown: CancellationToken,
    ) {
        debug!("New connection");

        let handshake = tokio::time::timeout(gate.config().auth_timeout, acceptor.accept(socket));
        let stream = match handshake.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("TLS handshake failed: {}", e);
                return;
            }
            Err(_) => {
                debug!("TLS handshake timed out");
                return;
            }
        };

        match gate.handle(stream, &shutdown).await {
            Ok(stats) => info!(
                ended_by = ?stats.ended_by,
                client_to_upstream = stats.client_to_upstream,
                upstream_to_client = stats.upstream_to_client,
                "Connection closed"
            ),
            Err(GateError::Dial(e)) => error!("Upstream unavailable: {}", e),
            Err(e) => info!("Connection dropped: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_server_config() {
        let config = ProxyServerConfig {
            bind_addr: "127.0.0.1:25500".parse().unwrap(),
        };
        assert_eq!(config.bind_addr.port(), 25500);
    }

    #[test]
    fn test_bind_error_message_names_port() {
        let err = ProxyServerError::BindError {
            address: "0.0.0.0".to_string(),
            port: 25500,
            reason: "Address in use".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("0.0.0.0"));
        assert!(message.contains("lsof -i :25500"));
    }
}
