//! Outbound TLS dials

use std::fmt;
use std::str::FromStr;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{TransportError, TransportResult};

/// A fixed `host:port` dial target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Name presented as SNI (an IP address is fine when verification is off)
    pub fn server_name(&self) -> TransportResult<ServerName<'static>> {
        ServerName::try_from(self.host.clone())
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", self.host, e)))
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    /// Accepts `host:port`, `[v6]:port` and `:port` (loopback)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(format!("missing port in {:?}", s)))?;

        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("invalid port in {:?}", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "127.0.0.1" } else { host };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a TCP connection to `endpoint` and run the TLS client handshake
pub async fn dial_tls(
    connector: &TlsConnector,
    endpoint: &Endpoint,
) -> TransportResult<TlsStream<TcpStream>> {
    let server_name = endpoint.server_name()?;

    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    let _ = tcp.set_nodelay(true);

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(format!("Handshake with {} failed: {}", endpoint, e)))?;

    debug!("TLS connection established to {}", endpoint);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let endpoint: Endpoint = "chat.internal:25501".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("chat.internal", 25501));
    }

    #[test]
    fn test_parse_port_only_means_loopback() {
        let endpoint: Endpoint = ":25501".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", 25501));
    }

    #[test]
    fn test_parse_ipv6() {
        let endpoint: Endpoint = "[::1]:443".parse().unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.to_string(), "[::1]:443");
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!("localhost:http".parse::<Endpoint>().is_err());
        assert!("localhost:70000".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_server_name_accepts_ip() {
        let endpoint = Endpoint::new("127.0.0.1", 25501);
        assert!(endpoint.server_name().is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = crate::TlsClientConfig::insecure().build_connector().unwrap();
        let result = dial_tls(&connector, &Endpoint::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
