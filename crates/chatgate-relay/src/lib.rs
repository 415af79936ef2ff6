//! Authenticating TLS relay
//!
//! Every accepted client connection must open with one credential frame. The
//! gate checks it, dials the internal chat server and then relays raw bytes in
//! both directions until either side goes away.

pub mod gate;
pub mod pipe;
mod server;

pub use gate::{
    AuthGate, CredentialVerifier, GateConfig, GateError, TlsDialer, UpstreamDialer, VerifyError,
    WellFormedVerifier,
};
pub use pipe::{relay, RelayEnd, RelayStats};
pub use server::{ProxyServer, ProxyServerConfig, ProxyServerError};

/// Default relay buffer size (32KB)
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;
