//! Firewall collaborator interface

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::info;

/// Backend that owns the actual admission rules.
///
/// Calls are fire-and-forget: the dispatcher neither inspects a result nor
/// retries, and may repeat a call for a rule that already exists.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Admit `ip` on `port`
    async fn insert(&self, port: u16, ip: IpAddr);

    /// Revoke admission of `ip` on `port`
    async fn delete(&self, port: u16, ip: IpAddr);
}

/// Records every call in the log without touching any rules
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFirewall;

#[async_trait]
impl Firewall for LoggingFirewall {
    async fn insert(&self, port: u16, ip: IpAddr) {
        info!(port, %ip, "Insert admission rule (dry run)");
    }

    async fn delete(&self, port: u16, ip: IpAddr) {
        info!(port, %ip, "Delete admission rule (dry run)");
    }
}
