//! Protocol record types

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::codec::{decode_exact, CodecError};

/// Records that can be decoded into a reused (pooled) instance.
///
/// `decode_into` must overwrite every field a caller can read, so no state
/// from the instance's previous use survives a successful decode. On error
/// the instance contents are unspecified and must not be read.
pub trait WireMessage {
    fn decode_into(&mut self, payload: &[u8]) -> Result<(), CodecError>;
}

/// Credential presented in the first frame of a client connection.
///
/// Only checked for well-formedness at the gate; identity proof belongs to
/// the chat server behind it.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub secret: String,
}

/// Borrowed view used to decode without allocating fresh strings
#[derive(Deserialize)]
struct CredentialRef<'a> {
    id: &'a str,
    secret: &'a str,
}

impl WireMessage for CredentialRecord {
    fn decode_into(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        let decoded: CredentialRef<'_> = decode_exact(payload)?;

        // Reuse the existing string capacity of the pooled instance
        self.id.clear();
        self.id.push_str(decoded.id);
        self.secret.clear();
        self.secret.push_str(decoded.secret);

        Ok(())
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Whether a rule event adds or removes an admission rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Insert,
    Delete,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Insert => write!(f, "insert"),
            RuleKind::Delete => write!(f, "delete"),
        }
    }
}

/// Firewall admission rule change, as carried on the canonical control stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEvent {
    pub port: u16,
    pub ip: IpAddr,
    pub kind: RuleKind,
}

/// Rule body without a discriminator, as carried on split insert/delete streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub port: u16,
    pub ip: IpAddr,
}

impl RuleEvent {
    pub fn insert(port: u16, ip: IpAddr) -> Self {
        Self {
            port,
            ip,
            kind: RuleKind::Insert,
        }
    }

    pub fn delete(port: u16, ip: IpAddr) -> Self {
        Self {
            port,
            ip,
            kind: RuleKind::Delete,
        }
    }

    /// Decode a split-stream frame; the kind comes from the stream it arrived on
    pub fn decode_spec_into(&mut self, payload: &[u8], kind: RuleKind) -> Result<(), CodecError> {
        let spec: RuleSpec = decode_exact(payload)?;
        *self = Self {
            port: spec.port,
            ip: spec.ip,
            kind,
        };
        self.validate()
    }

    /// Reject rules that could never describe a real peer
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.port == 0 {
            return Err(CodecError::Invalid("port 0".to_string()));
        }
        if self.ip.is_unspecified() {
            return Err(CodecError::Invalid(format!(
                "unspecified address {}",
                self.ip
            )));
        }
        Ok(())
    }

    pub fn spec(&self) -> RuleSpec {
        RuleSpec {
            port: self.port,
            ip: self.ip,
        }
    }
}

impl Default for RuleEvent {
    fn default() -> Self {
        Self::insert(0, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl WireMessage for RuleEvent {
    fn decode_into(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        *self = decode_exact(payload)?;
        self.validate()
    }
}
