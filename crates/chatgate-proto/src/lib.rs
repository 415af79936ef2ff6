//! Chatgate wire protocol
//!
//! Defines the records exchanged at the gateway edge (client credentials and
//! firewall rule events) and the length-prefixed frame codec that carries them.

pub mod codec;
pub mod messages;

pub use codec::{decode_exact, CodecError, FrameCodec, HEADER_LEN};
pub use messages::{CredentialRecord, RuleEvent, RuleKind, RuleSpec, WireMessage};

/// Default maximum credential frame payload (4KB)
pub const MAX_CREDENTIAL_FRAME: usize = 4 * 1024;

/// Default maximum rule frame payload (1KB)
pub const MAX_RULE_FRAME: usize = 1024;
