//! Firewall rule synchronization
//!
//! Long-lived TLS control connections from a trusted rule-source deliver
//! insert/delete events; the dispatcher applies them to a [`Firewall`].
//!
//! The canonical topology is one control stream carrying tagged
//! [`RuleEvent`](chatgate_proto::RuleEvent) frames. Deployments that still
//! split insertions and deletions across two sockets use
//! [`RuleDispatcher::split`]; the two streams then live and die together.

pub mod control;
pub mod dispatcher;
pub mod firewall;

pub use control::{ControlResources, ControlSource, ControlStream, EndSignal, RuleWire};
pub use dispatcher::{DispatchEnd, DispatchError, DispatchOutcome, DispatcherConfig, RuleDispatcher};
pub use firewall::{Firewall, LoggingFirewall};
