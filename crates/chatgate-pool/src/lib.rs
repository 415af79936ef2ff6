//! Reuse pools for fixed-shape resources
//!
//! Connection handlers churn through read buffers and decode targets at a high
//! rate. These pools keep returned values around so the next connection can
//! pick them up instead of allocating again.
//!
//! Pools are plain values: construct one per pooled type, wrap it in an `Arc`
//! and hand it to every component that needs it.

mod buffer;
mod pool;

pub use buffer::{BufferPool, PooledBuffer, INVALID_LENGTH_MESSAGE};
pub use pool::{Pool, Pooled};

/// Default number of idle entries a pool keeps before dropping returned values
pub const DEFAULT_MAX_IDLE: usize = 1024;
