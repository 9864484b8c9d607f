//! # Policy Sync Network
//!
//! Heartbeat/RPC channel abstractions for the trainer, predictors and gateways.
//!
//! This crate provides:
//! - The wire protocol (`SyncMessage` inside an `Envelope`) and its framing
//! - `HeartbeatChannel`, `Connector` and `ChannelListener` traits
//! - An in-memory network with fault injection for tests and single-process runs
//! - A TCP transport using length-prefixed postcard frames
//!
//! Channels never retry on their own. Every send/recv failure is returned to
//! the caller, which decides whether the endpoint is unhealthy.

#![forbid(unsafe_code)]

pub mod memory;
pub mod protocol;
pub mod traits;

#[cfg(feature = "tcp-transport")]
pub mod tcp;

pub use memory::{MemoryListener, MemoryNetwork};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::protocol::*;
    pub use crate::traits::*;
}

/// Result type for network operations
pub type Result<T> = core::result::Result<T, ChannelError>;

/// Channel error types. Any of them means "endpoint unreachable" to callers.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Could not reach or keep talking to the endpoint
    #[error("endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    /// The peer closed the channel
    #[error("channel to {0} closed")]
    Closed(String),
    /// No listener is registered under the endpoint name
    #[error("no listener at {0}")]
    NoListener(String),
    /// Bytes on the wire did not decode
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    /// A frame exceeded the size limit
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    /// Peer speaks an incompatible protocol version
    #[error("protocol version {got:?} not supported (expected {expected:?})")]
    VersionMismatch { got: (u8, u8), expected: (u8, u8) },
    /// Underlying socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub(crate) fn unreachable(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        ChannelError::Unreachable {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}
