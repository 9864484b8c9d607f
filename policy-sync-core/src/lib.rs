//! # Policy Sync Core
//!
//! Core primitives shared by every role of an on-policy training job
//! (trainer, predictor, gateway).
//!
//! This crate provides:
//! - Monotonic model versions and the round data model
//! - Quorum ratio arithmetic
//! - A fixed-capacity FIFO queue with explicit "full" errors
//! - Configuration structs passed at construction
//! - Key-value metric observations
//! - Inference payload compression (lz4 block)
//! - A configuration-keyed plugin registry

#![forbid(unsafe_code)]

pub mod compression;
pub mod config;
pub mod item;
pub mod metrics;
pub mod plugin;
pub mod queue;
pub mod quorum;
pub mod round;
pub mod traits;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::item::*;
    pub use crate::queue::BoundedQueue;
    pub use crate::quorum::*;
    pub use crate::round::*;
    pub use crate::traits::*;
    pub use crate::version::*;
}

/// Result type for core operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A non-blocking put hit a full queue
    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    /// The queue was closed while waiting
    #[error("queue closed")]
    QueueClosed,
    /// A timed queue operation did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Configuration failed validation
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Configuration could not be parsed
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    /// Payload compression or decompression failed
    #[error("compression error: {0}")]
    Compression(String),
    /// No factory is registered under the requested key
    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),
    /// A plugin factory rejected its configuration
    #[error("plugin `{key}` failed to build: {reason}")]
    PluginBuild { key: String, reason: String },
}
