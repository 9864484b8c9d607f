//! Channel traits and types
//!
//! One [`HeartbeatChannel`] per remote endpoint, kept open and reused across
//! rounds. Channels surface every failure to the caller and never retry.

use core::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::Envelope;
use crate::Result;

/// Address of a remote participant (`host:port` for TCP, a name in memory)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How long a receive may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// Return immediately if nothing is buffered
    NonBlocking,
    /// Wait up to the given duration
    Timeout(Duration),
}

/// Duplex, message-oriented connection to one endpoint
#[async_trait]
pub trait HeartbeatChannel: Send {
    /// Remote endpoint of this channel
    fn endpoint(&self) -> &Endpoint;

    /// Send one envelope
    async fn send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Receive one envelope. `Ok(None)` means nothing arrived within `mode`.
    async fn recv(&mut self, mode: RecvMode) -> Result<Option<Envelope>>;
}

/// Opens channels to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint`
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn HeartbeatChannel>>;
}

/// Accepts inbound channels on a participant
#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// Endpoint other processes connect to
    fn local_endpoint(&self) -> Endpoint;

    /// Wait for the next inbound channel
    async fn accept(&self) -> Result<Box<dyn HeartbeatChannel>>;
}
