//! Message protocol and framing
//!
//! Wire format for trainer ↔ participant control messages, and for the
//! inference traffic between gateways and predictors. Each frame is a 4-byte
//! big-endian length followed by a postcard-encoded [`Envelope`].

use serde::{Deserialize, Serialize};

use policy_sync_core::item::RequestKey;
use policy_sync_core::version::ModelVersion;

use crate::{ChannelError, Result};

/// Largest accepted frame body
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Size of the length prefix
pub const FRAME_HEADER_BYTES: usize = 4;

/// Message carried on a heartbeat channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Liveness check from the trainer
    HeartbeatRequest,
    /// Liveness answer; gateways set `round_pending` to ask for a round
    HeartbeatResponse { round_pending: bool },
    /// Roll out `version`: predictors fetch and stage it, gateways pause workers
    VersionChangeRequest { version: ModelVersion },
    /// Outcome of a version-change request
    VersionChangeResponse { version: ModelVersion, success: bool },
    /// Round finished: commit `version`, or discard staged state and resume
    RoundEnd { version: ModelVersion, committed: bool },
    /// One observation from a gateway worker; `payload` is compressed
    InferenceRequest {
        key: RequestKey,
        model_version: ModelVersion,
        payload: Vec<u8>,
    },
    /// Compressed result set for one gateway connection
    InferenceResults {
        connection_id: u64,
        model_version: ModelVersion,
        result_count: u32,
        payload: Vec<u8>,
    },
}

impl SyncMessage {
    /// Wire discriminator
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::HeartbeatRequest => MessageType::HeartbeatRequest,
            SyncMessage::HeartbeatResponse { .. } => MessageType::HeartbeatResponse,
            SyncMessage::VersionChangeRequest { .. } => MessageType::VersionChangeRequest,
            SyncMessage::VersionChangeResponse { .. } => MessageType::VersionChangeResponse,
            SyncMessage::RoundEnd { .. } => MessageType::RoundEnd,
            SyncMessage::InferenceRequest { .. } => MessageType::InferenceRequest,
            SyncMessage::InferenceResults { .. } => MessageType::InferenceResults,
        }
    }

    /// Whether the sender expects an answer on the same channel.
    ///
    /// Inference results are streamed back as they are ready, not as replies.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            SyncMessage::HeartbeatRequest | SyncMessage::VersionChangeRequest { .. }
        )
    }
}

/// Message type discriminator, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    HeartbeatRequest = 0x01,
    HeartbeatResponse = 0x02,
    VersionChangeRequest = 0x03,
    VersionChangeResponse = 0x04,
    RoundEnd = 0x05,
    InferenceRequest = 0x10,
    InferenceResults = 0x11,
}

impl MessageType {
    /// Stable name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::HeartbeatRequest => "heartbeat-request",
            MessageType::HeartbeatResponse => "heartbeat-response",
            MessageType::VersionChangeRequest => "version-change-request",
            MessageType::VersionChangeResponse => "version-change-response",
            MessageType::RoundEnd => "round-end",
            MessageType::InferenceRequest => "inference-request",
            MessageType::InferenceResults => "inference-results",
        }
    }
}

/// Envelope for every control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Round the message belongs to (0 outside rounds)
    pub round: u64,
    /// Sender-assigned sequence number; replies echo the request's
    pub sequence: u64,
    /// The message
    pub message: SyncMessage,
}

impl Envelope {
    /// Current protocol version
    pub const CURRENT_VERSION: (u8, u8) = (1, 0);

    /// Wrap a message outside any round
    pub fn new(message: SyncMessage) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            round: 0,
            sequence: 0,
            message,
        }
    }

    /// Set the round
    pub fn with_round(mut self, round: u64) -> Self {
        self.round = round;
        self
    }

    /// Set the sequence number
    pub fn with_sequence(mut self, seq: u64) -> Self {
        self.sequence = seq;
        self
    }

    /// Build a reply that echoes this envelope's round and sequence
    pub fn reply(&self, message: SyncMessage) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            round: self.round,
            sequence: self.sequence,
            message,
        }
    }

    /// Whether `other` answers this envelope
    pub fn is_answered_by(&self, other: &Envelope) -> bool {
        self.round == other.round && self.sequence == other.sequence
    }

    /// Serialize the envelope to bytes
    pub fn serialize(&self) -> core::result::Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserialize from bytes, rejecting other major protocol versions
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = postcard::from_bytes(bytes)?;
        if envelope.version.0 != Self::CURRENT_VERSION.0 {
            return Err(ChannelError::VersionMismatch {
                got: envelope.version,
                expected: Self::CURRENT_VERSION,
            });
        }
        Ok(envelope)
    }
}

/// Encode an envelope as one length-prefixed frame
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; FRAME_HEADER_BYTES];
    let body = envelope.serialize()?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ChannelError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    buf[..FRAME_HEADER_BYTES].copy_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Body length announced by a frame header
pub fn frame_len(header: [u8; FRAME_HEADER_BYTES]) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ChannelError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(len)
}
