//! Binary protocol between sessions and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint+n │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Document payloads are raw yrs v1 updates / state vectors; awareness
//! payloads are bincode-encoded [`AwarenessMessage`]s.
//!
//! [`AwarenessMessage`]: crate::presence::AwarenessMessage

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::CursorColor;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asking the other side for what it is missing
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Ephemeral presence frame
    Awareness = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

impl MessageType {
    /// Whether the payload carries document state.
    pub fn is_document(self) -> bool {
        matches!(self, Self::SyncStep2 | Self::Update)
    }
}

/// Peer identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    pub color: CursorColor,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id; the color is derived from it.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: CursorColor::from_uuid(peer_id),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: String,
    /// Sender's Lamport clock; 0 for handshake and control frames
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(
        msg_type: MessageType,
        peer_id: Uuid,
        room_id: impl Into<String>,
        clock: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.into(),
            clock,
            payload,
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, room_id: impl Into<String>, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, room_id, clock, yrs_update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room_id: impl Into<String>, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room_id, 0, state_diff)
    }

    /// Create an awareness frame around an already encoded presence message.
    pub fn awareness(peer_id: Uuid, room_id: impl Into<String>, clock: u64, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, peer_id, room_id, clock, payload)
    }

    /// Create a peer joined notification.
    pub fn peer_joined(room_id: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room_id, 0, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, room_id: impl Into<String>) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the peer info carried by a PeerJoined message.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}
