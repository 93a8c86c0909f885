//! # blockweave-collab: Networked collaboration for blockweave workspaces
//!
//! Carries the replicated document between peers and adds everything a
//! live session needs around the core sync engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ Session      │ ◄────────────────► │ SyncServer   │
//! │ (per editor) │    Binary Proto    │ (relay)      │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ SyncEngine   │                    │ Yrs Doc      │
//! │ + YrsDocument│                    │ (per room)   │
//! │ + Presence   │                    └──────┬───────┘
//! └──────────────┘                           │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Per-room fan-out with backpressure
//! - [`server`]: WebSocket relay with an authoritative document per room
//! - [`client`]: WebSocket client with offline queue and reconnect backoff
//! - [`presence`]: Ephemeral cursors and drag markers
//! - [`replica`]: LZ4-compressed on-disk copy of the local replica
//! - [`session`]: Join / pump / leave for one editor surface

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame};
pub use client::{ConnectionState, OfflineQueue, ReconnectPolicy, SyncClient, SyncEvent};
pub use presence::{
    AwarenessMessage, CursorColor, DragMarker, PresenceChannel, PresenceConfig, PresenceEvent,
    PresenceState, Vec2,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use replica::{ReplicaCache, ReplicaError, ReplicaStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionConfig, SessionError, SessionReport};
