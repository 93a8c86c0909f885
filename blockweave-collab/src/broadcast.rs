//! Fan-out of encoded frames to every peer of a room.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, and
//! each peer's receiver buffers up to `capacity` frames before it lags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// An encoded frame plus the peer it came from, so receivers can skip
/// their own frames without decoding.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub sender: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomFrame {
    pub fn is_from(&self, peer_id: Uuid) -> bool {
        self.sender == peer_id
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// The broadcast group of a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per peer before a slow
    /// peer starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<RoomFrame> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and fan out a message. Returns the number of receivers.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(msg.peer_id, bytes))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, sender: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(RoomFrame { sender, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.sender.subscribe()
    }
}
