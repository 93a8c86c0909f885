//! Presence: who is in the room, where their cursor is, what they drag.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move / drag start / drag end
//!       │
//!       ▼
//! PresenceChannel::update_cursor() / set_dragging()
//!       │  (coalesced to publish_interval, drag markers go out at once)
//!       ▼
//! PresenceChannel::poll_publish() ──► AwarenessMessage::State
//!       │
//!       ▼   (relay fan-out)
//! Remote PresenceChannel::handle_message()
//!       │
//!       ▼
//! PresenceEvent::PeerUpdated / PeerRemoved  (host draws or drops the cursor)
//! ```
//!
//! Each peer only ever writes its own slot, so there is nothing to merge:
//! the newest state per peer replaces the previous one, and a slot vanishes
//! on Leave, on the relay's PeerLeft, or when the peer goes idle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use blockweave_core::collab::{Clock, SystemClock};

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in workspace coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// RGBA color for a peer's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color from a peer id: hue from the id, fixed
    /// saturation and lightness.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, for hosts that style cursors with CSS-like colors.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// "I am dragging this node, it is currently here."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DragMarker {
    pub node_id: String,
    pub position: Vec2,
}

/// One peer's ephemeral slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<Vec2>,
    pub dragging: Option<DragMarker>,
}

impl PresenceState {
    pub fn new(name: impl Into<String>, color: CursorColor) -> Self {
        Self {
            name: name.into(),
            color,
            cursor: None,
            dragging: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Presence frames, carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full replacement of the sender's slot.
    State {
        user_id: Uuid,
        state: PresenceState,
        /// Sender-local counter; older frames are ignored.
        timestamp: u64,
    },
    /// The sender left and its slot is gone.
    Leave { user_id: Uuid },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::State { user_id, .. } | AwarenessMessage::Leave { user_id } => *user_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum gap between two coalesced publishes (30 fps).
    pub publish_interval: Duration,
    /// Peers silent for longer than this are dropped.
    pub idle_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            publish_interval: Duration::from_millis(5),
            idle_timeout: Duration::from_secs(2),
        }
    }
}

/// What changed among remote peers since the last drain.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    PeerUpdated { user_id: Uuid, state: PresenceState },
    PeerRemoved { user_id: Uuid },
}

#[derive(Debug, Clone)]
struct RemotePeer {
    state: PresenceState,
    timestamp: u64,
    last_seen: Instant,
}

/// The local slot plus the latest known slot of every other peer.
pub struct PresenceChannel {
    local_id: Uuid,
    local: PresenceState,
    config: PresenceConfig,
    clock: Arc<dyn Clock>,
    peers: HashMap<Uuid, RemotePeer>,
    events: Vec<PresenceEvent>,
    dirty: bool,
    urgent: bool,
    last_publish: Option<Instant>,
    timestamp: u64,
}

impl PresenceChannel {
    pub fn new(local_id: Uuid, local: PresenceState, config: PresenceConfig) -> Self {
        Self::with_clock(local_id, local, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        local_id: Uuid,
        local: PresenceState,
        config: PresenceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local_id,
            local,
            config,
            clock,
            peers: HashMap::new(),
            events: Vec::new(),
            dirty: true,
            urgent: true,
            last_publish: None,
            timestamp: 0,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local
    }

    /// Replace the whole local slot.
    pub fn set_local_state(&mut self, state: PresenceState) {
        if state == self.local {
            return;
        }
        if state.dragging.as_ref().map(|d| &d.node_id) != self.local.dragging.as_ref().map(|d| &d.node_id) {
            self.urgent = true;
        }
        self.local = state;
        self.dirty = true;
    }

    pub fn update_cursor(&mut self, position: Option<Vec2>) {
        if self.local.cursor == position {
            return;
        }
        self.local.cursor = position;
        self.dirty = true;
    }

    /// Set or clear the drag marker. Starting or ending a drag publishes on
    /// the next poll regardless of the interval; moving the marker within
    /// one drag is coalesced like a cursor move.
    pub fn set_dragging(&mut self, marker: Option<DragMarker>) {
        if self.local.dragging == marker {
            return;
        }
        let same_node = match (&self.local.dragging, &marker) {
            (Some(old), Some(new)) => old.node_id == new.node_id,
            _ => false,
        };
        self.local.dragging = marker;
        self.dirty = true;
        self.urgent |= !same_node;
    }

    /// The next State frame to send, if the local slot changed and the
    /// publish interval has elapsed. An unchanged slot is re-sent every half
    /// idle timeout so peers do not drop a user who is connected but still.
    pub fn poll_publish(&mut self) -> Option<AwarenessMessage> {
        let now = self.clock.now();
        if !self.dirty {
            let heartbeat_due = self
                .last_publish
                .is_some_and(|last| now.duration_since(last) >= self.config.idle_timeout / 2);
            return heartbeat_due.then(|| self.force_publish());
        }
        let due = self.urgent
            || self
                .last_publish
                .map_or(true, |last| now.duration_since(last) >= self.config.publish_interval);
        if !due {
            return None;
        }
        Some(self.force_publish())
    }

    /// Build a State frame now, regardless of coalescing.
    pub fn force_publish(&mut self) -> AwarenessMessage {
        self.timestamp += 1;
        self.dirty = false;
        self.urgent = false;
        self.last_publish = Some(self.clock.now());
        AwarenessMessage::State {
            user_id: self.local_id,
            state: self.local.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Clear the local cursor and drag marker and return the Leave frame.
    pub fn clear_local(&mut self) -> AwarenessMessage {
        self.local.cursor = None;
        self.local.dragging = None;
        self.dirty = false;
        self.urgent = false;
        self.last_publish = None;
        AwarenessMessage::Leave {
            user_id: self.local_id,
        }
    }

    /// Apply a frame from another peer. Returns whether anything changed.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.user_id() == self.local_id {
            return false;
        }
        match msg {
            AwarenessMessage::State {
                user_id,
                state,
                timestamp,
            } => {
                let now = self.clock.now();
                if let Some(peer) = self.peers.get_mut(user_id) {
                    if *timestamp <= peer.timestamp {
                        log::trace!("Stale presence from {user_id} ignored");
                        return false;
                    }
                    peer.last_seen = now;
                    peer.timestamp = *timestamp;
                    if peer.state == *state {
                        return false;
                    }
                    peer.state = state.clone();
                } else {
                    log::debug!("Presence: {} ({user_id}) appeared", state.name);
                    self.peers.insert(
                        *user_id,
                        RemotePeer {
                            state: state.clone(),
                            timestamp: *timestamp,
                            last_seen: now,
                        },
                    );
                }
                self.events.push(PresenceEvent::PeerUpdated {
                    user_id: *user_id,
                    state: state.clone(),
                });
                true
            }
            AwarenessMessage::Leave { user_id } => self.handle_peer_left(*user_id),
        }
    }

    /// Drop a peer the transport reported gone.
    pub fn handle_peer_left(&mut self, user_id: Uuid) -> bool {
        if self.peers.remove(&user_id).is_none() {
            return false;
        }
        log::debug!("Presence: {user_id} left");
        self.events.push(PresenceEvent::PeerRemoved { user_id });
        true
    }

    /// Drop every remote slot, e.g. after losing the connection.
    pub fn clear_remote_peers(&mut self) -> usize {
        let removed: Vec<Uuid> = self.peers.drain().map(|(id, _)| id).collect();
        for user_id in &removed {
            self.events.push(PresenceEvent::PeerRemoved { user_id: *user_id });
        }
        removed.len()
    }

    /// Drop peers silent for longer than the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<Uuid> {
        let now = self.clock.now();
        let timeout = self.config.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for user_id in &stale {
            self.peers.remove(user_id);
            self.events.push(PresenceEvent::PeerRemoved { user_id: *user_id });
        }
        stale
    }

    pub fn states(&self) -> impl Iterator<Item = (&Uuid, &PresenceState)> {
        self.peers.iter().map(|(id, p)| (id, &p.state))
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PresenceState> {
        self.peers.get(user_id).map(|p| &p.state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn drain_events(&mut self) -> Vec<PresenceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockweave_core::collab::ManualClock;

    fn channel(clock: &ManualClock) -> PresenceChannel {
        let id = Uuid::new_v4();
        PresenceChannel::with_clock(
            id,
            PresenceState::new("local", CursorColor::from_uuid(id)),
            PresenceConfig::default(),
            Arc::new(clock.clone()),
        )
    }

    fn remote_state(user_id: Uuid, name: &str, timestamp: u64) -> AwarenessMessage {
        AwarenessMessage::State {
            user_id,
            state: PresenceState::new(name, CursorColor::default()),
            timestamp,
        }
    }

    #[test]
    fn test_cursor_color_from_uuid_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
        assert_eq!(CursorColor::from_uuid(id).a, 1.0);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
        assert_eq!(CursorColor::rgba(r, g, b, 1.0).to_hex(), "#ff0000");
    }

    #[test]
    fn test_awareness_message_roundtrip() {
        let id = Uuid::new_v4();
        let mut state = PresenceState::new("Alice", CursorColor::default());
        state.cursor = Some(Vec2::new(10.0, 20.0));
        state.dragging = Some(DragMarker {
            node_id: "b1".into(),
            position: Vec2::new(50.0, 60.0),
        });
        let msg = AwarenessMessage::State {
            user_id: id,
            state,
            timestamp: 3,
        };

        let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.user_id(), id);
    }

    #[test]
    fn test_first_poll_publishes_join_state() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);

        let msg = presence.poll_publish().unwrap();
        assert!(matches!(msg, AwarenessMessage::State { timestamp: 1, .. }));
        assert!(presence.poll_publish().is_none());
    }

    #[test]
    fn test_cursor_moves_are_coalesced() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        presence.poll_publish();

        presence.update_cursor(Some(Vec2::new(1.0, 1.0)));
        assert!(presence.poll_publish().is_none());
        presence.update_cursor(Some(Vec2::new(2.0, 2.0)));
        clock.advance(Duration::from_millis(40));

        match presence.poll_publish() {
            Some(AwarenessMessage::State { state, timestamp, .. }) => {
                assert_eq!(state.cursor, Some(Vec2::new(2.0, 2.0)));
                assert_eq!(timestamp, 2);
            }
            other => panic!("expected state, got {other:?}"),
        }
    }

    #[test]
    fn test_drag_marker_publishes_immediately() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        presence.poll_publish();

        presence.set_dragging(Some(DragMarker {
            node_id: "b1".into(),
            position: Vec2::new(50.0, 60.0),
        }));
        assert!(presence.poll_publish().is_some());

        // Moving within the same drag waits for the interval.
        presence.set_dragging(Some(DragMarker {
            node_id: "b1".into(),
            position: Vec2::new(70.0, 60.0),
        }));
        assert!(presence.poll_publish().is_none());

        presence.set_dragging(None);
        let msg = presence.poll_publish().unwrap();
        assert!(matches!(msg, AwarenessMessage::State { ref state, .. } if state.dragging.is_none()));
    }

    #[test]
    fn test_remote_state_replaces_and_ignores_stale() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        let peer = Uuid::new_v4();

        assert!(presence.handle_message(&remote_state(peer, "Bob", 2)));
        assert!(!presence.handle_message(&remote_state(peer, "Old Bob", 1)));
        assert_eq!(presence.peer(&peer).unwrap().name, "Bob");

        assert!(presence.handle_message(&remote_state(peer, "Robert", 3)));
        assert_eq!(presence.peer(&peer).unwrap().name, "Robert");
        assert_eq!(presence.drain_events().len(), 2);
    }

    #[test]
    fn test_own_frames_ignored() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        let own = presence.force_publish();

        assert!(!presence.handle_message(&own));
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_leave_and_peer_left_remove_slot() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        presence.handle_message(&remote_state(bob, "Bob", 1));
        presence.handle_message(&remote_state(carol, "Carol", 1));
        presence.drain_events();

        assert!(presence.handle_message(&AwarenessMessage::Leave { user_id: bob }));
        assert!(presence.handle_peer_left(carol));
        assert!(!presence.handle_peer_left(carol));

        assert_eq!(presence.peer_count(), 0);
        assert_eq!(
            presence.drain_events(),
            vec![
                PresenceEvent::PeerRemoved { user_id: bob },
                PresenceEvent::PeerRemoved { user_id: carol },
            ]
        );
    }

    #[test]
    fn test_idle_peers_are_dropped() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        let bob = Uuid::new_v4();
        presence.handle_message(&remote_state(bob, "Bob", 1));

        clock.advance(Duration::from_secs(10));
        assert!(presence.cleanup_idle_peers().is_empty());

        clock.advance(Duration::from_secs(25));
        assert_eq!(presence.cleanup_idle_peers(), vec![bob]);
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_still_peer_survives_idle_timeout() {
        let clock = ManualClock::new();
        let mut alice = channel(&clock);
        let mut bob = channel(&clock);
        let alice_id = alice.local_id();

        bob.handle_message(&alice.poll_publish().unwrap());

        // Alice never moves; both sides keep pumping once a second.
        for _ in 0..31 {
            clock.advance(Duration::from_secs(1));
            if let Some(frame) = alice.poll_publish() {
                assert!(matches!(frame, AwarenessMessage::State { .. }));
                bob.handle_message(&frame);
            }
            assert!(bob.cleanup_idle_peers().is_empty());
        }
        assert!(bob.peer(&alice_id).is_some());
    }

    #[test]
    fn test_heartbeat_waits_half_idle_timeout() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        presence.poll_publish().unwrap();

        clock.advance(Duration::from_secs(14));
        assert!(presence.poll_publish().is_none());
        clock.advance(Duration::from_secs(1));
        assert!(matches!(
            presence.poll_publish(),
            Some(AwarenessMessage::State { timestamp: 2, .. })
        ));
        assert!(presence.poll_publish().is_none());
    }

    #[test]
    fn test_clear_local_returns_leave() {
        let clock = ManualClock::new();
        let mut presence = channel(&clock);
        presence.update_cursor(Some(Vec2::new(5.0, 5.0)));

        let msg = presence.clear_local();
        assert_eq!(msg, AwarenessMessage::Leave { user_id: presence.local_id() });
        assert!(presence.local_state().cursor.is_none());
        assert!(presence.poll_publish().is_none());

        // No heartbeat after leaving.
        clock.advance(Duration::from_secs(60));
        assert!(presence.poll_publish().is_none());
    }
}
