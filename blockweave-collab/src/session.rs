//! Session lifecycle: one editor surface joined to one room.
//!
//! A [`Session`] ties together the sync engine (surface ↔ local replica),
//! the transport (local replica ↔ relay), the presence channel, and the
//! on-disk replica cache. The host drives it from its own event loop:
//!
//! ```text
//! host edits surface ─┐
//!                     ▼
//! Session::pump() ── transport events ──► replica / presence
//!                 ── SyncEngine::pump() ──► surface ↔ replica
//!                 ── local updates ──► relay
//!                 ── drag marker / cursor ──► presence ──► relay
//!                 ── reconnect when due
//! ```
//!
//! Losing the relay never blocks editing: updates queue in the client and
//! the handshake on reconnect exchanges whatever either side missed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use blockweave_core::collab::{
    Clock, DocError, PumpReport, SessionTag, StartMode, SyncConfig, SyncEngine, SyncError,
    SystemClock, YrsDocument,
};
use blockweave_core::{EditorSurface, WorkspaceSnapshot};

use crate::client::{ConnectionState, ReconnectPolicy, SyncClient, SyncEvent};
use crate::presence::{CursorColor, DragMarker, PresenceChannel, PresenceConfig, PresenceState, Vec2};
use crate::protocol::{PeerInfo, ProtocolError};
use crate::replica::{ReplicaCache, ReplicaError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Document(#[from] DocError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub room_id: String,
    pub user_name: String,
    /// Cursor color; derived from the peer id when unset
    pub color: Option<CursorColor>,
    pub connect_timeout: Duration,
    /// How long `join` waits for the relay's state before starting anyway
    pub initial_sync_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub replica_path: Option<PathBuf>,
    /// Imported only when the room turns out to be empty
    pub bootstrap_snapshot: Option<WorkspaceSnapshot>,
    pub sync: SyncConfig,
    pub presence: PresenceConfig,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            user_name: user_name.into(),
            color: None,
            connect_timeout: Duration::from_secs(5),
            initial_sync_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            replica_path: None,
            bootstrap_snapshot: None,
            sync: SyncConfig::default(),
            presence: PresenceConfig::default(),
        }
    }

    pub fn for_testing(server_url: impl Into<String>, room_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            initial_sync_timeout: Duration::from_millis(500),
            reconnect: ReconnectPolicy::for_testing(),
            sync: SyncConfig::for_testing(),
            presence: PresenceConfig::for_testing(),
            ..Self::new(server_url, room_id, user_name)
        }
    }
}

/// What one [`Session::pump`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReport {
    pub sync: PumpReport,
    pub remote_updates: usize,
    pub sent_updates: usize,
    pub presence_published: bool,
    pub reconnected: bool,
}

pub struct Session<S: EditorSurface> {
    peer_id: Uuid,
    engine: SyncEngine<S, YrsDocument>,
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
    presence: PresenceChannel,
    replica: Option<ReplicaCache>,
    reconnect: ReconnectPolicy,
    reconnect_attempt: u32,
    next_reconnect: Option<Instant>,
    clock: Arc<dyn Clock>,
    start_mode: StartMode,
}

impl<S: EditorSurface> Session<S> {
    pub async fn join(config: SessionConfig, surface: S) -> Result<Self, SessionError> {
        Self::join_with_clock(config, surface, Arc::new(SystemClock)).await
    }

    /// Join with an injected clock for the engine and presence channel.
    pub async fn join_with_clock(
        config: SessionConfig,
        surface: S,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let peer_id = Uuid::new_v4();
        let doc = YrsDocument::new();

        let replica = config
            .replica_path
            .as_ref()
            .map(|path| ReplicaCache::new(path.clone(), config.room_id.clone()));
        if let Some(cache) = &replica {
            match cache.load() {
                Ok(Some(state)) => {
                    doc.apply_remote_update(&state)?;
                    log::info!("Restored local replica of room {}", config.room_id);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Ignoring unreadable replica {}: {e}", cache.path().display()),
            }
        }

        // The presence slot exists before any subscription starts.
        let color = config.color.unwrap_or_else(|| CursorColor::from_uuid(peer_id));
        let presence = PresenceChannel::with_clock(
            peer_id,
            PresenceState::new(config.user_name.clone(), color),
            config.presence.clone(),
            clock.clone(),
        );

        let info = PeerInfo {
            peer_id,
            name: config.user_name.clone(),
            color,
        };
        let mut client = SyncClient::new(info, config.room_id.clone(), config.server_url.clone())
            .with_connect_timeout(config.connect_timeout);
        let events = client
            .take_event_rx()
            .ok_or(ProtocolError::ConnectionClosed)?;

        let engine = SyncEngine::with_clock(
            surface,
            doc,
            SessionTag::from_peer(peer_id),
            config.sync.clone(),
            clock.clone(),
        );

        let mut session = Self {
            peer_id,
            engine,
            client,
            events,
            presence,
            replica,
            reconnect: config.reconnect.clone(),
            reconnect_attempt: 0,
            next_reconnect: None,
            clock,
            start_mode: StartMode::Seeded { blocks: 0 },
        };

        match session.client.connect().await {
            Ok(()) => {
                session.client.send_sync_step1(session.engine.document().encode_state_vector()).await?;
                session.await_initial_sync(config.initial_sync_timeout).await;
            }
            Err(e) => {
                log::warn!("Relay unreachable, editing offline: {e}");
                session.schedule_reconnect().await;
            }
        }

        session.start_mode = session.engine.start(config.bootstrap_snapshot.as_ref())?;
        log::info!(
            "Joined room {} as {} ({:?})",
            config.room_id,
            session.peer_id,
            session.start_mode
        );
        session.forward_local_updates().await;
        Ok(session)
    }

    /// Drain transport events until the relay's state has arrived or the
    /// timeout passes. The engine is not running yet, so remote state lands
    /// in the replica only.
    async fn await_initial_sync(&mut self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => {
                    if self.handle_event(event).await {
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    log::warn!("No initial state from relay within {timeout:?}, starting with local replica");
                    return;
                }
            }
        }
    }

    /// Apply one transport event. Returns `true` for the relay's answer to
    /// our state vector.
    async fn handle_event(&mut self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::RemoteUpdate { peer_id, update, .. } => {
                if let Err(e) = self.engine.document().apply_remote_update(&update) {
                    log::warn!("Dropping bad update from {peer_id}: {e}");
                }
            }
            SyncEvent::StateSynced(diff) => {
                if let Err(e) = self.engine.document().apply_remote_update(&diff) {
                    log::warn!("Dropping bad state from relay: {e}");
                }
                return true;
            }
            SyncEvent::SyncRequest { state_vector } => {
                match self.engine.document().encode_diff(&state_vector) {
                    Ok(diff) => {
                        if let Err(e) = self.client.send_sync_step2(diff).await {
                            log::warn!("Failed to answer sync request: {e}");
                        }
                    }
                    Err(e) => log::warn!("Bad state vector from relay: {e}"),
                }
            }
            SyncEvent::RemoteAwareness { message, .. } => {
                self.presence.handle_message(&message);
            }
            SyncEvent::PeerJoined(info) => {
                log::debug!("{} ({}) is in the room", info.name, info.peer_id);
            }
            SyncEvent::PeerLeft(peer_id) => {
                self.presence.handle_peer_left(peer_id);
            }
            SyncEvent::Connected => {
                self.reconnect_attempt = 0;
                self.next_reconnect = None;
            }
            SyncEvent::Disconnected => {
                log::warn!("Lost relay connection, editing offline");
                self.presence.clear_remote_peers();
                self.schedule_reconnect().await;
            }
            SyncEvent::Pong => {}
        }
        false
    }

    /// One turn of the session loop. Never waits on the network.
    pub async fn pump(&mut self) -> SessionReport {
        let mut report = SessionReport::default();

        while let Ok(event) = self.events.try_recv() {
            if matches!(event, SyncEvent::RemoteUpdate { .. } | SyncEvent::StateSynced(_)) {
                report.remote_updates += 1;
            }
            self.handle_event(event).await;
        }

        report.sync = self.engine.pump();
        report.sent_updates = self.forward_local_updates().await;

        self.mirror_drag_marker();
        if let Some(message) = self.presence.poll_publish() {
            match self.client.send_awareness(&message).await {
                Ok(sent) => report.presence_published = sent,
                Err(e) => log::debug!("Presence not sent: {e}"),
            }
        }
        self.presence.cleanup_idle_peers();

        report.reconnected = self.reconnect_if_due().await;
        report
    }

    pub fn update_cursor(&mut self, position: Option<Vec2>) {
        self.presence.update_cursor(position);
    }

    pub async fn status(&self) -> ConnectionState {
        self.client.connection_state().await
    }

    /// Earliest instant at which `pump` has timed work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.engine.next_deadline(), self.next_reconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Write everything pending, stop syncing, say goodbye, persist the
    /// replica and hand the surface back.
    pub async fn leave(mut self) -> Result<S, SessionError> {
        self.engine.flush_pending();
        self.forward_local_updates().await;

        // Listeners go before anything is torn down.
        self.engine.dispose();

        let leave = self.presence.clear_local();
        if let Err(e) = self.client.send_awareness(&leave).await {
            log::debug!("Leave not sent: {e}");
        }

        if let Some(cache) = &self.replica {
            cache.save(&self.engine.document().encode_state_as_update())?;
        }

        self.client.disconnect().await;
        log::info!("Left room {}", self.client.room_id());

        let (surface, _) = self.engine.into_parts();
        Ok(surface)
    }

    fn mirror_drag_marker(&mut self) {
        let marker = self.engine.dragging().and_then(|id| {
            self.engine.surface().node(id).map(|node| DragMarker {
                node_id: id.to_string(),
                position: Vec2::new(node.position.x, node.position.y),
            })
        });
        self.presence.set_dragging(marker);
    }

    async fn forward_local_updates(&mut self) -> usize {
        let updates = self.engine.document().take_local_updates();
        let count = updates.len();
        for update in updates {
            if let Err(e) = self.client.send_update(update).await {
                // The replica still has it; the next handshake carries it.
                log::warn!("Update not sent: {e}");
            }
        }
        count
    }

    async fn schedule_reconnect(&mut self) {
        match self.reconnect.delay_for(self.reconnect_attempt) {
            Some(delay) => {
                self.next_reconnect = Some(self.clock.now() + delay);
                self.client.mark_reconnecting().await;
                log::debug!("Reconnect attempt {} in {delay:?}", self.reconnect_attempt + 1);
            }
            None => {
                self.next_reconnect = None;
                log::error!("Giving up on the relay after {} attempts", self.reconnect_attempt);
            }
        }
    }

    async fn reconnect_if_due(&mut self) -> bool {
        let Some(at) = self.next_reconnect else {
            return false;
        };
        if self.clock.now() < at {
            return false;
        }
        self.next_reconnect = None;
        match self.client.connect().await {
            Ok(()) => {
                self.reconnect_attempt = 0;
                if let Err(e) = self
                    .client
                    .send_sync_step1(self.engine.document().encode_state_vector())
                    .await
                {
                    log::warn!("Handshake after reconnect failed: {e}");
                }
                let state = self.presence.force_publish();
                if let Err(e) = self.client.send_awareness(&state).await {
                    log::debug!("Presence not sent after reconnect: {e}");
                }
                log::info!("Reconnected to relay");
                true
            }
            Err(e) => {
                self.reconnect_attempt += 1;
                log::debug!("Reconnect failed: {e}");
                self.schedule_reconnect().await;
                false
            }
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn room_id(&self) -> &str {
        self.client.room_id()
    }

    pub fn start_mode(&self) -> StartMode {
        self.start_mode
    }

    pub fn engine(&self) -> &SyncEngine<S, YrsDocument> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine<S, YrsDocument> {
        &mut self.engine
    }

    pub fn presence(&self) -> &PresenceChannel {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceChannel {
        &mut self.presence
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }
}
