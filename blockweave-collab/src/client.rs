//! WebSocket client for one room on the relay.
//!
//! Provides:
//! - Connection lifecycle (connect with timeout, disconnect, reconnect backoff)
//! - Update send/receive with an offline queue for edits made while away
//! - Sync handshake frames (state vector / diff)
//! - Awareness frames, dropped while offline
//!
//! The client never touches a document: everything it receives is turned
//! into a [`SyncEvent`] for the session to act on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// An incremental update from another peer
    RemoteUpdate {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// The relay sent its state vector and wants what it is missing
    SyncRequest { state_vector: Vec<u8> },
    /// The relay answered our state vector with a diff
    StateSynced(Vec<u8>),
    RemoteAwareness {
        peer_id: Uuid,
        message: AwarenessMessage,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    Pong,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn for_testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(millis as u64))
    }
}

/// Updates produced while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate {
            clock,
            payload,
            queued_at: Instant::now(),
        });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }

    /// How long the oldest queued update has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|u| u.queued_at.elapsed())
    }
}

/// The sync client.
pub struct SyncClient {
    peer_info: PeerInfo,
    room_id: String,
    server_url: String,
    connect_timeout: Duration,
    state: Arc<RwLock<ConnectionState>>,
    /// Lamport clock for outgoing updates
    clock: Arc<RwLock<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    reader: Option<JoinHandle<()>>,
    /// Bumped on every connect so a stale reader cannot mark a newer
    /// connection as lost.
    generation: Arc<AtomicU64>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room_id: room_id.into(),
            server_url: server_url.into(),
            connect_timeout: Duration::from_secs(5),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reader: None,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to `{server_url}/{room_id}`, announce this peer and replay
    /// the offline queue. Spawns the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.shutdown_tasks();
        let previous = *self.state.read().await;
        if previous != ConnectionState::Reconnecting {
            *self.state.write().await = ConnectionState::Connecting;
        }

        let url = format!("{}/{}", self.server_url, self.room_id);
        let ws_stream = match tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Timeout);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Writer task: outgoing channel -> socket; a dropped sender closes it.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        self.send_frame(&SyncMessage::peer_joined(self.room_id.clone(), &self.peer_info)?)
            .await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to {url} as {}", self.peer_info.peer_id);

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
            for (clock, payload) in queued {
                let msg = SyncMessage::update(self.peer_info.peer_id, self.room_id.clone(), clock, payload);
                self.send_frame(&msg).await?;
            }
        }

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current = self.generation.clone();
        let peer_id = self.peer_info.peer_id;
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) if sync_msg.peer_id == peer_id => {}
                            Ok(sync_msg) => {
                                if let Some(event) = to_event(sync_msg) {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if current.load(Ordering::SeqCst) == generation {
                *state.write().await = ConnectionState::Disconnected;
                let _ = event_tx.send(SyncEvent::Disconnected).await;
                log::info!("Connection to relay lost");
            }
        }));

        Ok(())
    }

    /// Close the socket. No Disconnected event is emitted for a close the
    /// caller asked for.
    pub async fn disconnect(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.shutdown_tasks();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Mark the client as waiting for a reconnect attempt.
    pub async fn mark_reconnecting(&self) {
        *self.state.write().await = ConnectionState::Reconnecting;
    }

    /// Send a document update; queued while offline.
    pub async fn send_update(&self, yrs_update: Vec<u8>) -> Result<(), ProtocolError> {
        let current_clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };

        if !self.is_connected().await {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(current_clock, yrs_update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::update(self.peer_info.peer_id, self.room_id.clone(), current_clock, yrs_update);
        self.send_frame(&msg).await
    }

    /// Send a presence frame. Returns whether it was sent; presence is
    /// never queued.
    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<bool, ProtocolError> {
        if !self.is_connected().await {
            return Ok(false);
        }
        let clock = *self.clock.read().await;
        let msg = SyncMessage::awareness(self.peer_info.peer_id, self.room_id.clone(), clock, message.encode()?);
        self.send_frame(&msg).await?;
        Ok(true)
    }

    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step1(self.peer_info.peer_id, self.room_id.clone(), state_vector);
        self.send_frame(&msg).await
    }

    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step2(self.peer_info.peer_id, self.room_id.clone(), diff);
        self.send_frame(&msg).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(&SyncMessage::ping(self.peer_info.peer_id)).await
    }

    async fn send_frame(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn shutdown_tasks(&mut self) {
        // Dropping the sender lets the writer close the socket.
        self.outgoing_tx = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tasks();
    }
}

fn to_event(msg: SyncMessage) -> Option<SyncEvent> {
    match msg.msg_type {
        MessageType::Update => Some(SyncEvent::RemoteUpdate {
            peer_id: msg.peer_id,
            clock: msg.clock,
            update: msg.payload,
        }),
        MessageType::SyncStep1 => Some(SyncEvent::SyncRequest {
            state_vector: msg.payload,
        }),
        MessageType::SyncStep2 => Some(SyncEvent::StateSynced(msg.payload)),
        MessageType::Awareness => match AwarenessMessage::decode(&msg.payload) {
            Ok(message) => Some(SyncEvent::RemoteAwareness {
                peer_id: msg.peer_id,
                message,
            }),
            Err(e) => {
                log::warn!("Bad awareness frame from {}: {e}", msg.peer_id);
                None
            }
        },
        MessageType::PeerJoined => msg.peer_info().ok().map(SyncEvent::PeerJoined),
        MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
        MessageType::Pong => Some(SyncEvent::Pong),
        MessageType::Ping => None,
    }
}
