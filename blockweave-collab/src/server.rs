//! WebSocket relay hosting collaboration rooms.
//!
//! Each room keeps an authoritative `yrs::Doc`, so a peer joining late (or
//! coming back from offline) syncs against the relay instead of needing
//! another peer online. Presence is relayed as-is; the relay only
//! remembers each peer's last frame so newcomers see who is already there.
//!
//! ```text
//! peer ──PeerJoined──► relay ──SyncStep1(sv)──► peer
//!                            ──known presence─► peer
//! peer ──SyncStep1(sv)─► relay ──SyncStep2(diff)─► peer
//! peer ──Update────────► relay ──Update──► other peers
//! peer ──Awareness─────► relay ──Awareness──► other peers
//! (socket closes)        relay ──PeerLeft──► other peers
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{BroadcastGroup, RoomFrame};
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Peers beyond this are refused at join
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before a slow peer lags
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_updates: u64,
    pub active_rooms: usize,
}

struct Room {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
    /// Last awareness frame of every peer, replayed to newcomers
    presence: HashMap<Uuid, Arc<Vec<u8>>>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            presence: HashMap::new(),
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    fn apply(&self, update: &[u8]) -> Result<(), ProtocolError> {
        let update = Update::decode_v1(update).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

type Rooms = Arc<RwLock<HashMap<String, Room>>>;

pub struct SyncServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.read().await.len();
        stats
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn peer_count(&self, room_id: &str) -> usize {
        let group = {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).map(|r| r.broadcast.clone())
        };
        match group {
            Some(group) => group.peer_count().await,
            None => 0,
        }
    }

    /// The relay's full copy of a room, as a v1 update.
    pub async fn room_state(&self, room_id: &str) -> Option<Vec<u8>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|room| {
            room.doc
                .transact()
                .encode_state_as_update_v1(&StateVector::default())
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut peer_id: Option<Uuid> = None;
        let mut room_id: Option<String> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<RoomFrame>> = None;
        let mut broadcast_group: Option<Arc<BroadcastGroup>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match sync_msg.msg_type {
                                    MessageType::PeerJoined => {
                                        if peer_id.is_some() {
                                            log::debug!("Ignoring repeated join from {addr}");
                                            continue;
                                        }
                                        let info = sync_msg
                                            .peer_info()
                                            .unwrap_or_else(|_| PeerInfo::with_id(sync_msg.peer_id, "Anonymous"));

                                        let (group, sv, known_presence) = {
                                            let mut rooms_w = rooms.write().await;
                                            let room = rooms_w
                                                .entry(sync_msg.room_id.clone())
                                                .or_insert_with(|| Room::new(config.broadcast_capacity));
                                            let group = room.broadcast.clone();
                                            let presence: Vec<Arc<Vec<u8>>> = room.presence.values().cloned().collect();
                                            (group, room.state_vector(), presence)
                                        };

                                        if group.peer_count().await >= config.max_peers_per_room {
                                            log::warn!(
                                                "Room {} is full, refusing {} from {addr}",
                                                sync_msg.room_id,
                                                info.peer_id
                                            );
                                            stats.write().await.refused_connections += 1;
                                            drop_room_if_empty(&rooms, &sync_msg.room_id).await;
                                            ws_sender.send(Message::Close(None)).await?;
                                            break;
                                        }

                                        let existing = group.peers().await;
                                        broadcast_rx = Some(group.add_peer(info.clone()).await);
                                        broadcast_group = Some(group.clone());
                                        peer_id = Some(info.peer_id);
                                        room_id = Some(sync_msg.room_id.clone());

                                        let step1 = SyncMessage::sync_step1(Uuid::nil(), sync_msg.room_id.clone(), sv);
                                        ws_sender.send(Message::Binary(step1.encode()?.into())).await?;
                                        for other in &existing {
                                            let joined = SyncMessage::peer_joined(sync_msg.room_id.clone(), other)?;
                                            ws_sender.send(Message::Binary(joined.encode()?.into())).await?;
                                        }
                                        for frame in known_presence {
                                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                                        }
                                        group.broadcast_raw(info.peer_id, Arc::new(bytes));

                                        log::info!(
                                            "Peer {} ({}) joined room {}",
                                            info.name,
                                            info.peer_id,
                                            sync_msg.room_id
                                        );
                                    }
                                    MessageType::Update | MessageType::SyncStep2 => {
                                        let (Some(pid), Some(rid)) = (peer_id, room_id.as_deref()) else {
                                            log::debug!("Update before join from {addr}");
                                            continue;
                                        };
                                        let applied = {
                                            let rooms_w = rooms.write().await;
                                            match rooms_w.get(rid) {
                                                Some(room) => room.apply(&sync_msg.payload),
                                                None => Err(ProtocolError::ConnectionClosed),
                                            }
                                        };
                                        match applied {
                                            Ok(()) => {
                                                if let Some(group) = &broadcast_group {
                                                    let relay = SyncMessage::update(pid, rid, sync_msg.clock, sync_msg.payload);
                                                    group.broadcast(&relay)?;
                                                }
                                            }
                                            Err(e) => {
                                                log::warn!("Rejected update from {pid} in room {rid}: {e}");
                                                stats.write().await.rejected_updates += 1;
                                            }
                                        }
                                    }
                                    MessageType::SyncStep1 => {
                                        let Some(rid) = room_id.as_deref() else {
                                            continue;
                                        };
                                        let diff = {
                                            let rooms_r = rooms.read().await;
                                            rooms_r.get(rid).map(|room| room.diff(&sync_msg.payload))
                                        };
                                        match diff {
                                            Some(Ok(diff)) => {
                                                let response = SyncMessage::sync_step2(Uuid::nil(), rid, diff);
                                                ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                                            }
                                            Some(Err(e)) => log::warn!("Bad state vector from {addr}: {e}"),
                                            None => {}
                                        }
                                    }
                                    MessageType::Awareness => {
                                        let (Some(pid), Some(rid)) = (peer_id, room_id.as_deref()) else {
                                            continue;
                                        };
                                        let frame = Arc::new(bytes);
                                        {
                                            let mut rooms_w = rooms.write().await;
                                            if let Some(room) = rooms_w.get_mut(rid) {
                                                match AwarenessMessage::decode(&sync_msg.payload) {
                                                    Ok(AwarenessMessage::Leave { .. }) => {
                                                        room.presence.remove(&pid);
                                                    }
                                                    Ok(AwarenessMessage::State { .. }) => {
                                                        log::trace!("Presence update from {pid} in room {rid}");
                                                        room.presence.insert(pid, frame.clone());
                                                    }
                                                    Err(e) => log::debug!("Opaque awareness frame from {pid}: {e}"),
                                                }
                                            }
                                        }
                                        if let Some(group) = &broadcast_group {
                                            group.broadcast_raw(pid, frame);
                                        }
                                    }
                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(Uuid::nil());
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }
                                    MessageType::PeerLeft | MessageType::Pong => {
                                        log::trace!("Ignoring {:?} from {addr}", sync_msg.msg_type);
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(frame) => {
                                if peer_id.is_some_and(|pid| frame.is_from(pid)) {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id:?} lagged by {n} messages");
                                if let Some(group) = &broadcast_group {
                                    group.record_dropped(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let (Some(pid), Some(rid)) = (peer_id, room_id) {
            if let Some(group) = &broadcast_group {
                group.remove_peer(&pid).await;
                let _ = group.broadcast(&SyncMessage::peer_left(pid, rid.as_str()));
            }
            {
                let mut rooms_w = rooms.write().await;
                if let Some(room) = rooms_w.get_mut(&rid) {
                    room.presence.remove(&pid);
                }
            }
            drop_room_if_empty(&rooms, &rid).await;
            log::info!("Peer {pid} left room {rid}");
        }

        stats.write().await.active_connections -= 1;
        result
    }
}

async fn drop_room_if_empty(rooms: &Rooms, room_id: &str) {
    let group = {
        let rooms_r = rooms.read().await;
        rooms_r.get(room_id).map(|r| r.broadcast.clone())
    };
    let Some(group) = group else {
        return;
    };
    if group.peer_count().await > 0 {
        return;
    }
    let mut rooms_w = rooms.write().await;
    // Someone may have joined between the two locks.
    if let Some(room) = rooms_w.get(room_id) {
        if Arc::ptr_eq(&room.broadcast, &group) && group.peer_count().await == 0 {
            rooms_w.remove(room_id);
            log::info!("Room {room_id} closed");
        }
    }
}
