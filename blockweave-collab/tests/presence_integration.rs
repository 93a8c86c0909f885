//! Presence frames through the relay: cursors, drag markers, replay to
//! late joiners and cleanup on leave.

use blockweave_collab::client::{SyncClient, SyncEvent};
use blockweave_collab::presence::{
    AwarenessMessage, CursorColor, DragMarker, PresenceChannel, PresenceConfig, PresenceState, Vec2,
};
use blockweave_collab::protocol::PeerInfo;
use blockweave_collab::server::{ServerConfig, SyncServer};
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration, Instant};

async fn start_test_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    });
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}")
}

/// Connect and wait until the relay has registered us.
async fn connect_client(name: &str, room: &str, url: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(PeerInfo::new(name), room, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::SyncRequest { .. }))
        .await
        .expect("relay handshake");
    (client, events)
}

async fn next_matching(events: &mut Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> Option<SyncEvent> {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) if pred(&event) => return Some(event),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

async fn next_awareness(events: &mut Receiver<SyncEvent>) -> Option<AwarenessMessage> {
    match next_matching(events, |e| matches!(e, SyncEvent::RemoteAwareness { .. })).await {
        Some(SyncEvent::RemoteAwareness { message, .. }) => Some(message),
        _ => None,
    }
}

fn channel_for(client: &SyncClient) -> PresenceChannel {
    let info = client.peer_info();
    PresenceChannel::new(
        info.peer_id,
        PresenceState::new(info.name.clone(), info.color),
        PresenceConfig::for_testing(),
    )
}

#[tokio::test]
async fn test_cursor_reaches_peer() {
    let url = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "room", &url).await;
    let (bob, mut bob_events) = connect_client("Bob", "room", &url).await;

    let mut alice_presence = channel_for(&alice);
    let mut bob_presence = channel_for(&bob);

    alice_presence.update_cursor(Some(Vec2::new(12.0, 34.0)));
    let frame = alice_presence.poll_publish().unwrap();
    assert!(alice.send_awareness(&frame).await.unwrap());

    let message = next_awareness(&mut bob_events).await.expect("Bob should see Alice's cursor");
    assert!(bob_presence.handle_message(&message));

    let state = bob_presence.peer(&alice.peer_info().peer_id).unwrap();
    assert_eq!(state.name, "Alice");
    assert_eq!(state.cursor, Some(Vec2::new(12.0, 34.0)));
    assert_eq!(state.color, alice.peer_info().color);
}

#[tokio::test]
async fn test_drag_marker_reaches_peer() {
    let url = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "room", &url).await;
    let (bob, mut bob_events) = connect_client("Bob", "room", &url).await;
    let mut alice_presence = channel_for(&alice);
    let mut bob_presence = channel_for(&bob);

    alice_presence.set_dragging(Some(DragMarker {
        node_id: "b7".into(),
        position: Vec2::new(1.0, 2.0),
    }));
    alice.send_awareness(&alice_presence.poll_publish().unwrap()).await.unwrap();
    bob_presence.handle_message(&next_awareness(&mut bob_events).await.unwrap());

    let marker = bob_presence
        .peer(&alice.peer_info().peer_id)
        .and_then(|s| s.dragging.clone())
        .unwrap();
    assert_eq!(marker.node_id, "b7");

    alice_presence.set_dragging(None);
    alice.send_awareness(&alice_presence.poll_publish().unwrap()).await.unwrap();
    bob_presence.handle_message(&next_awareness(&mut bob_events).await.unwrap());
    assert!(bob_presence.peer(&alice.peer_info().peer_id).unwrap().dragging.is_none());
}

#[tokio::test]
async fn test_late_joiner_receives_known_presence() {
    let url = start_test_server().await;
    let (alice, mut alice_events) = connect_client("Alice", "room", &url).await;
    let mut alice_presence = channel_for(&alice);
    alice_presence.update_cursor(Some(Vec2::new(5.0, 5.0)));
    alice.send_awareness(&alice_presence.poll_publish().unwrap()).await.unwrap();

    // Ordered on Alice's socket: once the pong is back the frame is stored.
    alice.send_ping().await.unwrap();
    assert!(next_matching(&mut alice_events, |e| *e == SyncEvent::Pong).await.is_some());

    let (_carol, mut carol_events) = connect_client("Carol", "room", &url).await;
    let message = next_awareness(&mut carol_events).await.expect("stored presence replayed");
    assert_eq!(message.user_id(), alice.peer_info().peer_id);
}

#[tokio::test]
async fn test_leave_clears_presence_for_everyone() {
    let url = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "room", &url).await;
    let (bob, mut bob_events) = connect_client("Bob", "room", &url).await;
    let mut alice_presence = channel_for(&alice);
    let mut bob_presence = channel_for(&bob);

    alice.send_awareness(&alice_presence.force_publish()).await.unwrap();
    bob_presence.handle_message(&next_awareness(&mut bob_events).await.unwrap());
    assert_eq!(bob_presence.peer_count(), 1);

    alice.send_awareness(&alice_presence.clear_local()).await.unwrap();
    let leave = next_awareness(&mut bob_events).await.unwrap();
    assert!(matches!(leave, AwarenessMessage::Leave { .. }));
    bob_presence.handle_message(&leave);
    assert_eq!(bob_presence.peer_count(), 0);

    // The relay forgot Alice's state, so nobody new hears about her.
    let (_carol, mut carol_events) = connect_client("Carol", "room", &url).await;
    let replayed = timeout(Duration::from_millis(200), next_awareness(&mut carol_events)).await;
    assert!(!matches!(replayed, Ok(Some(_))));
}

#[tokio::test]
async fn test_disconnect_is_seen_as_peer_left() {
    let url = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "room", &url).await;
    let (mut bob, mut bob_events) = connect_client("Bob", "room", &url).await;
    let mut alice_presence = channel_for(&alice);
    let mut bob_presence = channel_for(&bob);
    let alice_id = alice.peer_info().peer_id;

    alice_presence.update_cursor(Some(Vec2::new(0.0, 0.0)));
    alice.send_awareness(&alice_presence.poll_publish().unwrap()).await.unwrap();
    bob_presence.handle_message(&next_awareness(&mut bob_events).await.unwrap());

    drop(alice);
    let left = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, Some(SyncEvent::PeerLeft(alice_id)));
    assert!(bob_presence.handle_peer_left(alice_id));
    assert!(bob_presence.peer(&alice_id).is_none());

    bob.disconnect().await;
}

#[test]
fn test_colors_are_stable_per_peer() {
    let info = PeerInfo::new("Dana");
    assert_eq!(info.color, CursorColor::from_uuid(info.peer_id));
}
