//! Two editor sessions talking through a real relay.

use std::sync::Arc;

use blockweave_collab::client::ConnectionState;
use blockweave_collab::server::{ServerConfig, SyncServer};
use blockweave_collab::session::{Session, SessionConfig};
use blockweave_core::collab::{ReplicatedDocument, StartMode, YrsDocument};
use blockweave_core::{parse_snapshot, BlockWorkspace, EditorSurface, FieldValue, Position};
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration, Instant};

type Editor = Session<BlockWorkspace>;

async fn start_relay_on(listener: TcpListener) -> (Arc<SyncServer>, String) {
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..ServerConfig::default()
    }));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("ws://{addr}"))
}

async fn start_relay() -> (Arc<SyncServer>, String) {
    start_relay_on(TcpListener::bind("127.0.0.1:0").await.unwrap()).await
}

async fn join(url: &str, room: &str, name: &str) -> Editor {
    Session::join(SessionConfig::for_testing(url, room, name), BlockWorkspace::new())
        .await
        .unwrap()
}

/// Pump both sessions until `done` holds. Returns whether it did in time.
async fn settle(a: &mut Editor, b: &mut Editor, done: impl Fn(&Editor, &Editor) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        a.pump().await;
        b.pump().await;
        if done(a, b) {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Poll the relay until its copy of `room` holds `blocks` records.
async fn wait_for_relay(server: &SyncServer, room: &str, blocks: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(state) = server.room_state(room).await {
            let doc = YrsDocument::new();
            doc.apply_remote_update(&state).unwrap();
            if doc.block_count() >= blocks {
                return true;
            }
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

fn field(editor: &Editor, id: &str, name: &str) -> Option<FieldValue> {
    editor.engine().surface().field(id, name).cloned()
}

fn position(editor: &Editor, id: &str) -> Option<Position> {
    editor.engine().surface().node(id).map(|node| node.position)
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let (_server, url) = start_relay().await;
    let mut alice = join(&url, "doc", "Alice").await;
    let mut bob = join(&url, "doc", "Bob").await;
    assert_eq!(alice.status().await, ConnectionState::Connected);
    assert_eq!(bob.status().await, ConnectionState::Connected);

    let surface = alice.engine_mut().surface_mut();
    surface.create_node("math_number", "n1").unwrap();
    surface.set_field("n1", "NUM", FieldValue::Number(7.0)).unwrap();
    surface.move_node_to("n1", Position::new(30.0, 40.0)).unwrap();

    let converged = settle(&mut alice, &mut bob, |_, b| {
        field(b, "n1", "NUM") == Some(FieldValue::Number(7.0))
            && position(b, "n1") == Some(Position::new(30.0, 40.0))
    })
    .await;
    assert!(converged, "Bob should see Alice's block");

    bob.engine_mut()
        .surface_mut()
        .set_field("n1", "NUM", FieldValue::Number(8.0))
        .unwrap();
    let converged = settle(&mut alice, &mut bob, |a, _| {
        field(a, "n1", "NUM") == Some(FieldValue::Number(8.0))
    })
    .await;
    assert!(converged, "Alice should see Bob's edit");

    alice.engine_mut().surface_mut().delete_node("n1").unwrap();
    let converged = settle(&mut alice, &mut bob, |_, b| position(b, "n1").is_none()).await;
    assert!(converged, "Bob should see the delete");
}

#[tokio::test]
async fn test_connection_crosses_the_network() {
    let (_server, url) = start_relay().await;
    let mut alice = join(&url, "links", "Alice").await;
    let mut bob = join(&url, "links", "Bob").await;

    let surface = alice.engine_mut().surface_mut();
    surface.create_node("controls_if", "if1").unwrap();
    surface.create_node("logic_boolean", "cond").unwrap();
    surface.connect_slot("if1", "IF0", Some("cond")).unwrap();

    let converged = settle(&mut alice, &mut bob, |_, b| {
        b.engine()
            .surface()
            .node("if1")
            .is_some_and(|node| node.links.get("IF0").map(String::as_str) == Some("cond"))
    })
    .await;
    assert!(converged, "Bob should see the connection");
}

#[tokio::test]
async fn test_drag_holds_remote_changes_until_drop() {
    let (_server, url) = start_relay().await;
    let mut alice = join(&url, "drag", "Alice").await;
    let mut bob = join(&url, "drag", "Bob").await;
    let alice_id = alice.peer_id();

    let surface = alice.engine_mut().surface_mut();
    surface.create_node("math_number", "b1").unwrap();
    surface.set_field("b1", "NUM", FieldValue::Number(1.0)).unwrap();
    assert!(settle(&mut alice, &mut bob, |_, b| position(b, "b1").is_some()).await);

    let surface = alice.engine_mut().surface_mut();
    surface.begin_drag("b1").unwrap();
    surface.move_node_to("b1", Position::new(100.0, 0.0)).unwrap();

    // Bob sees the drag marker while Alice holds the block.
    let marked = settle(&mut alice, &mut bob, |_, b| {
        b.presence()
            .peer(&alice_id)
            .and_then(|state| state.dragging.as_ref())
            .is_some_and(|marker| marker.node_id == "b1")
    })
    .await;
    assert!(marked, "Bob should see Alice dragging b1");

    let surface = bob.engine_mut().surface_mut();
    surface.set_field("b1", "NUM", FieldValue::Number(9.0)).unwrap();
    surface.move_node_to("b1", Position::new(-5.0, -5.0)).unwrap();

    let arrived = settle(&mut alice, &mut bob, |a, _| {
        a.engine()
            .document()
            .block("b1")
            .ok()
            .flatten()
            .is_some_and(|record| record.fields.get("NUM") == Some(&FieldValue::Number(9.0)))
    })
    .await;
    assert!(arrived, "Bob's edit should reach Alice's replica");
    assert_eq!(field(&alice, "b1", "NUM"), Some(FieldValue::Number(1.0)));
    assert_eq!(position(&alice, "b1"), Some(Position::new(100.0, 0.0)));

    let surface = alice.engine_mut().surface_mut();
    surface.move_node_to("b1", Position::new(150.0, 20.0)).unwrap();
    surface.end_drag("b1").unwrap();

    let drop_spot = Position::new(150.0, 20.0);
    let converged = settle(&mut alice, &mut bob, |a, b| {
        field(a, "b1", "NUM") == Some(FieldValue::Number(9.0))
            && position(a, "b1") == Some(drop_spot)
            && field(b, "b1", "NUM") == Some(FieldValue::Number(9.0))
            && position(b, "b1") == Some(drop_spot)
    })
    .await;
    assert!(converged, "both sides should end with Bob's value at Alice's drop spot");
    assert!(alice.presence().local_state().dragging.is_none());
}

#[tokio::test]
async fn test_late_joiner_loads_seeded_room() {
    let (server, url) = start_relay().await;
    let bootstrap = parse_snapshot(
        r#"{"blocks":{"blocks":[{"type":"controls_if","id":"if1","x":5,"y":5,
            "inputs":{"IF0":{"block":{"type":"logic_boolean","id":"cond","fields":{"BOOL":"TRUE"}}}}}]},
            "variables":[{"id":"v1","name":"total"}]}"#,
    )
    .unwrap();

    let mut config = SessionConfig::for_testing(&url, "seeded", "Alice");
    config.bootstrap_snapshot = Some(bootstrap.clone());
    let alice = Session::join(config, BlockWorkspace::new()).await.unwrap();
    assert_eq!(alice.start_mode(), StartMode::Seeded { blocks: 2 });
    assert!(wait_for_relay(&server, "seeded", 2).await);

    // A second bootstrap must not be applied over existing state.
    let mut config = SessionConfig::for_testing(&url, "seeded", "Bob");
    config.bootstrap_snapshot = Some(bootstrap);
    let bob = Session::join(config, BlockWorkspace::new()).await.unwrap();
    assert_eq!(bob.start_mode(), StartMode::Loaded { blocks: 2 });

    let surface = bob.engine().surface();
    assert_eq!(surface.node("if1").unwrap().links.get("IF0").map(String::as_str), Some("cond"));
    assert_eq!(surface.field("cond", "BOOL"), Some(&FieldValue::Text("TRUE".into())));
    assert_eq!(surface.variables().len(), 1);
    assert_eq!(bob.engine().document().block_count(), 2);
}

#[tokio::test]
async fn test_offline_edits_reach_relay_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = format!("ws://{addr}");
    let mut session = join(&url, "late-relay", "Alice").await;
    assert_eq!(session.status().await, ConnectionState::Reconnecting);
    session
        .engine_mut()
        .surface_mut()
        .create_node("text", "offline")
        .unwrap();
    session.engine_mut().flush_pending();
    session.pump().await;

    let (server, _) = start_relay_on(TcpListener::bind(addr).await.unwrap()).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.status().await != ConnectionState::Connected && Instant::now() < deadline {
        session.pump().await;
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.status().await, ConnectionState::Connected);
    assert!(wait_for_relay(&server, "late-relay", 1).await);
}

#[tokio::test]
async fn test_leave_announces_departure() {
    let (server, url) = start_relay().await;
    let mut alice = join(&url, "bye", "Alice").await;
    let mut bob = join(&url, "bye", "Bob").await;
    let bob_id = bob.peer_id();

    assert!(settle(&mut alice, &mut bob, |a, _| a.presence().peer(&bob_id).is_some()).await);

    let surface = bob.leave().await.unwrap();
    assert!(surface.is_empty());

    let deadline = Instant::now() + Duration::from_secs(5);
    while alice.presence().peer(&bob_id).is_some() && Instant::now() < deadline {
        alice.pump().await;
        sleep(Duration::from_millis(5)).await;
    }
    assert!(alice.presence().peer(&bob_id).is_none());

    while server.peer_count("bye").await > 1 && Instant::now() < deadline {
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.peer_count("bye").await, 1);
}
