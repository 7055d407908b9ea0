//! Awareness and backend selection across sessions sharing one board.

mod common;

use board_collab::awareness::{
    AwarenessState, AwarenessStore, AwarenessUpdate, BoundingBox, CursorPatch, PresencePatch, PresenceStatus,
    RemoteCursor, UserIdentity,
};
use board_collab::config::CollabConfig;
use board_collab::protocol::{DrawingLine, EventKind};
use board_collab::quality::QualityMonitor;
use board_collab::selector::BackendKind;
use board_collab::session::{CollabSession, SessionOptions};
use board_collab::storage::StoreConfig;
use board_collab::transport::{LocalHub, LocalTransport};
use common::{eventually, BOARD};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(3);

struct Peer {
    _dir: TempDir,
    transport: Arc<LocalTransport>,
    session: CollabSession,
}

async fn join(hub: &Arc<LocalHub>, user: &str, backend: BackendKind) -> Peer {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(hub.endpoint());
    let options = SessionOptions::new(
        BOARD,
        UserIdentity::new(user, user.to_uppercase()),
        StoreConfig::for_testing(dir.path()),
    )
    .client_id(format!("{user}-client"))
    .backend(backend)
    .config(CollabConfig::for_testing());
    let session = CollabSession::start(transport.clone(), options).await.unwrap();
    Peer {
        _dir: dir,
        transport,
        session,
    }
}

async fn awareness_store(session: &CollabSession) -> Arc<AwarenessStore> {
    let backend = session.selector().backend().await.unwrap();
    backend.awareness_store().cloned().expect("awareness backend is live")
}

fn line(id: &str) -> DrawingLine {
    DrawingLine {
        id: id.into(),
        points: vec![0.0, 0.0, 10.0, 10.0],
        tool: "pen".into(),
        color: "#000000".into(),
        stroke_width: 2.0,
    }
}

#[tokio::test]
async fn test_cursor_update_reaches_remote_listener() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Awareness).await;
    let bob = join(&hub, "bob", BackendKind::Awareness).await;

    let seen: Arc<Mutex<Option<Vec<RemoteCursor>>>> = Arc::default();
    let bob_store = awareness_store(&bob.session).await;
    let sink = seen.clone();
    let _listener = bob_store.on_cursors_change(move |cursors| {
        *sink.lock().unwrap() = Some(cursors.clone());
    });

    alice
        .session
        .selector()
        .backend()
        .await
        .unwrap()
        .broadcast_cursor(CursorPatch::at(100.0, 200.0).tool("pen").drawing(true))
        .await
        .unwrap();

    let arrived = eventually(WAIT, || {
        seen.lock().unwrap().as_ref().is_some_and(|cursors| {
            cursors
                .iter()
                .any(|c| c.client_id == "alice-client" && c.x == 100.0 && c.y == 200.0)
        })
    })
    .await;
    assert!(arrived, "cursor never reached bob");

    let cursors = seen.lock().unwrap().clone().unwrap();
    let cursor = cursors.iter().find(|c| c.client_id == "alice-client").unwrap();
    assert_eq!(cursor.user_id, "alice");
    assert!(cursor.is_active);
    assert_eq!(cursor.current_tool, "pen");
    assert!(cursor.is_drawing);
    assert!(!cursor.is_selecting);
}

#[tokio::test]
async fn test_editing_lock_set_and_cleared() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Awareness).await;
    let bob = join(&hub, "bob", BackendKind::Awareness).await;
    let alice_store = awareness_store(&alice.session).await;
    let bob_store = awareness_store(&bob.session).await;

    {
        let backend = alice.session.selector().backend().await.unwrap();
        backend.set_editing_element("text-1", "text").await.unwrap();
    }
    let editing = alice_store.get_editing_users();
    assert_eq!(editing.get("text-1").map(|u| u.user_id.as_str()), Some("alice"));
    assert!(
        eventually(WAIT, || bob_store
            .get_editing_users()
            .get("text-1")
            .is_some_and(|u| u.client_id == "alice-client"))
        .await
    );

    {
        let backend = alice.session.selector().backend().await.unwrap();
        backend.clear_editing_element().await.unwrap();
    }
    assert!(alice_store.get_editing_users().is_empty());
    assert!(alice_store.local_state().editing.is_none());
    assert!(eventually(WAIT, || bob_store.get_editing_users().is_empty()).await);
}

#[tokio::test]
async fn test_text_edit_maps_to_editing_state() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Awareness).await;
    let store = awareness_store(&alice.session).await;
    let backend = alice.session.selector().backend().await.unwrap();

    backend.start_text_edit("text-9").await.unwrap();
    assert_eq!(store.local_state().editing.unwrap().element_id, "text-9");

    // Finishing an element we do not hold leaves the lock alone.
    backend.finish_text_edit("text-other").await.unwrap();
    assert!(store.local_state().editing.is_some());

    backend.finish_text_edit("text-9").await.unwrap();
    assert!(store.local_state().editing.is_none());
}

#[test]
fn test_remote_snapshot_replaces_previous_wholesale() {
    let store = AwarenessStore::new(
        "local",
        UserIdentity::new("me", "Me"),
        Duration::from_secs(30),
        Arc::new(QualityMonitor::new(Duration::from_millis(33))),
    );

    let mut first = AwarenessState::new("remote", UserIdentity::new("bob", "Bob"), 1);
    first.cursor.x = 5.0;
    first.cursor.current_tool = "eraser".into();
    first.cursor.is_selecting = true;
    first.selection.element_ids.insert("e1".into());
    first.selection.bounding_box = Some(BoundingBox {
        x: 0.0,
        y: 0.0,
        width: 10.0,
        height: 10.0,
    });
    first.presence.current_activity = Some("drawing".into());
    assert!(store.apply_remote(AwarenessUpdate { clock: 1, state: first }));

    let mut second = AwarenessState::new("remote", UserIdentity::new("bob", "Bob"), 2);
    second.cursor.y = 7.0;
    assert!(store.apply_remote(AwarenessUpdate {
        clock: 2,
        state: second.clone(),
    }));

    let state = store.remote_state("remote").unwrap();
    assert_eq!(state, second);
    assert_eq!(state.cursor.x, 0.0);
    assert!(!state.cursor.is_selecting);
    assert!(state.selection.element_ids.is_empty());
    assert!(state.selection.bounding_box.is_none());
    assert!(state.presence.current_activity.is_none());
}

#[tokio::test]
async fn test_silent_peer_expires() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Awareness).await;
    let bob = join(&hub, "bob", BackendKind::Awareness).await;
    let alice_store = awareness_store(&alice.session).await;

    assert!(eventually(WAIT, || alice_store.remote_cursors().len() == 1).await);
    let expired = Arc::new(Mutex::new(0usize));
    let counter = expired.clone();
    let _listener = alice_store.on_presence_change(move |presence| {
        if presence.is_empty() {
            *counter.lock().unwrap() += 1;
        }
    });

    // Bob's heartbeats stop reaching the hub.
    bob.transport.disconnect();
    assert!(eventually(WAIT, || alice_store.remote_cursors().is_empty()).await);
    assert_eq!(*expired.lock().unwrap(), 1);
    assert_eq!(alice_store.get_connection_stats().total_clients, 1);
}

#[tokio::test]
async fn test_leaving_peer_is_removed_at_once() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Awareness).await;
    let mut bob = join(&hub, "bob", BackendKind::Awareness).await;
    let alice_store = awareness_store(&alice.session).await;

    assert!(eventually(WAIT, || alice_store.get_connection_stats().connected_users == 2).await);
    bob.session.shutdown().await.unwrap();
    assert!(eventually(Duration::from_millis(150), || alice_store.remote_cursors().is_empty()).await);
}

#[tokio::test]
async fn test_presence_status_propagates() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Awareness).await;
    let bob = join(&hub, "bob", BackendKind::Awareness).await;
    let bob_store = awareness_store(&bob.session).await;

    {
        let backend = alice.session.selector().backend().await.unwrap();
        backend
            .update_presence(PresencePatch::status(PresenceStatus::Away).activity(Some("reviewing".into())))
            .await
            .unwrap();
        backend
            .update_selection(vec!["e1".into(), "e2".into()], None)
            .await
            .unwrap();
    }

    assert!(
        eventually(WAIT, || bob_store.remote_presence().iter().any(|p| {
            p.status == PresenceStatus::Away
                && p.current_activity.as_deref() == Some("reviewing")
                && p.selection.element_ids.len() == 2
        }))
        .await
    );
}

// ───────────────────────────────────────────────────────────────────
// Backend selection
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_switching_backends_leaves_no_duplicate_handlers() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Awareness).await;
    let selector = alice.session.selector();
    let broadcaster = alice.session.broadcaster();

    assert_eq!(selector.kind().await, Some(BackendKind::Awareness));
    assert!(!selector.set_backend(BackendKind::Awareness).await);

    for _ in 0..3 {
        assert!(selector.set_backend(BackendKind::Legacy).await);
        assert_eq!(broadcaster.handler_count(BOARD, EventKind::Awareness), 0);
        assert_eq!(broadcaster.handler_count(BOARD, EventKind::CursorMove), 1);

        assert!(selector.set_backend(BackendKind::Awareness).await);
        assert_eq!(broadcaster.handler_count(BOARD, EventKind::Awareness), 1);
        assert_eq!(broadcaster.handler_count(BOARD, EventKind::AwarenessLeave), 1);
        assert_eq!(broadcaster.handler_count(BOARD, EventKind::CursorMove), 0);
    }
    // Durable handlers belong to the session, not the backend.
    assert_eq!(broadcaster.handler_count(BOARD, EventKind::ShapeCreated), 1);
}

#[tokio::test]
async fn test_durable_edits_reach_peers_from_either_backend() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Legacy).await;
    let bob = join(&hub, "bob", BackendKind::Awareness).await;

    {
        let backend = alice.session.selector().backend().await.unwrap();
        backend
            .create_shape("shape-1", json!({"kind": "rect", "w": 10}))
            .await
            .unwrap();
        backend.complete_drawing(&line("line-1")).await.unwrap();
    }
    {
        let backend = bob.session.selector().backend().await.unwrap();
        backend.create_text("text-1", json!({"text": "hi"})).await.unwrap();
        // Stroke previews have no awareness counterpart.
        backend.start_drawing(&line("line-2")).await.unwrap();
        backend.update_drawing(&line("line-2")).await.unwrap();
    }

    let (alice_replicas, bob_replicas) = (alice.session.replicas(), bob.session.replicas());
    assert!(
        eventually(WAIT, || {
            let a = alice_replicas.live_elements(BOARD);
            a.len() == 3 && a == bob_replicas.live_elements(BOARD)
        })
        .await
    );
    assert_eq!(bob_replicas.element(BOARD, "shape-1"), Some(json!({"kind": "rect", "w": 10})));
    assert!(bob_replicas.element(BOARD, "line-2").is_none());
}

#[tokio::test]
async fn test_legacy_stats_count_active_peers() {
    let hub = LocalHub::new(64);
    let alice = join(&hub, "alice", BackendKind::Legacy).await;
    let bob = join(&hub, "bob", BackendKind::Legacy).await;

    {
        let backend = bob.session.selector().backend().await.unwrap();
        backend.broadcast_cursor(CursorPatch::at(1.0, 2.0)).await.unwrap();
    }

    let mut stats = None;
    for _ in 0..300 {
        let current = alice.session.selector().backend().await.unwrap().connection_stats();
        if current.connected_users == 2 {
            stats = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = stats.expect("bob never counted as a peer");
    assert_eq!(stats.local_client_id, "alice-client");
    assert_eq!(stats.total_clients, 2);
}

#[tokio::test]
async fn test_selector_closed_after_shutdown() {
    let hub = LocalHub::new(64);
    let mut alice = join(&hub, "alice", BackendKind::Awareness).await;

    alice.session.shutdown().await.unwrap();
    alice.session.shutdown().await.unwrap();
    assert!(alice.session.selector().backend().await.is_err());
    assert_eq!(alice.session.selector().kind().await, None);
    assert!(alice.session.broadcaster().joined_boards().is_empty());
}
