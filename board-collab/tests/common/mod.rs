//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use board_collab::broadcaster::OperationBroadcaster;
use board_collab::clock::MonotonicClock;
use board_collab::config::OfflineConfig;
use board_collab::conflict::ConflictResolver;
use board_collab::error::TransportError;
use board_collab::offline::{DurableWriter, OfflineQueueManager};
use board_collab::protocol::{ElementType, EventKind, OpType, Operation};
use board_collab::replica::ReplicaSet;
use board_collab::storage::{LocalStore, StoreConfig};
use board_collab::subscription::Subscription;
use board_collab::transport::{Frame, LocalHub, LocalTransport, Transport};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub const BOARD: &str = "board-1";

/// Poll `condition` every few milliseconds until it holds or `within` passes.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn op(id: &str, actor: &str, element: &str, timestamp: u64, op_type: OpType, payload: Option<Value>) -> Operation {
    Operation {
        id: id.into(),
        board_id: BOARD.into(),
        actor_id: actor.into(),
        timestamp,
        op_type,
        element_type: ElementType::Shape,
        element_id: element.into(),
        payload,
    }
}

// ───────────────────────────────────────────────────────────────────
// Transport that fails chosen sends
// ───────────────────────────────────────────────────────────────────

/// Wraps a [`LocalTransport`] and fails the sends whose 1-based index is in
/// `fail_on`. Every other call goes straight through.
pub struct FlakyTransport {
    inner: LocalTransport,
    sends: AtomicUsize,
    fail_on: Mutex<HashSet<usize>>,
}

impl FlakyTransport {
    pub fn new(inner: LocalTransport, fail_on: impl IntoIterator<Item = usize>) -> Self {
        Self {
            inner,
            sends: AtomicUsize::new(0),
            fail_on: Mutex::new(fail_on.into_iter().collect()),
        }
    }

    pub fn inner(&self) -> &LocalTransport {
        &self.inner
    }

    pub fn send_attempts(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(&self, board_id: &str, frame: Frame) -> Result<(), TransportError> {
        let attempt = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.lock().unwrap().remove(&attempt) {
            return Err(TransportError::SendFailed(format!("injected failure on send {attempt}")));
        }
        self.inner.send(board_id, frame).await
    }

    async fn subscribe(&self, board_id: &str) -> Result<broadcast::Receiver<Frame>, TransportError> {
        self.inner.subscribe(board_id).await
    }

    async fn unsubscribe(&self, board_id: &str) {
        self.inner.unsubscribe(board_id).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn connection_status(&self) -> watch::Receiver<bool> {
        self.inner.connection_status()
    }
}

// ───────────────────────────────────────────────────────────────────
// Clients
// ───────────────────────────────────────────────────────────────────

/// A writing client: replica, persisted queue and writer over `transport`.
pub struct Client {
    pub broadcaster: Arc<OperationBroadcaster>,
    pub replicas: Arc<ReplicaSet>,
    pub queue: Arc<OfflineQueueManager>,
    pub writer: DurableWriter,
    pub store: Arc<LocalStore>,
    _subscriptions: Vec<Subscription>,
}

impl Client {
    pub async fn open(actor: &str, transport: Arc<dyn Transport>, store_path: &Path) -> Self {
        let store = Arc::new(LocalStore::open(StoreConfig::for_testing(store_path)).unwrap());
        let broadcaster = Arc::new(OperationBroadcaster::new(
            transport.clone(),
            actor,
            Arc::new(MonotonicClock::new()),
        ));
        let replicas = Arc::new(ReplicaSet::new(Arc::new(ConflictResolver::new())));
        let queue = Arc::new(
            OfflineQueueManager::open(
                store.clone(),
                broadcaster.clone(),
                replicas.clone(),
                OfflineConfig {
                    max_queue_len: 100,
                    sync_interval_ms: 60_000,
                    ..OfflineConfig::default()
                },
                transport.connection_status(),
            )
            .unwrap(),
        );
        let writer = DurableWriter::new(broadcaster.clone(), replicas.clone(), queue.clone());
        let subscriptions = replicas.attach(&broadcaster, BOARD);
        broadcaster.join_board(BOARD).await.unwrap();
        Self {
            broadcaster,
            replicas,
            queue,
            writer,
            store,
            _subscriptions: subscriptions,
        }
    }

    /// Commit a shape mutation through the writer; returns the operation id.
    pub async fn commit(&self, op_type: OpType, element: &str, payload: Option<Value>) -> String {
        let op = self
            .writer
            .operation(BOARD, op_type, ElementType::Shape, element, payload);
        let id = op.id.clone();
        self.writer.commit(op).await.unwrap();
        id
    }
}

/// A read-only peer that applies every durable event it receives and logs
/// the ids in arrival order.
pub struct Observer {
    pub broadcaster: Arc<OperationBroadcaster>,
    pub replicas: Arc<ReplicaSet>,
    pub received: Arc<Mutex<Vec<String>>>,
    _subscriptions: Vec<Subscription>,
}

impl Observer {
    pub async fn join(actor: &str, hub: &Arc<LocalHub>) -> Self {
        let broadcaster = Arc::new(OperationBroadcaster::new(
            Arc::new(hub.endpoint()),
            actor,
            Arc::new(MonotonicClock::new()),
        ));
        let replicas = Arc::new(ReplicaSet::new(Arc::new(ConflictResolver::new())));
        let received: Arc<Mutex<Vec<String>>> = Arc::default();

        let mut subscriptions = replicas.attach(&broadcaster, BOARD);
        for kind in [EventKind::ShapeCreated, EventKind::ShapeUpdated, EventKind::ShapeDeleted] {
            let log = received.clone();
            subscriptions.push(broadcaster.subscribe(BOARD, kind, move |delivery| {
                log.lock().unwrap().push(delivery.envelope.id.clone());
                Ok(())
            }));
        }
        broadcaster.join_board(BOARD).await.unwrap();
        Self {
            broadcaster,
            replicas,
            received,
            _subscriptions: subscriptions,
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}
