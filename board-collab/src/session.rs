//! One client's collaboration session on one board.
//!
//! The session is the explicit owner of every engine component: nothing is
//! global, and everything it starts is stopped by [`CollabSession::shutdown`].
//!
//! ```text
//! start:    LocalStore ─► ReplicaSet (restore) ─► Broadcaster ─► OfflineQueue
//!                          ─► join board ─► background tasks ─► Selector
//! shutdown: Selector ─► tasks ─► leave board ─► persist snapshot
//! ```
//!
//! While running, the board snapshot is also written shortly after element
//! changes settle, so a process that dies without `shutdown` restarts from
//! the last settled state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::awareness::UserIdentity;
use crate::broadcaster::OperationBroadcaster;
use crate::clock::MonotonicClock;
use crate::config::CollabConfig;
use crate::conflict::ConflictResolver;
use crate::error::CollabError;
use crate::offline::{DurableWriter, OfflineQueueManager};
use crate::quality::QualityMonitor;
use crate::replica::ReplicaSet;
use crate::selector::{BackendContext, BackendKind, CollaborationSelector};
use crate::storage::{LocalStore, StoreConfig};
use crate::subscription::Subscription;
use crate::transport::Transport;

/// Parameters for [`CollabSession::start`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub board_id: String,
    pub user: UserIdentity,
    /// Client id on every published frame; generated when absent.
    ///
    /// A supplied id may be reused across restarts. Peers replace the old
    /// awareness entry when the new session's first snapshot arrives.
    pub client_id: Option<String>,
    pub backend: BackendKind,
    pub config: CollabConfig,
    pub store: StoreConfig,
}

impl SessionOptions {
    pub fn new(board_id: impl Into<String>, user: UserIdentity, store: StoreConfig) -> Self {
        Self {
            board_id: board_id.into(),
            user,
            client_id: None,
            backend: BackendKind::Awareness,
            config: CollabConfig::default(),
            store,
        }
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn config(mut self, config: CollabConfig) -> Self {
        self.config = config;
        self
    }
}

pub struct CollabSession {
    board_id: String,
    broadcaster: Arc<OperationBroadcaster>,
    replicas: Arc<ReplicaSet>,
    store: Arc<LocalStore>,
    queue: Arc<OfflineQueueManager>,
    writer: Arc<DurableWriter>,
    selector: CollaborationSelector,
    quality: Arc<QualityMonitor>,
    replica_subscriptions: Vec<Subscription>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl CollabSession {
    /// Start a session over `transport`, creating its own quality monitor.
    pub async fn start(transport: Arc<dyn Transport>, options: SessionOptions) -> Result<Self, CollabError> {
        let quality = Arc::new(QualityMonitor::new(options.config.awareness.min_broadcast_interval()));
        Self::start_with_quality(transport, options, quality).await
    }

    /// Start a session sharing a quality monitor already fed by the transport.
    pub async fn start_with_quality(
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        quality: Arc<QualityMonitor>,
    ) -> Result<Self, CollabError> {
        let SessionOptions {
            board_id,
            user,
            client_id,
            backend,
            config,
            store,
        } = options;
        let client_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let store = Arc::new(LocalStore::open(store)?);
        let replicas = Arc::new(ReplicaSet::new(Arc::new(ConflictResolver::new())));
        if let Some(snapshot) = store.load_snapshot(&board_id)? {
            replicas.restore(snapshot);
        }

        let broadcaster = Arc::new(OperationBroadcaster::new(
            transport.clone(),
            client_id.clone(),
            Arc::new(MonotonicClock::new()),
        ));
        let queue = Arc::new(OfflineQueueManager::open(
            store.clone(),
            broadcaster.clone(),
            replicas.clone(),
            config.offline.clone(),
            transport.connection_status(),
        )?);
        let writer = Arc::new(DurableWriter::new(broadcaster.clone(), replicas.clone(), queue.clone()));

        let mut replica_subscriptions = replicas.attach(&broadcaster, &board_id);
        let cancel = CancellationToken::new();
        let (on_change, snapshot_task) = spawn_snapshot_writer(
            board_id.clone(),
            replicas.clone(),
            store.clone(),
            config.offline.snapshot_debounce(),
            cancel.child_token(),
        );
        replica_subscriptions.push(on_change);
        broadcaster.join_board(&board_id).await?;

        let tasks = vec![
            spawn_quality_link(transport.as_ref(), quality.clone(), cancel.child_token()),
            queue.spawn_background(cancel.child_token()),
            snapshot_task,
        ];

        let selector = CollaborationSelector::new(
            BackendContext {
                board_id: board_id.clone(),
                user,
                broadcaster: broadcaster.clone(),
                writer: writer.clone(),
                quality: quality.clone(),
                awareness: config.awareness.clone(),
            },
            backend,
        );
        queue.request_sync();
        log::info!("Session {client_id} started on board {board_id}");

        Ok(Self {
            board_id,
            broadcaster,
            replicas,
            store,
            queue,
            writer,
            selector,
            quality,
            replica_subscriptions,
            cancel,
            tasks,
            closed: false,
        })
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn client_id(&self) -> &str {
        self.broadcaster.actor_id()
    }

    pub fn selector(&self) -> &CollaborationSelector {
        &self.selector
    }

    pub fn broadcaster(&self) -> &Arc<OperationBroadcaster> {
        &self.broadcaster
    }

    pub fn replicas(&self) -> &Arc<ReplicaSet> {
        &self.replicas
    }

    pub fn queue(&self) -> &Arc<OfflineQueueManager> {
        &self.queue
    }

    pub fn writer(&self) -> &Arc<DurableWriter> {
        &self.writer
    }

    pub fn quality(&self) -> &Arc<QualityMonitor> {
        &self.quality
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Write the board's replica to the local store.
    pub fn persist_snapshot(&self) -> Result<(), CollabError> {
        if let Some(snapshot) = self.replicas.snapshot(&self.board_id) {
            self.store.save_snapshot(&snapshot)?;
        }
        Ok(())
    }

    /// Stop everything the session started and persist its state. Idempotent.
    pub async fn shutdown(&mut self) -> Result<(), CollabError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.selector.shutdown().await;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for subscription in self.replica_subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.broadcaster.shutdown().await;

        self.persist_snapshot()?;
        self.store.flush()?;
        log::info!(
            "Session {} on board {} shut down ({} changes still pending)",
            self.client_id(),
            self.board_id,
            self.queue.get_pending_changes_count()
        );
        Ok(())
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Persist the board snapshot once element changes have been quiet for
/// `debounce`.
fn spawn_snapshot_writer(
    board_id: String,
    replicas: Arc<ReplicaSet>,
    store: Arc<LocalStore>,
    debounce: Duration,
    cancel: CancellationToken,
) -> (Subscription, JoinHandle<()>) {
    let dirty = Arc::new(Notify::new());
    let signal = dirty.clone();
    let board = board_id.clone();
    let subscription = replicas.on_element_change(move |change| {
        if change.board_id == board {
            signal.notify_one();
        }
    });

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = dirty.notified() => {}
            }
            // Keep waiting while changes keep arriving, up to ten quiet periods.
            let deadline = tokio::time::Instant::now() + debounce * 10;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = tokio::time::sleep(debounce) => break,
                    _ = dirty.notified() => continue,
                }
            }
            if let Some(snapshot) = replicas.snapshot(&board_id) {
                match store.save_snapshot(&snapshot) {
                    Ok(()) => log::trace!("Saved snapshot of board {board_id}"),
                    Err(e) => log::error!("Failed to save snapshot of board {board_id}: {e}"),
                }
            }
        }
    });
    (subscription, task)
}

/// Mirror the transport's connectivity into the quality monitor.
fn spawn_quality_link(
    transport: &dyn Transport,
    quality: Arc<QualityMonitor>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut status = transport.connection_status();
    quality.set_connected(*status.borrow_and_update());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    quality.set_connected(*status.borrow_and_update());
                }
            }
        }
    })
}
