//! Operation broadcaster: publish to and dispatch from board channels.
//!
//! ```text
//! publish(board, kind, payload)
//!       │  Envelope { id, actor, ts } ── bincode
//!       ▼
//!   Transport ─────► every client on the board (sender included)
//!                          │
//!                          ▼
//!                  board pump task ── decode ── drop echo ── handlers
//! ```
//!
//! Publishing is at-most-once. A failed send is returned to the caller and
//! never retried here; the offline queue owns retries.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::MonotonicClock;
use crate::error::{BroadcastError, HandlerError, ValidationError};
use crate::protocol::{Envelope, EventKind, EventPayload, Operation};
use crate::subscription::{lock, Subscription};
use crate::transport::Transport;

/// A decoded remote event.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub payload: EventPayload,
}

type Handler = Arc<dyn Fn(&Delivery) -> Result<(), HandlerError> + Send + Sync>;
type HandlerKey = (String, EventKind);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcasterStats {
    pub published: u64,
    pub publish_failures: u64,
    pub delivered: u64,
    pub echoes_dropped: u64,
    pub malformed_dropped: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct AtomicStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    delivered: AtomicU64,
    echoes_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
    handler_failures: AtomicU64,
}

/// Handler table and dispatch logic, shared with the pump tasks.
struct Dispatcher {
    actor_id: String,
    clock: Arc<MonotonicClock>,
    next_id: AtomicU64,
    handlers: Mutex<HashMap<HandlerKey, BTreeMap<u64, Handler>>>,
    stats: AtomicStats,
}

impl Dispatcher {
    fn dispatch(&self, bytes: &[u8]) -> usize {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed frame: {e}");
                return 0;
            }
        };
        if envelope.actor_id == self.actor_id {
            self.stats.echoes_dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Dropping {} from {} on board {}: {e}",
                    envelope.kind,
                    envelope.actor_id,
                    envelope.board_id
                );
                return 0;
            }
        };
        self.clock.observe(envelope.timestamp);

        let key = (envelope.board_id.clone(), envelope.kind);
        let handlers: Vec<Handler> = lock(&self.handlers)
            .get(&key)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            return 0;
        }

        let delivery = Delivery { envelope, payload };
        if delivery.envelope.kind == EventKind::CursorMove || delivery.envelope.kind == EventKind::Awareness {
            log::trace!("Dispatching {} to {} handlers", delivery.envelope.kind, handlers.len());
        } else {
            log::debug!(
                "Dispatching {} {} from {} to {} handlers",
                delivery.envelope.kind,
                delivery.envelope.id,
                delivery.envelope.actor_id,
                handlers.len()
            );
        }

        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&delivery))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("Handler for {} failed: {e}", delivery.envelope.kind);
                }
                Err(_) => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("Handler for {} panicked", delivery.envelope.kind);
                }
            }
        }
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        handlers.len()
    }
}

struct BoardPump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct OperationBroadcaster {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    pumps: Mutex<HashMap<String, BoardPump>>,
}

impl OperationBroadcaster {
    /// `actor_id` identifies this client on every published envelope; frames
    /// carrying it are treated as echoes.
    pub fn new(transport: Arc<dyn Transport>, actor_id: impl Into<String>, clock: Arc<MonotonicClock>) -> Self {
        Self {
            transport,
            dispatcher: Arc::new(Dispatcher {
                actor_id: actor_id.into(),
                clock,
                next_id: AtomicU64::new(0),
                handlers: Mutex::new(HashMap::new()),
                stats: AtomicStats::default(),
            }),
            pumps: Mutex::new(HashMap::new()),
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.dispatcher.actor_id
    }

    pub fn clock(&self) -> &Arc<MonotonicClock> {
        &self.dispatcher.clock
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    // ───────────────────────────────────────────────────────────────
    // Publishing
    // ───────────────────────────────────────────────────────────────

    /// Publish an event as the local actor.
    pub async fn publish(
        &self,
        board_id: &str,
        kind: EventKind,
        payload: &EventPayload,
    ) -> Result<Envelope, BroadcastError> {
        let actor_id = self.dispatcher.actor_id.clone();
        self.publish_as(&actor_id, board_id, kind, payload).await
    }

    /// Publish on behalf of an already-authorized actor.
    pub async fn publish_as(
        &self,
        actor_id: &str,
        board_id: &str,
        kind: EventKind,
        payload: &EventPayload,
    ) -> Result<Envelope, BroadcastError> {
        if board_id.trim().is_empty() {
            return Err(ValidationError::missing("boardId").into());
        }
        if actor_id.trim().is_empty() {
            return Err(ValidationError::missing("actorId").into());
        }
        let envelope = match payload.as_operation() {
            Some(op) => {
                op.validate()?;
                Envelope::for_operation(op)?
            }
            None => Envelope::new(
                Uuid::new_v4().to_string(),
                board_id,
                kind,
                actor_id,
                self.dispatcher.clock.tick(),
                payload,
            )?,
        };
        if envelope.kind != kind || envelope.board_id != board_id {
            return Err(ValidationError::new("operation", "does not match board or event kind").into());
        }
        self.publish_envelope(&envelope).await?;
        Ok(envelope)
    }

    /// Publish a durable operation under the kind derived from it.
    pub async fn publish_operation(&self, op: &Operation) -> Result<(), BroadcastError> {
        op.validate()?;
        let envelope = Envelope::for_operation(op)?;
        self.publish_envelope(&envelope).await
    }

    async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), BroadcastError> {
        let frame = Arc::new(envelope.encode()?);
        let stats = &self.dispatcher.stats;
        match self.transport.send(&envelope.board_id, frame).await {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("Publish of {} {} failed: {e}", envelope.kind, envelope.id);
                Err(e.into())
            }
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Receiving
    // ───────────────────────────────────────────────────────────────

    /// Start dispatching frames of `board_id` to handlers. Idempotent.
    pub async fn join_board(&self, board_id: &str) -> Result<(), BroadcastError> {
        if lock(&self.pumps).contains_key(board_id) {
            return Ok(());
        }
        let mut rx = self.transport.subscribe(board_id).await?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let dispatcher = self.dispatcher.clone();
        let board = board_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(frame) => {
                        dispatcher.dispatch(&frame);
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Board {board} receiver lagged by {n} frames");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            log::debug!("Pump for board {board} stopped");
        });

        let mut pumps = lock(&self.pumps);
        if pumps.contains_key(board_id) {
            cancel.cancel();
        } else {
            pumps.insert(board_id.to_string(), BoardPump { cancel, task });
            log::info!("Joined board {board_id} as {}", self.dispatcher.actor_id);
        }
        Ok(())
    }

    /// Stop dispatching for `board_id`. Idempotent.
    pub async fn leave_board(&self, board_id: &str) {
        let pump = lock(&self.pumps).remove(board_id);
        if let Some(pump) = pump {
            pump.cancel.cancel();
            let _ = pump.task.await;
            self.transport.unsubscribe(board_id).await;
            log::info!("Left board {board_id}");
        }
    }

    pub fn joined_boards(&self) -> Vec<String> {
        lock(&self.pumps).keys().cloned().collect()
    }

    /// Register a handler for one event kind on one board.
    pub fn subscribe(
        &self,
        board_id: &str,
        kind: EventKind,
        handler: impl Fn(&Delivery) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.dispatcher.next_id.fetch_add(1, Ordering::Relaxed);
        let key: HandlerKey = (board_id.to_string(), kind);
        lock(&self.dispatcher.handlers)
            .entry(key.clone())
            .or_default()
            .insert(id, Arc::new(handler));

        let weak: Weak<Dispatcher> = Arc::downgrade(&self.dispatcher);
        Subscription::new(move || {
            if let Some(dispatcher) = weak.upgrade() {
                let mut handlers = lock(&dispatcher.handlers);
                if let Some(table) = handlers.get_mut(&key) {
                    table.remove(&id);
                    if table.is_empty() {
                        handlers.remove(&key);
                    }
                }
            }
        })
    }

    pub fn handler_count(&self, board_id: &str, kind: EventKind) -> usize {
        lock(&self.dispatcher.handlers)
            .get(&(board_id.to_string(), kind))
            .map_or(0, BTreeMap::len)
    }

    /// Decode and dispatch one raw frame. Returns the number of handlers run.
    pub fn dispatch_frame(&self, bytes: &[u8]) -> usize {
        self.dispatcher.dispatch(bytes)
    }

    pub fn stats(&self) -> BroadcasterStats {
        let stats = &self.dispatcher.stats;
        BroadcasterStats {
            published: stats.published.load(Ordering::Relaxed),
            publish_failures: stats.publish_failures.load(Ordering::Relaxed),
            delivered: stats.delivered.load(Ordering::Relaxed),
            echoes_dropped: stats.echoes_dropped.load(Ordering::Relaxed),
            malformed_dropped: stats.malformed_dropped.load(Ordering::Relaxed),
            handler_failures: stats.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop every board pump.
    pub async fn shutdown(&self) {
        let boards = self.joined_boards();
        for board in boards {
            self.leave_board(&board).await;
        }
    }
}

impl Drop for OperationBroadcaster {
    fn drop(&mut self) {
        for pump in lock(&self.pumps).values() {
            pump.cancel.cancel();
        }
    }
}
