//! Collaboration backend selection.
//!
//! ```text
//!                      ┌──────────────► LegacyBackend ── raw board events
//! CollaborationSelector┤
//!   (one per session)  └──────────────► AwarenessBackend ── AwarenessStore
//!                                              │                + AwarenessSync
//!        both ── durable mutations ── DurableWriter ── replica / queue / publish
//! ```
//!
//! Callers see one [`CollaborationApi`] whichever backend is live. Durable
//! mutations take the same path in both backends; only ephemeral state is
//! carried differently. Calls the awareness model has no use for (stroke
//! previews, raw text-edit events) succeed without doing anything.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::awareness::{
    AwarenessStore, AwarenessSync, BoundingBox, ConnectionStats, CursorPatch, CursorState, PresencePatch,
    PresenceState, PresenceStatus, UserIdentity,
};
use crate::broadcaster::OperationBroadcaster;
use crate::clock::now_millis;
use crate::config::AwarenessConfig;
use crate::error::{CollabError, ProtocolError, TransportError, ValidationError};
use crate::offline::DurableWriter;
use crate::protocol::{
    CursorMove, DrawingEvent, DrawingLine, ElementType, EventKind, EventPayload, OpType, TextEditEvent,
};
use crate::quality::QualityMonitor;
use crate::subscription::{lock, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Legacy,
    Awareness,
}

/// The collaboration surface used by the rest of the application.
#[async_trait]
pub trait CollaborationApi: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn board_id(&self) -> &str;

    async fn broadcast_cursor(&self, cursor: CursorPatch) -> Result<(), CollabError>;

    async fn start_drawing(&self, line: &DrawingLine) -> Result<(), CollabError>;

    async fn update_drawing(&self, line: &DrawingLine) -> Result<(), CollabError>;

    /// Persist a finished stroke.
    async fn complete_drawing(&self, line: &DrawingLine) -> Result<(), CollabError>;

    async fn update_element(&self, element_id: &str, element: Value) -> Result<(), CollabError>;

    async fn delete_element(&self, element_id: &str) -> Result<(), CollabError>;

    async fn create_text(&self, element_id: &str, text: Value) -> Result<(), CollabError>;

    async fn update_text(&self, element_id: &str, text: Value) -> Result<(), CollabError>;

    async fn delete_text(&self, element_id: &str) -> Result<(), CollabError>;

    async fn start_text_edit(&self, element_id: &str) -> Result<(), CollabError>;

    async fn finish_text_edit(&self, element_id: &str) -> Result<(), CollabError>;

    async fn create_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError>;

    async fn update_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError>;

    async fn delete_shape(&self, element_id: &str) -> Result<(), CollabError>;

    async fn transform_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError>;

    async fn update_presence(&self, patch: PresencePatch) -> Result<(), CollabError>;

    async fn update_selection(
        &self,
        element_ids: Vec<String>,
        bounding_box: Option<BoundingBox>,
    ) -> Result<(), CollabError>;

    async fn set_editing_element(&self, element_id: &str, element_type: &str) -> Result<(), CollabError>;

    async fn clear_editing_element(&self) -> Result<(), CollabError>;

    fn connection_stats(&self) -> ConnectionStats;
}

/// Everything a backend needs; shared by every backend of a session.
#[derive(Clone)]
pub struct BackendContext {
    pub board_id: String,
    pub user: UserIdentity,
    pub broadcaster: Arc<OperationBroadcaster>,
    pub writer: Arc<DurableWriter>,
    pub quality: Arc<QualityMonitor>,
    pub awareness: AwarenessConfig,
}

impl BackendContext {
    async fn commit(
        &self,
        op_type: OpType,
        element_type: ElementType,
        element_id: &str,
        payload: Option<Value>,
    ) -> Result<(), CollabError> {
        if element_id.trim().is_empty() {
            return Err(ValidationError::missing("elementId").into());
        }
        let op = self
            .writer
            .operation(&self.board_id, op_type, element_type, element_id, payload);
        let outcome = self.writer.commit(op).await?;
        log::debug!("{} {element_id} on board {}: {outcome:?}", element_type.as_str(), self.board_id);
        Ok(())
    }

    async fn commit_line(&self, line: &DrawingLine) -> Result<(), CollabError> {
        line.validate()?;
        let payload = serde_json::to_value(line).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.commit(OpType::Create, ElementType::Line, &line.id, Some(payload))
            .await
    }
}

// ───────────────────────────────────────────────────────────────────
// Legacy backend
// ───────────────────────────────────────────────────────────────────

/// Direct broadcast of every board event.
pub struct LegacyBackend {
    ctx: BackendContext,
    cursor: Mutex<CursorState>,
    presence: Mutex<PresenceState>,
    editing: Mutex<Option<String>>,
    /// Remote actor → last time any event was seen from it.
    peers: Arc<Mutex<HashMap<String, u64>>>,
    subscriptions: Vec<Subscription>,
}

impl LegacyBackend {
    pub fn start(ctx: BackendContext) -> Self {
        let peers: Arc<Mutex<HashMap<String, u64>>> = Arc::default();
        let subscriptions = [EventKind::CursorMove, EventKind::PresenceUpdate, EventKind::UserJoined]
            .into_iter()
            .map(|kind| {
                let peers = peers.clone();
                ctx.broadcaster.subscribe(&ctx.board_id, kind, move |delivery| {
                    let mut peers = lock(&*peers);
                    match &delivery.payload {
                        EventPayload::Presence(presence) if presence.status == PresenceStatus::Offline => {
                            peers.remove(&delivery.envelope.actor_id);
                        }
                        _ => {
                            peers.insert(delivery.envelope.actor_id.clone(), now_millis());
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        log::debug!("Legacy backend started for board {}", ctx.board_id);

        Self {
            cursor: Mutex::new(CursorState::default()),
            presence: Mutex::new(PresenceState::online(now_millis())),
            editing: Mutex::new(None),
            peers,
            subscriptions,
            ctx,
        }
    }

    async fn publish(&self, kind: EventKind, payload: EventPayload) -> Result<(), CollabError> {
        self.ctx
            .broadcaster
            .publish(&self.ctx.board_id, kind, &payload)
            .await?;
        Ok(())
    }

    async fn publish_stroke(&self, kind: EventKind, line: &DrawingLine) -> Result<(), CollabError> {
        line.validate()?;
        let event = DrawingEvent {
            user_name: self.ctx.user.name.clone(),
            line: line.clone(),
        };
        self.publish(kind, EventPayload::Drawing(event)).await
    }

    async fn publish_text_edit(&self, kind: EventKind, element_id: &str) -> Result<(), CollabError> {
        if element_id.trim().is_empty() {
            return Err(ValidationError::missing("elementId").into());
        }
        let event = TextEditEvent {
            user_name: self.ctx.user.name.clone(),
            element_id: element_id.to_string(),
        };
        self.publish(kind, EventPayload::TextEdit(event)).await
    }

    async fn stop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        log::debug!("Legacy backend stopped for board {}", self.ctx.board_id);
    }
}

#[async_trait]
impl CollaborationApi for LegacyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn board_id(&self) -> &str {
        &self.ctx.board_id
    }

    async fn broadcast_cursor(&self, cursor: CursorPatch) -> Result<(), CollabError> {
        let event = {
            let mut current = lock(&self.cursor);
            let mut next = current.clone();
            cursor.apply(&mut next);
            if !next.x.is_finite() || !next.y.is_finite() {
                return Err(ValidationError::new("cursor", "coordinates must be finite").into());
            }
            *current = next.clone();
            CursorMove {
                x: next.x,
                y: next.y,
                tool: Some(next.current_tool),
            }
        };
        self.publish(EventKind::CursorMove, EventPayload::Cursor(event)).await
    }

    async fn start_drawing(&self, line: &DrawingLine) -> Result<(), CollabError> {
        self.publish_stroke(EventKind::DrawingStart, line).await
    }

    async fn update_drawing(&self, line: &DrawingLine) -> Result<(), CollabError> {
        self.publish_stroke(EventKind::DrawingUpdate, line).await
    }

    async fn complete_drawing(&self, line: &DrawingLine) -> Result<(), CollabError> {
        self.ctx.commit_line(line).await
    }

    async fn update_element(&self, element_id: &str, element: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Update, ElementType::Element, element_id, Some(element))
            .await
    }

    async fn delete_element(&self, element_id: &str) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Delete, ElementType::Element, element_id, None)
            .await
    }

    async fn create_text(&self, element_id: &str, text: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Create, ElementType::Text, element_id, Some(text))
            .await
    }

    async fn update_text(&self, element_id: &str, text: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Update, ElementType::Text, element_id, Some(text))
            .await
    }

    async fn delete_text(&self, element_id: &str) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Delete, ElementType::Text, element_id, None)
            .await
    }

    async fn start_text_edit(&self, element_id: &str) -> Result<(), CollabError> {
        self.publish_text_edit(EventKind::TextEditStarted, element_id).await
    }

    async fn finish_text_edit(&self, element_id: &str) -> Result<(), CollabError> {
        self.publish_text_edit(EventKind::TextEditFinished, element_id).await
    }

    async fn create_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Create, ElementType::Shape, element_id, Some(shape))
            .await
    }

    async fn update_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Update, ElementType::Shape, element_id, Some(shape))
            .await
    }

    async fn delete_shape(&self, element_id: &str) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Delete, ElementType::Shape, element_id, None)
            .await
    }

    async fn transform_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Transform, ElementType::Shape, element_id, Some(shape))
            .await
    }

    async fn update_presence(&self, patch: PresencePatch) -> Result<(), CollabError> {
        let presence = {
            let mut presence = lock(&self.presence);
            if let Some(status) = patch.status {
                presence.status = status;
            }
            if let Some(activity) = patch.current_activity {
                presence.current_activity = activity;
            }
            presence.last_seen = now_millis();
            presence.clone()
        };
        self.publish(EventKind::PresenceUpdate, EventPayload::Presence(presence))
            .await
    }

    /// No selection event exists on the legacy channel.
    async fn update_selection(
        &self,
        _element_ids: Vec<String>,
        _bounding_box: Option<BoundingBox>,
    ) -> Result<(), CollabError> {
        Ok(())
    }

    async fn set_editing_element(&self, element_id: &str, _element_type: &str) -> Result<(), CollabError> {
        self.publish_text_edit(EventKind::TextEditStarted, element_id).await?;
        *lock(&self.editing) = Some(element_id.to_string());
        Ok(())
    }

    async fn clear_editing_element(&self) -> Result<(), CollabError> {
        let previous = lock(&self.editing).take();
        match previous {
            Some(element_id) => self.publish_text_edit(EventKind::TextEditFinished, &element_id).await,
            None => Ok(()),
        }
    }

    fn connection_stats(&self) -> ConnectionStats {
        let cutoff = now_millis().saturating_sub(self.ctx.awareness.timeout_ms);
        let mut peers = lock(&*self.peers);
        peers.retain(|_, seen| *seen >= cutoff);
        ConnectionStats {
            connected_users: peers.len() + 1,
            local_client_id: self.ctx.broadcaster.actor_id().to_string(),
            total_clients: peers.len() + 1,
            quality: self.ctx.quality.quality(),
            latency_ms: self.ctx.quality.latency_ms(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness backend
// ───────────────────────────────────────────────────────────────────

/// Ephemeral state through the awareness protocol.
pub struct AwarenessBackend {
    ctx: BackendContext,
    store: Arc<AwarenessStore>,
    sync: AwarenessSync,
}

impl AwarenessBackend {
    pub fn start(ctx: BackendContext) -> Self {
        let store = Arc::new(AwarenessStore::new(
            ctx.broadcaster.actor_id(),
            ctx.user.clone(),
            ctx.awareness.timeout(),
            ctx.quality.clone(),
        ));
        let sync = AwarenessSync::start(
            store.clone(),
            ctx.broadcaster.clone(),
            ctx.board_id.clone(),
            &ctx.awareness,
            ctx.quality.clone(),
        );
        log::debug!("Awareness backend started for board {}", ctx.board_id);
        Self { ctx, store, sync }
    }

    pub fn store(&self) -> &Arc<AwarenessStore> {
        &self.store
    }

    async fn stop(&mut self) {
        self.sync.stop().await;
        log::debug!("Awareness backend stopped for board {}", self.ctx.board_id);
    }
}

#[async_trait]
impl CollaborationApi for AwarenessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Awareness
    }

    fn board_id(&self) -> &str {
        &self.ctx.board_id
    }

    async fn broadcast_cursor(&self, cursor: CursorPatch) -> Result<(), CollabError> {
        Ok(self.store.update_cursor(cursor)?)
    }

    async fn start_drawing(&self, _line: &DrawingLine) -> Result<(), CollabError> {
        Ok(())
    }

    async fn update_drawing(&self, _line: &DrawingLine) -> Result<(), CollabError> {
        Ok(())
    }

    async fn complete_drawing(&self, line: &DrawingLine) -> Result<(), CollabError> {
        self.ctx.commit_line(line).await
    }

    async fn update_element(&self, element_id: &str, element: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Update, ElementType::Element, element_id, Some(element))
            .await
    }

    async fn delete_element(&self, element_id: &str) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Delete, ElementType::Element, element_id, None)
            .await
    }

    async fn create_text(&self, element_id: &str, text: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Create, ElementType::Text, element_id, Some(text))
            .await
    }

    async fn update_text(&self, element_id: &str, text: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Update, ElementType::Text, element_id, Some(text))
            .await
    }

    async fn delete_text(&self, element_id: &str) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Delete, ElementType::Text, element_id, None)
            .await
    }

    async fn start_text_edit(&self, element_id: &str) -> Result<(), CollabError> {
        Ok(self.store.set_editing_state(element_id, ElementType::Text.as_str())?)
    }

    async fn finish_text_edit(&self, element_id: &str) -> Result<(), CollabError> {
        let holds_lock = self
            .store
            .local_state()
            .editing
            .is_some_and(|editing| editing.element_id == element_id);
        if holds_lock {
            self.store.clear_editing_state()?;
        }
        Ok(())
    }

    async fn create_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Create, ElementType::Shape, element_id, Some(shape))
            .await
    }

    async fn update_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Update, ElementType::Shape, element_id, Some(shape))
            .await
    }

    async fn delete_shape(&self, element_id: &str) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Delete, ElementType::Shape, element_id, None)
            .await
    }

    async fn transform_shape(&self, element_id: &str, shape: Value) -> Result<(), CollabError> {
        self.ctx
            .commit(OpType::Transform, ElementType::Shape, element_id, Some(shape))
            .await
    }

    async fn update_presence(&self, patch: PresencePatch) -> Result<(), CollabError> {
        Ok(self.store.update_presence(patch)?)
    }

    async fn update_selection(
        &self,
        element_ids: Vec<String>,
        bounding_box: Option<BoundingBox>,
    ) -> Result<(), CollabError> {
        Ok(self.store.update_selection(element_ids, bounding_box)?)
    }

    async fn set_editing_element(&self, element_id: &str, element_type: &str) -> Result<(), CollabError> {
        Ok(self.store.set_editing_state(element_id, element_type)?)
    }

    async fn clear_editing_element(&self) -> Result<(), CollabError> {
        Ok(self.store.clear_editing_state()?)
    }

    fn connection_stats(&self) -> ConnectionStats {
        self.store.get_connection_stats()
    }
}

// ───────────────────────────────────────────────────────────────────
// Selector
// ───────────────────────────────────────────────────────────────────

pub enum CollabBackend {
    Legacy(LegacyBackend),
    Awareness(AwarenessBackend),
}

impl CollabBackend {
    fn start(kind: BackendKind, ctx: BackendContext) -> Self {
        match kind {
            BackendKind::Legacy => CollabBackend::Legacy(LegacyBackend::start(ctx)),
            BackendKind::Awareness => CollabBackend::Awareness(AwarenessBackend::start(ctx)),
        }
    }

    async fn stop(&mut self) {
        match self {
            CollabBackend::Legacy(backend) => backend.stop().await,
            CollabBackend::Awareness(backend) => backend.stop().await,
        }
    }

    /// The awareness store, when the awareness backend is live.
    pub fn awareness_store(&self) -> Option<&Arc<AwarenessStore>> {
        match self {
            CollabBackend::Awareness(backend) => Some(backend.store()),
            CollabBackend::Legacy(_) => None,
        }
    }
}

impl Deref for CollabBackend {
    type Target = dyn CollaborationApi;

    fn deref(&self) -> &Self::Target {
        match self {
            CollabBackend::Legacy(backend) => backend,
            CollabBackend::Awareness(backend) => backend,
        }
    }
}

/// Owns the live backend of one session and swaps it on request.
pub struct CollaborationSelector {
    ctx: BackendContext,
    active: RwLock<Option<CollabBackend>>,
}

impl CollaborationSelector {
    pub fn new(ctx: BackendContext, kind: BackendKind) -> Self {
        log::info!("Collaboration backend for board {}: {kind:?}", ctx.board_id);
        let backend = CollabBackend::start(kind, ctx.clone());
        Self {
            ctx,
            active: RwLock::new(Some(backend)),
        }
    }

    /// The live backend. Hold the guard only for the duration of a call.
    pub async fn backend(&self) -> Result<RwLockReadGuard<'_, CollabBackend>, CollabError> {
        RwLockReadGuard::try_map(self.active.read().await, Option::as_ref)
            .map_err(|_| CollabError::Broadcast(TransportError::Closed.into()))
    }

    pub async fn kind(&self) -> Option<BackendKind> {
        self.active.read().await.as_ref().map(|backend| backend.kind())
    }

    /// Switch backends. Switching to the live kind does nothing and returns
    /// `false`. The old backend is fully torn down before the new one starts.
    pub async fn set_backend(&self, kind: BackendKind) -> bool {
        let mut active = self.active.write().await;
        if active.as_ref().is_some_and(|backend| backend.kind() == kind) {
            return false;
        }
        if let Some(mut old) = active.take() {
            old.stop().await;
        }
        log::info!("Switching board {} to {kind:?} backend", self.ctx.board_id);
        *active = Some(CollabBackend::start(kind, self.ctx.clone()));
        true
    }

    /// Tear down the live backend. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(mut backend) = self.active.write().await.take() {
            backend.stop().await;
        }
    }

    pub fn board_id(&self) -> &str {
        &self.ctx.board_id
    }
}
