//! Awareness store for one board session.
//!
//! Holds the local client's snapshot and the latest snapshot of every remote
//! client. All mutations are synchronous; outbound snapshots are handed to the
//! publisher through a `watch` channel, so a burst of local changes collapses
//! into the most recent snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::state::{
    AwarenessState, AwarenessUpdate, BoundingBox, CursorColor, CursorPatch, EditingState,
    PresencePatch, PresenceStatus, SelectionState, UserIdentity,
};
use crate::clock::now_millis;
use crate::error::ValidationError;
use crate::quality::{ConnectionQuality, QualityMonitor};
use crate::subscription::{lock, ListenerSet, Subscription};

/// Rendering view of a remote cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub client_id: String,
    pub user_id: String,
    pub user_name: String,
    pub color: CursorColor,
    pub x: f64,
    pub y: f64,
    pub is_active: bool,
    pub current_tool: String,
    pub is_drawing: bool,
    pub is_selecting: bool,
    pub active_element_id: Option<String>,
    pub pressure: Option<f32>,
}

impl RemoteCursor {
    fn from_state(state: &AwarenessState) -> Self {
        Self {
            client_id: state.client_id.clone(),
            user_id: state.user.user_id.clone(),
            user_name: state.user.name.clone(),
            color: state.user.color,
            x: state.cursor.x,
            y: state.cursor.y,
            is_active: state.presence.status != PresenceStatus::Offline,
            current_tool: state.cursor.current_tool.clone(),
            is_drawing: state.cursor.is_drawing,
            is_selecting: state.cursor.is_selecting,
            active_element_id: state.cursor.active_element_id.clone(),
            pressure: state.cursor.pressure,
        }
    }
}

/// Presence view of a remote client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePresence {
    pub client_id: String,
    pub user_id: String,
    pub user_name: String,
    pub status: PresenceStatus,
    pub last_seen: u64,
    pub current_activity: Option<String>,
    pub selection: SelectionState,
}

impl RemotePresence {
    fn from_state(state: &AwarenessState) -> Self {
        Self {
            client_id: state.client_id.clone(),
            user_id: state.user.user_id.clone(),
            user_name: state.user.name.clone(),
            status: state.presence.status,
            last_seen: state.presence.last_seen,
            current_activity: state.presence.current_activity.clone(),
            selection: state.selection.clone(),
        }
    }
}

/// Holder of a soft lock, as shown next to the element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditingUser {
    pub client_id: String,
    pub user_id: String,
    pub user_name: String,
    pub color: CursorColor,
    pub element_type: String,
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Distinct users present, the local user included.
    pub connected_users: usize,
    pub local_client_id: String,
    /// Known clients, the local client included.
    pub total_clients: usize,
    pub quality: ConnectionQuality,
    pub latency_ms: Option<u64>,
}

struct RemoteEntry {
    clock: u64,
    state: AwarenessState,
    received_at: Instant,
}

struct StoreInner {
    clock: u64,
    local: AwarenessState,
    remotes: HashMap<String, RemoteEntry>,
}

impl StoreInner {
    fn bump(&mut self) -> AwarenessUpdate {
        self.clock += 1;
        self.local.presence.last_seen = now_millis();
        AwarenessUpdate {
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    fn cursors(&self) -> Vec<RemoteCursor> {
        let mut cursors: Vec<RemoteCursor> = self
            .remotes
            .values()
            .map(|e| RemoteCursor::from_state(&e.state))
            .collect();
        cursors.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        cursors
    }

    fn presence(&self) -> Vec<RemotePresence> {
        let mut presence: Vec<RemotePresence> = self
            .remotes
            .values()
            .map(|e| RemotePresence::from_state(&e.state))
            .collect();
        presence.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        presence
    }
}

/// A client reusing its id after a restart counts its clock from 1 again.
/// Its snapshots then carry a lower clock but a later `last_seen` than the
/// entry left by the previous session. A reordered snapshot from one session
/// never does.
fn rejoined(existing: &RemoteEntry, update: &AwarenessUpdate) -> bool {
    update.clock < existing.clock && update.state.presence.last_seen > existing.state.presence.last_seen
}

/// Which listener groups a change affects.
#[derive(Debug, Default, Clone, Copy)]
struct Changed {
    cursors: bool,
    presence: bool,
}

pub struct AwarenessStore {
    client_id: String,
    timeout: Duration,
    inner: Mutex<StoreInner>,
    outbound: watch::Sender<AwarenessUpdate>,
    cursor_listeners: ListenerSet<Vec<RemoteCursor>>,
    presence_listeners: ListenerSet<Vec<RemotePresence>>,
    quality: Arc<QualityMonitor>,
}

impl AwarenessStore {
    pub fn new(
        client_id: impl Into<String>,
        user: UserIdentity,
        timeout: Duration,
        quality: Arc<QualityMonitor>,
    ) -> Self {
        let client_id = client_id.into();
        let local = AwarenessState::new(client_id.clone(), user, now_millis());
        let initial = AwarenessUpdate {
            clock: 0,
            state: local.clone(),
        };
        let (outbound, _) = watch::channel(initial);
        Self {
            client_id,
            timeout,
            inner: Mutex::new(StoreInner {
                clock: 0,
                local,
                remotes: HashMap::new(),
            }),
            outbound,
            cursor_listeners: ListenerSet::new(),
            presence_listeners: ListenerSet::new(),
            quality,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // ───────────────────────────────────────────────────────────────
    // Local state
    // ───────────────────────────────────────────────────────────────

    /// Apply `mutate` to a copy of the local snapshot; commit and schedule a
    /// broadcast only if the result validates.
    fn mutate_local(
        &self,
        mutate: impl FnOnce(&mut AwarenessState),
    ) -> Result<(), ValidationError> {
        let update = {
            let mut inner = lock(&self.inner);
            let mut next = inner.local.clone();
            mutate(&mut next);
            next.validate()?;
            inner.local = next;
            inner.bump()
        };
        log::trace!("Local awareness clock {}", update.clock);
        self.outbound.send_replace(update);
        Ok(())
    }

    pub fn update_cursor(&self, patch: CursorPatch) -> Result<(), ValidationError> {
        self.mutate_local(|state| patch.apply(&mut state.cursor))
    }

    pub fn update_presence(&self, patch: PresencePatch) -> Result<(), ValidationError> {
        self.mutate_local(|state| {
            if let Some(status) = patch.status {
                state.presence.status = status;
            }
            if let Some(activity) = patch.current_activity {
                state.presence.current_activity = activity;
            }
        })
    }

    /// Declare a soft lock on one element. Replaces any previous lock.
    pub fn set_editing_state(
        &self,
        element_id: impl Into<String>,
        element_type: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let editing = EditingState {
            element_id: element_id.into(),
            element_type: element_type.into(),
            start_time: now_millis(),
        };
        self.mutate_local(|state| state.editing = Some(editing))
    }

    pub fn clear_editing_state(&self) -> Result<(), ValidationError> {
        self.mutate_local(|state| state.editing = None)
    }

    pub fn update_selection(
        &self,
        element_ids: impl IntoIterator<Item = String>,
        bounding_box: Option<BoundingBox>,
    ) -> Result<(), ValidationError> {
        let selection = SelectionState {
            element_ids: element_ids.into_iter().collect::<BTreeSet<_>>(),
            bounding_box,
        };
        self.mutate_local(|state| state.selection = selection)
    }

    /// Re-stamp the local snapshot so peers refresh our entry.
    pub fn heartbeat(&self) -> AwarenessUpdate {
        let update = lock(&self.inner).bump();
        self.outbound.send_replace(update.clone());
        update
    }

    pub fn local_state(&self) -> AwarenessState {
        lock(&self.inner).local.clone()
    }

    /// The most recent snapshot scheduled for broadcast.
    pub fn local_snapshot(&self) -> AwarenessUpdate {
        self.outbound.borrow().clone()
    }

    /// Receiver of scheduled snapshots; only the latest is retained.
    pub fn outbound(&self) -> watch::Receiver<AwarenessUpdate> {
        self.outbound.subscribe()
    }

    // ───────────────────────────────────────────────────────────────
    // Remote state
    // ───────────────────────────────────────────────────────────────

    /// Merge a remote snapshot. Returns whether it was accepted.
    ///
    /// The entry for the sender is replaced wholesale. Malformed snapshots,
    /// our own echoes, and snapshots not newer than the stored one are dropped.
    pub fn apply_remote(&self, update: AwarenessUpdate) -> bool {
        if let Err(e) = update.state.validate() {
            log::warn!("Dropping malformed awareness snapshot: {e}");
            return false;
        }
        let client_id = update.state.client_id.clone();
        if client_id == self.client_id {
            return false;
        }

        let (changed, cursors, presence) = {
            let mut inner = lock(&self.inner);
            let changed = match inner.remotes.get(&client_id) {
                Some(existing) if rejoined(existing, &update) => {
                    log::debug!(
                        "Client {client_id} rejoined; clock reset {} -> {}",
                        existing.clock,
                        update.clock
                    );
                    Changed {
                        cursors: true,
                        presence: true,
                    }
                }
                Some(existing) if update.clock <= existing.clock => {
                    log::trace!(
                        "Stale awareness from {client_id}: clock {} <= {}",
                        update.clock,
                        existing.clock
                    );
                    return false;
                }
                Some(existing) => Changed {
                    cursors: existing.state.cursor != update.state.cursor
                        || existing.state.user != update.state.user
                        || existing.state.presence.status != update.state.presence.status,
                    presence: existing.state.presence != update.state.presence
                        || existing.state.user != update.state.user
                        || existing.state.selection != update.state.selection,
                },
                None => {
                    log::debug!("Client {client_id} ({}) appeared", update.state.user.name);
                    Changed {
                        cursors: true,
                        presence: true,
                    }
                }
            };
            inner.remotes.insert(
                client_id,
                RemoteEntry {
                    clock: update.clock,
                    state: update.state,
                    received_at: Instant::now(),
                },
            );
            (changed, inner.cursors(), inner.presence())
        };

        self.notify(changed, cursors, presence);
        true
    }

    /// Forget a client that announced it is leaving.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let removed = {
            let mut inner = lock(&self.inner);
            inner
                .remotes
                .remove(client_id)
                .map(|_| (inner.cursors(), inner.presence()))
        };
        match removed {
            Some((cursors, presence)) => {
                log::debug!("Client {client_id} left");
                self.notify(
                    Changed {
                        cursors: true,
                        presence: true,
                    },
                    cursors,
                    presence,
                );
                true
            }
            None => false,
        }
    }

    /// Drop entries not refreshed within the timeout. Listeners fire once per
    /// sweep, however many entries expired.
    pub fn sweep_stale(&self) -> Vec<String> {
        let (expired, cursors, presence) = {
            let mut inner = lock(&self.inner);
            let timeout = self.timeout;
            let expired: Vec<String> = inner
                .remotes
                .iter()
                .filter(|(_, e)| e.received_at.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                inner.remotes.remove(id);
            }
            (expired, inner.cursors(), inner.presence())
        };

        if !expired.is_empty() {
            log::info!("Expired {} awareness entries: {:?}", expired.len(), expired);
            self.notify(
                Changed {
                    cursors: true,
                    presence: true,
                },
                cursors,
                presence,
            );
        }
        expired
    }

    fn notify(&self, changed: Changed, cursors: Vec<RemoteCursor>, presence: Vec<RemotePresence>) {
        if changed.cursors {
            self.cursor_listeners.emit(&cursors);
        }
        if changed.presence {
            self.presence_listeners.emit(&presence);
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Queries and listeners
    // ───────────────────────────────────────────────────────────────

    pub fn on_cursors_change(
        &self,
        listener: impl Fn(&Vec<RemoteCursor>) + Send + Sync + 'static,
    ) -> Subscription {
        self.cursor_listeners.add(listener)
    }

    pub fn on_presence_change(
        &self,
        listener: impl Fn(&Vec<RemotePresence>) + Send + Sync + 'static,
    ) -> Subscription {
        self.presence_listeners.add(listener)
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        lock(&self.inner).cursors()
    }

    pub fn remote_presence(&self) -> Vec<RemotePresence> {
        lock(&self.inner).presence()
    }

    pub fn remote_state(&self, client_id: &str) -> Option<AwarenessState> {
        lock(&self.inner)
            .remotes
            .get(client_id)
            .map(|e| e.state.clone())
    }

    /// Element id → lock holder, the local client included. When several
    /// clients claim one element the earliest claim is reported.
    pub fn get_editing_users(&self) -> HashMap<String, EditingUser> {
        let inner = lock(&self.inner);
        let mut editing: HashMap<String, EditingUser> = HashMap::new();
        let states = std::iter::once(&inner.local).chain(inner.remotes.values().map(|e| &e.state));
        for state in states {
            let Some(claim) = &state.editing else { continue };
            let candidate = EditingUser {
                client_id: state.client_id.clone(),
                user_id: state.user.user_id.clone(),
                user_name: state.user.name.clone(),
                color: state.user.color,
                element_type: claim.element_type.clone(),
                start_time: claim.start_time,
            };
            let earlier_claim_exists = editing.get(&claim.element_id).is_some_and(|current| {
                (current.start_time, &current.client_id) <= (candidate.start_time, &candidate.client_id)
            });
            if !earlier_claim_exists {
                editing.insert(claim.element_id.clone(), candidate);
            }
        }
        editing
    }

    /// Derived stats; no I/O.
    pub fn get_connection_stats(&self) -> ConnectionStats {
        let inner = lock(&self.inner);
        let mut users: HashSet<&str> = HashSet::new();
        users.insert(inner.local.user.user_id.as_str());
        for entry in inner.remotes.values() {
            if entry.state.presence.status != PresenceStatus::Offline {
                users.insert(entry.state.user.user_id.as_str());
            }
        }
        ConnectionStats {
            connected_users: users.len(),
            local_client_id: self.client_id.clone(),
            total_clients: inner.remotes.len() + 1,
            quality: self.quality.quality(),
            latency_ms: self.quality.latency_ms(),
        }
    }
}
