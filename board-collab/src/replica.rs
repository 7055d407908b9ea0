//! Durable board state built from operations.
//!
//! Each element keeps the operation that currently wins for it (deletes are
//! kept as tombstones so a late, older update cannot resurrect the element).
//! Every applied operation id is remembered, so redelivery is a no-op, and
//! the winner is picked by the [`ConflictResolver`], so any delivery order of
//! the same operations ends in the same state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::broadcaster::OperationBroadcaster;
use crate::conflict::{ConflictResolver, Resolution};
use crate::error::ValidationError;
use crate::protocol::{EventKind, OpType, Operation};
use crate::subscription::{lock, ListenerSet, Subscription};

/// What applying one operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation id was seen before; nothing changed.
    Duplicate,
    /// The operation is now the element's current version.
    Applied,
    /// The element already holds a winning version.
    Superseded,
    /// A resolver override combined both versions.
    Merged,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(self, ApplyOutcome::Applied | ApplyOutcome::Merged)
    }
}

/// Serializable replica contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub board_id: String,
    pub elements: BTreeMap<String, Operation>,
    pub applied: BTreeSet<String>,
}

/// One board's durable state.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardReplica {
    board_id: String,
    elements: BTreeMap<String, Operation>,
    applied: BTreeSet<String>,
}

impl BoardReplica {
    pub fn new(board_id: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
            elements: BTreeMap::new(),
            applied: BTreeSet::new(),
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn apply(&mut self, op: &Operation, resolver: &ConflictResolver) -> ApplyOutcome {
        if !self.applied.insert(op.id.clone()) {
            return ApplyOutcome::Duplicate;
        }
        let Some(current) = self.elements.get(&op.element_id) else {
            self.elements.insert(op.element_id.clone(), op.clone());
            return ApplyOutcome::Applied;
        };
        match resolver.resolve(current, op) {
            Resolution::KeepLocal => ApplyOutcome::Superseded,
            Resolution::KeepRemote => {
                self.elements.insert(op.element_id.clone(), op.clone());
                ApplyOutcome::Applied
            }
            Resolution::Merged(merged) => {
                self.applied.insert(merged.id.clone());
                self.elements.insert(op.element_id.clone(), merged);
                ApplyOutcome::Merged
            }
        }
    }

    /// Current winning operation for an element, tombstones included.
    pub fn get(&self, element_id: &str) -> Option<&Operation> {
        self.elements.get(element_id)
    }

    /// Payload of a live (not deleted) element.
    pub fn element(&self, element_id: &str) -> Option<&Value> {
        self.elements
            .get(element_id)
            .filter(|op| op.op_type != OpType::Delete)
            .and_then(|op| op.payload.as_ref())
    }

    /// Every live element's payload.
    pub fn live_elements(&self) -> BTreeMap<String, Value> {
        self.elements
            .iter()
            .filter(|(_, op)| op.op_type != OpType::Delete)
            .filter_map(|(id, op)| op.payload.clone().map(|payload| (id.clone(), payload)))
            .collect()
    }

    pub fn has_applied(&self, op_id: &str) -> bool {
        self.applied.contains(op_id)
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            board_id: self.board_id.clone(),
            elements: self.elements.clone(),
            applied: self.applied.clone(),
        }
    }

    pub fn from_snapshot(snapshot: BoardSnapshot) -> Self {
        Self {
            board_id: snapshot.board_id,
            elements: snapshot.elements,
            applied: snapshot.applied,
        }
    }
}

/// Notification for a changed element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementChange {
    pub board_id: String,
    pub element_id: String,
    /// The element's new current version.
    pub operation: Operation,
    pub outcome: ApplyOutcome,
}

/// Replicas for every board of a session, sharing one resolver.
pub struct ReplicaSet {
    resolver: Arc<ConflictResolver>,
    boards: Mutex<HashMap<String, BoardReplica>>,
    listeners: ListenerSet<ElementChange>,
}

impl ReplicaSet {
    pub fn new(resolver: Arc<ConflictResolver>) -> Self {
        Self {
            resolver,
            boards: Mutex::new(HashMap::new()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Apply an operation to its board's replica.
    pub fn apply(&self, op: &Operation) -> Result<ApplyOutcome, ValidationError> {
        op.validate()?;
        let (outcome, current) = {
            let mut boards = lock(&self.boards);
            let replica = boards
                .entry(op.board_id.clone())
                .or_insert_with(|| BoardReplica::new(op.board_id.clone()));
            let outcome = replica.apply(op, &self.resolver);
            (outcome, replica.get(&op.element_id).cloned())
        };

        log::trace!("Operation {} on {}: {outcome:?}", op.id, op.element_id);
        if let (true, Some(operation)) = (outcome.changed(), current) {
            self.listeners.emit(&ElementChange {
                board_id: op.board_id.clone(),
                element_id: op.element_id.clone(),
                operation,
                outcome,
            });
        }
        Ok(outcome)
    }

    pub fn current(&self, board_id: &str, element_id: &str) -> Option<Operation> {
        lock(&self.boards)
            .get(board_id)
            .and_then(|replica| replica.get(element_id).cloned())
    }

    pub fn element(&self, board_id: &str, element_id: &str) -> Option<Value> {
        lock(&self.boards)
            .get(board_id)
            .and_then(|replica| replica.element(element_id).cloned())
    }

    pub fn live_elements(&self, board_id: &str) -> BTreeMap<String, Value> {
        lock(&self.boards)
            .get(board_id)
            .map(BoardReplica::live_elements)
            .unwrap_or_default()
    }

    pub fn has_applied(&self, board_id: &str, op_id: &str) -> bool {
        lock(&self.boards)
            .get(board_id)
            .is_some_and(|replica| replica.has_applied(op_id))
    }

    pub fn snapshot(&self, board_id: &str) -> Option<BoardSnapshot> {
        lock(&self.boards).get(board_id).map(BoardReplica::snapshot)
    }

    /// Replace a board's replica with a stored snapshot.
    pub fn restore(&self, snapshot: BoardSnapshot) {
        log::debug!(
            "Restoring board {} with {} elements",
            snapshot.board_id,
            snapshot.elements.len()
        );
        let board_id = snapshot.board_id.clone();
        lock(&self.boards).insert(board_id, BoardReplica::from_snapshot(snapshot));
    }

    pub fn boards(&self) -> Vec<String> {
        lock(&self.boards).keys().cloned().collect()
    }

    /// Called after an element's current version changes.
    pub fn on_element_change(&self, listener: impl Fn(&ElementChange) + Send + Sync + 'static) -> Subscription {
        self.listeners.add(listener)
    }

    /// Apply every remote durable event of `board_id`.
    pub fn attach(self: &Arc<Self>, broadcaster: &OperationBroadcaster, board_id: &str) -> Vec<Subscription> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| kind.is_durable())
            .map(|kind| {
                let replicas = self.clone();
                broadcaster.subscribe(board_id, kind, move |delivery| {
                    if let Some(op) = delivery.payload.as_operation() {
                        replicas.apply(op)?;
                    }
                    Ok(())
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("boards", &lock(&self.boards).len())
            .finish()
    }
}
