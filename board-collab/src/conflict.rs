//! Conflict resolution between two versions of the same element.
//!
//! The default policy is last-writer-wins on `(timestamp, actor_id, id)`.
//! Timestamps decide; the actor and operation ids only break exact ties, so
//! the outcome never depends on which side is called "local".
//!
//! Per-element overrides replace the default for one element id. An override
//! must itself be symmetric for replicas to converge.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::protocol::{OpType, Operation};

/// Outcome of resolving `local` against `remote`.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// A new operation combining both sides.
    Merged(Operation),
}

pub type ResolverFn = Arc<dyn Fn(&Operation, &Operation) -> Resolution + Send + Sync>;

/// Total order used by last-writer-wins.
pub fn compare(a: &Operation, b: &Operation) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.actor_id.cmp(&b.actor_id))
        .then_with(|| a.id.cmp(&b.id))
}

/// Default policy: the greater `(timestamp, actor_id, id)` wins.
pub fn last_writer_wins(local: &Operation, remote: &Operation) -> Resolution {
    match compare(local, remote) {
        Ordering::Less => Resolution::KeepRemote,
        _ => Resolution::KeepLocal,
    }
}

/// Field-level merge for object payloads: fields of the newer side win,
/// fields only the older side wrote survive.
///
/// Falls back to last-writer-wins when either side is a delete or a payload
/// is not a JSON object.
pub fn merge_objects(local: &Operation, remote: &Operation) -> Resolution {
    let (older, newer) = match compare(local, remote) {
        Ordering::Less => (local, remote),
        Ordering::Greater => (remote, local),
        Ordering::Equal => return Resolution::KeepLocal,
    };
    if older.op_type == OpType::Delete || newer.op_type == OpType::Delete {
        return last_writer_wins(local, remote);
    }
    let (Some(Value::Object(base)), Some(Value::Object(overlay))) = (&older.payload, &newer.payload) else {
        return last_writer_wins(local, remote);
    };

    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    if &merged == overlay {
        return last_writer_wins(local, remote);
    }

    Resolution::Merged(Operation {
        id: format!("merge:{}:{}", older.id, newer.id),
        payload: Some(Value::Object(merged)),
        ..newer.clone()
    })
}

/// Whether `op` is a merge that folded in the operation `id`.
pub fn is_merge_of(op: &Operation, id: &str) -> bool {
    op.id
        .strip_prefix("merge:")
        .is_some_and(|rest| rest.split(':').any(|part| part == id))
}

/// Decides which of two competing operations on one element survives.
#[derive(Default)]
pub struct ConflictResolver {
    overrides: RwLock<HashMap<String, ResolverFn>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve two operations on the same element.
    pub fn resolve(&self, local: &Operation, remote: &Operation) -> Resolution {
        if local.id == remote.id {
            return Resolution::KeepLocal;
        }
        let custom = self
            .overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&local.element_id)
            .cloned();
        match custom {
            Some(resolver) => resolver(local, remote),
            None => last_writer_wins(local, remote),
        }
    }

    /// The operation that should stand after resolving `local` and `remote`.
    pub fn winner(&self, local: &Operation, remote: &Operation) -> Operation {
        match self.resolve(local, remote) {
            Resolution::KeepLocal => local.clone(),
            Resolution::KeepRemote => remote.clone(),
            Resolution::Merged(op) => op,
        }
    }

    /// Install a resolver for one element, replacing any previous one.
    pub fn register(
        &self,
        element_id: impl Into<String>,
        resolver: impl Fn(&Operation, &Operation) -> Resolution + Send + Sync + 'static,
    ) {
        let element_id = element_id.into();
        log::debug!("Registered conflict override for element {element_id}");
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(element_id, Arc::new(resolver));
    }

    pub fn unregister(&self, element_id: &str) -> bool {
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(element_id)
            .is_some()
    }

    pub fn has_override(&self, element_id: &str) -> bool {
        self.overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(element_id)
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.overrides.read().map(|o| o.len()).unwrap_or_default();
        f.debug_struct("ConflictResolver").field("overrides", &count).finish()
    }
}
