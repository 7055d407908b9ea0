use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::protocol::{ElementType, OpType, Operation};

/// A durable mutation waiting to be published. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Id of the operation this change becomes.
    pub id: String,
    pub board_id: String,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub element_type: ElementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: u64,
    pub user_id: String,
}

impl PendingChange {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            board_id: op.board_id.clone(),
            op_type: op.op_type,
            element_type: op.element_type,
            element_id: Some(op.element_id.clone()),
            data: op.payload.clone(),
            timestamp: op.timestamp,
            user_id: op.actor_id.clone(),
        }
    }

    /// The operation published for this change.
    pub fn to_operation(&self) -> Result<Operation, ValidationError> {
        let element_id = self
            .element_id
            .clone()
            .ok_or(ValidationError::missing("elementId"))?;
        let op = Operation {
            id: self.id.clone(),
            board_id: self.board_id.clone(),
            actor_id: self.user_id.clone(),
            timestamp: self.timestamp,
            op_type: self.op_type,
            element_type: self.element_type,
            element_id,
            payload: self.data.clone(),
        };
        op.validate()?;
        Ok(op)
    }
}

/// Offline queue state machine.
///
/// ```text
/// OnlineIdle ──network drops──► OfflineBuffering ──network back──► Draining
///     ▲                               ▲                               │
///     └────────── queue empty ────────┼──────── publish failure ──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    OnlineIdle,
    OfflineBuffering,
    Draining,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Changes published as-is.
    pub published: usize,
    /// Changes dropped because a newer remote version already won.
    pub superseded: usize,
    /// Changes published as a merge with the remote version.
    pub merged: usize,
    /// Changes dropped because they can never be published.
    pub rejected: usize,
    /// Changes still queued when the pass ended.
    pub remaining: usize,
}

impl SyncReport {
    pub fn reconciled(&self) -> usize {
        self.published + self.superseded + self.merged
    }
}
