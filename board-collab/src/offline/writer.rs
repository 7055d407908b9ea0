use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::manager::OfflineQueueManager;
use super::pending::PendingChange;
use crate::broadcaster::OperationBroadcaster;
use crate::error::CollabError;
use crate::protocol::{ElementType, Envelope, OpType, Operation};
use crate::replica::{ApplyOutcome, ReplicaSet};

/// How a committed operation left the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Published,
    Queued,
    /// Already committed earlier; nothing sent.
    Duplicate,
}

/// Single entry point for local durable mutations.
///
/// The local replica is updated first so the UI sees its own edit at once.
/// The operation is then published directly when online with an empty
/// queue. Otherwise it goes to the back of the offline queue, behind any
/// older changes, so per-client order is kept.
pub struct DurableWriter {
    broadcaster: Arc<OperationBroadcaster>,
    replicas: Arc<ReplicaSet>,
    queue: Arc<OfflineQueueManager>,
}

impl DurableWriter {
    pub fn new(
        broadcaster: Arc<OperationBroadcaster>,
        replicas: Arc<ReplicaSet>,
        queue: Arc<OfflineQueueManager>,
    ) -> Self {
        Self {
            broadcaster,
            replicas,
            queue,
        }
    }

    /// A new operation stamped with this client's actor id and clock.
    pub fn operation(
        &self,
        board_id: &str,
        op_type: OpType,
        element_type: ElementType,
        element_id: &str,
        payload: Option<Value>,
    ) -> Operation {
        Operation {
            id: Uuid::new_v4().to_string(),
            board_id: board_id.to_string(),
            actor_id: self.broadcaster.actor_id().to_string(),
            timestamp: self.broadcaster.clock().tick(),
            op_type,
            element_type,
            element_id: element_id.to_string(),
            payload,
        }
    }

    /// Apply `op` locally, then publish or queue it.
    ///
    /// An operation the broadcaster could never send is rejected before the
    /// replica sees it.
    pub async fn commit(&self, op: Operation) -> Result<CommitOutcome, CollabError> {
        op.validate()?;
        Envelope::for_operation(&op)?.encode()?;

        if self.replicas.apply(&op)? == ApplyOutcome::Duplicate {
            return Ok(CommitOutcome::Duplicate);
        }

        if self.queue.is_online() && self.queue.get_pending_changes_count() == 0 {
            match self.broadcaster.publish_operation(&op).await {
                Ok(()) => return Ok(CommitOutcome::Published),
                Err(e) if e.is_transient() => {
                    log::debug!("Publish of {} failed ({e}); queueing", op.id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.queue.add_pending_change(PendingChange::from_operation(&op))?;
        self.queue.request_sync();
        Ok(CommitOutcome::Queued)
    }

    pub fn queue(&self) -> &Arc<OfflineQueueManager> {
        &self.queue
    }

    pub fn replicas(&self) -> &Arc<ReplicaSet> {
        &self.replicas
    }
}
