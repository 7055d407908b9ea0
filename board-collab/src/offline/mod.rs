//! Offline buffering and reconciliation of durable changes.
//!
//! - [`pending`]: queued change model and the sync state machine
//! - [`manager`]: persisted FIFO queue and the drain loop
//! - [`writer`]: publish-or-queue path for local mutations

pub mod manager;
pub mod pending;
pub mod writer;

pub use manager::OfflineQueueManager;
pub use pending::{PendingChange, SyncReport, SyncState};
pub use writer::{CommitOutcome, DurableWriter};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::OperationBroadcaster;
    use crate::clock::MonotonicClock;
    use crate::config::OfflineConfig;
    use crate::conflict::{merge_objects, ConflictResolver};
    use crate::error::CollabError;
    use crate::protocol::{ElementType, OpType, Operation};
    use crate::replica::ReplicaSet;
    use crate::storage::{LocalStore, StoreConfig};
    use crate::transport::{LocalHub, Transport};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        transport: Arc<crate::transport::LocalTransport>,
        replicas: Arc<ReplicaSet>,
        queue: Arc<OfflineQueueManager>,
        writer: DurableWriter,
    }

    fn fixture(max_queue_len: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let hub = LocalHub::new(16);
        let transport = Arc::new(hub.endpoint());
        let broadcaster = Arc::new(OperationBroadcaster::new(
            transport.clone(),
            "alice",
            Arc::new(MonotonicClock::new()),
        ));
        let replicas = Arc::new(ReplicaSet::new(Arc::new(ConflictResolver::new())));
        let config = OfflineConfig {
            max_queue_len,
            sync_interval_ms: 60_000,
            ..OfflineConfig::default()
        };
        let queue = Arc::new(
            OfflineQueueManager::open(store, broadcaster.clone(), replicas.clone(), config, transport.connection_status())
                .unwrap(),
        );
        let writer = DurableWriter::new(broadcaster, replicas.clone(), queue.clone());
        Fixture {
            _dir: dir,
            transport,
            replicas,
            queue,
            writer,
        }
    }

    fn remote_op(id: &str, timestamp: u64, payload: serde_json::Value) -> Operation {
        Operation {
            id: id.into(),
            board_id: "board-1".into(),
            actor_id: "bob".into(),
            timestamp,
            op_type: OpType::Update,
            element_type: ElementType::Shape,
            element_id: "e1".into(),
            payload: Some(payload),
        }
    }

    #[tokio::test]
    async fn test_commit_online_publishes() {
        let f = fixture(10);
        let op = f.writer.operation("board-1", OpType::Create, ElementType::Shape, "e1", Some(json!({"w": 1})));
        assert_eq!(f.writer.commit(op.clone()).await.unwrap(), CommitOutcome::Published);
        assert_eq!(f.writer.commit(op).await.unwrap(), CommitOutcome::Duplicate);
        assert_eq!(f.queue.get_pending_changes_count(), 0);
        assert_eq!(f.queue.sync_state(), SyncState::OnlineIdle);
    }

    #[tokio::test]
    async fn test_rejected_commit_leaves_no_trace() {
        let f = fixture(10);
        let invalid = f.writer.operation("board-1", OpType::Update, ElementType::Shape, "e1", None);
        let err = f.writer.commit(invalid.clone()).await.unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));

        assert!(f.replicas.current("board-1", "e1").is_none());
        assert!(!f.replicas.has_applied("board-1", &invalid.id));
        assert_eq!(f.queue.get_pending_changes_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_offline_queues_and_drains() {
        let f = fixture(10);
        f.transport.disconnect();
        assert!(!f.queue.is_online());

        let op = f.writer.operation("board-1", OpType::Create, ElementType::Text, "t1", Some(json!({"text": "hi"})));
        assert_eq!(f.writer.commit(op).await.unwrap(), CommitOutcome::Queued);
        assert_eq!(f.queue.get_pending_changes_count(), 1);
        assert_eq!(f.queue.sync_state(), SyncState::OfflineBuffering);
        assert_eq!(f.replicas.element("board-1", "t1"), Some(json!({"text": "hi"})));

        // Offline drain is a no-op.
        let report = f.queue.sync_pending_changes().await.unwrap();
        assert_eq!(report.remaining, 1);

        f.transport.reconnect();
        let report = f.queue.sync_pending_changes().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(f.queue.get_pending_changes_count(), 0);
        assert_eq!(f.queue.sync_state(), SyncState::OnlineIdle);
        assert!(f.queue.get_last_sync_timestamp().is_some());
    }

    #[tokio::test]
    async fn test_forced_offline_overrides_network() {
        let f = fixture(10);
        assert!(f.queue.is_online());
        f.queue.set_forced_offline(true);
        assert!(!f.queue.is_online());
        assert_eq!(f.queue.sync_state(), SyncState::OfflineBuffering);
        f.queue.set_forced_offline(false);
        assert!(f.queue.is_online());
    }

    #[tokio::test]
    async fn test_eviction_drops_oldest() {
        let f = fixture(2);
        f.transport.disconnect();
        for i in 0..3 {
            let op = f.writer.operation("board-1", OpType::Update, ElementType::Shape, "e1", Some(json!({"i": i})));
            f.writer.commit(op).await.unwrap();
        }
        let queued: Vec<_> = f.queue.pending_changes().into_iter().map(|c| c.data).collect();
        assert_eq!(queued, vec![Some(json!({"i": 1})), Some(json!({"i": 2}))]);
        assert_eq!(f.queue.evicted_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_winner_supersedes_queued_change() {
        let f = fixture(10);
        f.transport.disconnect();
        let mut op = f.writer.operation("board-1", OpType::Update, ElementType::Shape, "e1", Some(json!({"v": "local"})));
        op.timestamp = 100;
        f.writer.commit(op).await.unwrap();

        f.replicas.apply(&remote_op("remote", 200, json!({"v": "remote"}))).unwrap();

        f.transport.reconnect();
        let report = f.queue.sync_pending_changes().await.unwrap();
        assert_eq!(report.superseded, 1);
        assert_eq!(report.published, 0);
        assert_eq!(f.queue.get_pending_changes_count(), 0);
        assert_eq!(f.replicas.element("board-1", "e1"), Some(json!({"v": "remote"})));
    }

    #[tokio::test]
    async fn test_override_merges_queued_change() {
        let f = fixture(10);
        f.replicas.resolver().register("e1", merge_objects);
        f.transport.disconnect();
        let mut op = f.writer.operation("board-1", OpType::Update, ElementType::Shape, "e1", Some(json!({"a": 1})));
        op.timestamp = 100;
        f.writer.commit(op).await.unwrap();

        // Remote arrives after the local edit and merges into the replica.
        f.replicas.apply(&remote_op("remote", 200, json!({"b": 2}))).unwrap();

        f.transport.reconnect();
        let report = f.queue.sync_pending_changes().await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(f.replicas.element("board-1", "e1"), Some(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_pending_change_requires_element() {
        let change = PendingChange {
            id: "c1".into(),
            board_id: "board-1".into(),
            op_type: OpType::Create,
            element_type: ElementType::Text,
            element_id: None,
            data: Some(json!({})),
            timestamp: 1,
            user_id: "alice".into(),
        };
        assert!(change.to_operation().is_err());
    }
}
