//! Per-board fan-out channels.
//!
//! One tokio broadcast channel per board. A publish is a single `send` of an
//! `Arc` over pre-encoded bytes; each subscriber owns an independent receiver
//! that buffers up to `capacity` frames before it starts lagging.
//!
//! The sender is included in the fan-out; echo filtering is the receiver's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_unheard: u64,
    pub subscribers: usize,
}

/// Lock-free counters; read through [`BoardChannel::stats`].
#[derive(Default)]
struct AtomicChannelStats {
    frames_sent: AtomicU64,
    frames_unheard: AtomicU64,
}

/// A broadcast channel for a single board.
pub struct BoardChannel {
    board_id: String,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    subscribers: AtomicUsize,
    stats: AtomicChannelStats,
}

impl BoardChannel {
    pub fn new(board_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            board_id: board_id.into(),
            sender,
            capacity,
            subscribers: AtomicUsize::new(0),
            stats: AtomicChannelStats::default(),
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Fan out pre-encoded bytes. Returns how many receivers got the frame.
    pub fn publish(&self, frame: Arc<Vec<u8>>) -> usize {
        let delivered = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        if delivered == 0 {
            self.stats.frames_unheard.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
        self.sender.subscribe()
    }

    /// Bookkeeping counterpart of [`BoardChannel::subscribe`] for callers that track
    /// membership explicitly (the relay does).
    pub fn release(&self) {
        let _ = self
            .subscribers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Live receivers on the underlying channel.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_unheard: self.stats.frames_unheard.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
        }
    }
}

/// Board id → channel. Channels are created on first use.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<BoardChannel>>>,
    capacity: usize,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get_or_create(&self, board_id: &str) -> Arc<BoardChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(board_id) {
                return channel.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Another task may have created it between the two locks.
        if let Some(channel) = channels.get(board_id) {
            return channel.clone();
        }
        let channel = Arc::new(BoardChannel::new(board_id, self.capacity));
        channels.insert(board_id.to_string(), channel.clone());
        log::debug!("Created channel for board {board_id}");
        channel
    }

    pub async fn get(&self, board_id: &str) -> Option<Arc<BoardChannel>> {
        self.channels.read().await.get(board_id).cloned()
    }

    /// Drop a channel nobody listens to any more.
    pub async fn remove_if_idle(&self, board_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        let idle = channels
            .get(board_id)
            .is_some_and(|c| c.receiver_count() == 0);
        if idle {
            channels.remove(board_id);
            log::debug!("Removed idle channel for board {board_id}");
        }
        idle
    }

    pub async fn board_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_includes_sender() {
        let channel = BoardChannel::new("b1", 16);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();
        let mut rx3 = channel.subscribe();

        let count = channel.publish(Arc::new(vec![1, 2, 3]));
        assert_eq!(count, 3);

        assert_eq!(*rx1.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx2.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx3.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_per_sender_fifo() {
        let channel = BoardChannel::new("b1", 16);
        let mut rx = channel.subscribe();
        for i in 0..10u8 {
            channel.publish(Arc::new(vec![i]));
        }
        for i in 0..10u8 {
            assert_eq!(*rx.recv().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_stats() {
        let channel = BoardChannel::new("b1", 16);
        channel.publish(Arc::new(vec![0]));
        let _rx = channel.subscribe();
        channel.publish(Arc::new(vec![1]));

        let stats = channel.stats();
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_unheard, 1);
        assert_eq!(stats.subscribers, 1);

        channel.release();
        channel.release();
        assert_eq!(channel.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let channel = BoardChannel::new("b1", 2);
        let mut rx = channel.subscribe();
        for i in 0..5u8 {
            channel.publish(Arc::new(vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_get_or_create() {
        let registry = ChannelRegistry::new(16);
        let a = registry.get_or_create("board").await;
        let b = registry.get_or_create("board").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.board_count().await, 1);

        registry.get_or_create("other").await;
        let mut boards = registry.active_boards().await;
        boards.sort();
        assert_eq!(boards, vec!["board".to_string(), "other".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_remove_if_idle() {
        let registry = ChannelRegistry::new(16);
        let channel = registry.get_or_create("board").await;
        let rx = channel.subscribe();

        assert!(!registry.remove_if_idle("board").await);
        drop(rx);
        assert!(registry.remove_if_idle("board").await);
        assert!(registry.get("board").await.is_none());
    }
}
