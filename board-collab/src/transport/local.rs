use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::{Frame, Transport};
use crate::channel::{ChannelRegistry, ChannelStats};
use crate::error::TransportError;
use crate::subscription::lock;

/// In-process board bus shared by any number of [`LocalTransport`] endpoints.
pub struct LocalHub {
    channels: ChannelRegistry,
    capacity: usize,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: ChannelRegistry::new(capacity),
            capacity,
        })
    }

    /// A new, connected endpoint on this hub.
    pub fn endpoint(self: &Arc<Self>) -> LocalTransport {
        let (status, _) = watch::channel(true);
        LocalTransport {
            hub: self.clone(),
            status,
            taps: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn stats(&self, board_id: &str) -> Option<ChannelStats> {
        self.channels.get(board_id).await.map(|c| c.stats())
    }
}

struct BoardTap {
    sender: broadcast::Sender<Frame>,
    cancel: CancellationToken,
}

/// One client's view of a [`LocalHub`]. Connectivity can be toggled to
/// simulate network loss: while disconnected, sends fail and inbound frames
/// are dropped.
pub struct LocalTransport {
    hub: Arc<LocalHub>,
    status: watch::Sender<bool>,
    taps: Mutex<HashMap<String, BoardTap>>,
    cancel: CancellationToken,
}

impl LocalTransport {
    pub fn set_connected(&self, connected: bool) {
        let previous = self.status.send_replace(connected);
        if previous != connected {
            log::info!("Local transport {}", if connected { "connected" } else { "disconnected" });
        }
    }

    pub fn disconnect(&self) {
        self.set_connected(false);
    }

    pub fn reconnect(&self) {
        self.set_connected(true);
    }

    fn spawn_tap(&self, board_id: &str, mut upstream: broadcast::Receiver<Frame>) -> BoardTap {
        let (sender, _) = broadcast::channel(self.hub.capacity.max(1));
        let cancel = self.cancel.child_token();
        let tx = sender.clone();
        let token = cancel.clone();
        let status = self.status.subscribe();
        let board = board_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = upstream.recv() => match msg {
                        Ok(frame) => {
                            if *status.borrow() {
                                let _ = tx.send(frame);
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Local tap for board {board} lagged by {n} frames");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });

        BoardTap { sender, cancel }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, board_id: &str, frame: Frame) -> Result<(), TransportError> {
        if !*self.status.borrow() {
            return Err(TransportError::Disconnected);
        }
        let channel = self.hub.channels.get_or_create(board_id).await;
        channel.publish(frame);
        Ok(())
    }

    async fn subscribe(&self, board_id: &str) -> Result<broadcast::Receiver<Frame>, TransportError> {
        if let Some(tap) = lock(&self.taps).get(board_id) {
            return Ok(tap.sender.subscribe());
        }

        let channel = self.hub.channels.get_or_create(board_id).await;
        let upstream = channel.subscribe();

        let mut taps = lock(&self.taps);
        if let Some(tap) = taps.get(board_id) {
            return Ok(tap.sender.subscribe());
        }
        let tap = self.spawn_tap(board_id, upstream);
        let receiver = tap.sender.subscribe();
        taps.insert(board_id.to_string(), tap);
        Ok(receiver)
    }

    async fn unsubscribe(&self, board_id: &str) {
        if let Some(tap) = lock(&self.taps).remove(board_id) {
            tap.cancel.cancel();
        }
    }

    fn is_connected(&self) -> bool {
        *self.status.borrow()
    }

    fn connection_status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
