//! WebSocket client transport.
//!
//! Connection lifecycle:
//! ```text
//!   connect ──► session ──► lost ──► backoff sleep ──► connect ...
//!                  │                      │
//!                  └──── cancel ──────────┴──► closed
//! ```
//!
//! One task owns the socket. Publishes are queued to it through an mpsc
//! channel and acknowledged once the socket write completes, so a caller
//! learns whether its frame actually left the process. Board subscriptions
//! survive reconnects: every session starts by re-sending `Subscribe` for
//! each known board.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{Backoff, Frame, Transport};
use crate::clock::now_millis;
use crate::config::{CollabConfig, ReconnectConfig};
use crate::error::TransportError;
use crate::protocol::RelayFrame;
use crate::quality::QualityMonitor;
use crate::subscription::lock;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Outgoing {
    bytes: Vec<u8>,
    ack: Option<oneshot::Sender<Result<(), TransportError>>>,
}

struct Shared {
    url: String,
    capacity: usize,
    status: watch::Sender<bool>,
    outbound: Mutex<Option<mpsc::Sender<Outgoing>>>,
    boards: Mutex<HashMap<String, broadcast::Sender<Frame>>>,
    quality: Arc<QualityMonitor>,
    cancel: CancellationToken,
}

/// Reconnecting WebSocket connection to a `board-relay`.
pub struct WsTransport {
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Start connecting in the background. Returns immediately; watch
    /// [`Transport::connection_status`] or call [`WsTransport::wait_connected`].
    pub fn connect(url: impl Into<String>, config: &CollabConfig, quality: Arc<QualityMonitor>) -> Self {
        let (status, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            url: url.into(),
            capacity: config.channel_capacity(),
            status,
            outbound: Mutex::new(None),
            boards: Mutex::new(HashMap::new()),
            quality,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run(shared.clone(), config.reconnect.clone()));
        Self { shared }
    }

    /// Wait until connected, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut status = self.shared.status.subscribe();
        tokio::time::timeout(timeout, status.wait_for(|connected| *connected))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Stop the connection loop, including any pending backoff sleep.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    fn enqueue_control(&self, frame: RelayFrame) {
        let Some(tx) = lock(&self.shared.outbound).clone() else {
            return;
        };
        match frame.encode() {
            Ok(bytes) => {
                if tx.try_send(Outgoing { bytes, ack: None }).is_err() {
                    log::warn!("Outbound queue full; control frame dropped");
                }
            }
            Err(e) => log::error!("Failed to encode control frame: {e}"),
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, board_id: &str, frame: Frame) -> Result<(), TransportError> {
        let tx = lock(&self.shared.outbound)
            .clone()
            .ok_or(TransportError::Disconnected)?;
        let bytes = RelayFrame::Publish {
            board_id: board_id.to_string(),
            envelope: frame.as_ref().clone(),
        }
        .encode()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Outgoing {
            bytes,
            ack: Some(ack_tx),
        })
        .await
        .map_err(|_| TransportError::Disconnected)?;

        // Dropped unacknowledged when the session ends first.
        ack_rx.await.map_err(|_| TransportError::Disconnected)?
    }

    async fn subscribe(&self, board_id: &str) -> Result<broadcast::Receiver<Frame>, TransportError> {
        if self.shared.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (receiver, is_new) = {
            let mut boards = lock(&self.shared.boards);
            match boards.get(board_id) {
                Some(sender) => (sender.subscribe(), false),
                None => {
                    let (sender, receiver) = broadcast::channel(self.shared.capacity);
                    boards.insert(board_id.to_string(), sender);
                    (receiver, true)
                }
            }
        };
        if is_new {
            self.enqueue_control(RelayFrame::Subscribe {
                board_id: board_id.to_string(),
            });
        }
        Ok(receiver)
    }

    async fn unsubscribe(&self, board_id: &str) {
        let removed = lock(&self.shared.boards).remove(board_id).is_some();
        if removed {
            self.enqueue_control(RelayFrame::Unsubscribe {
                board_id: board_id.to_string(),
            });
        }
    }

    fn is_connected(&self) -> bool {
        *self.shared.status.borrow()
    }

    fn connection_status(&self) -> watch::Receiver<bool> {
        self.shared.status.subscribe()
    }
}

async fn run(shared: Arc<Shared>, reconnect: ReconnectConfig) {
    let mut backoff = Backoff::new(&reconnect);
    let ping_interval = Duration::from_millis(reconnect.ping_interval_ms.max(1));

    loop {
        let attempt = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(shared.url.as_str()) => result,
        };

        match attempt {
            Ok((socket, _)) => {
                log::info!("Connected to relay {}", shared.url);
                backoff.reset();
                shared.run_session(socket, ping_interval).await;
                shared.set_disconnected();
                log::info!("Connection to relay {} lost", shared.url);
            }
            Err(e) => {
                log::warn!("Relay connection to {} failed: {e}", shared.url);
            }
        }

        if shared.cancel.is_cancelled() {
            break;
        }
        let Some(delay) = backoff.next_delay() else {
            log::error!("Giving up on relay {} after {} attempts", shared.url, backoff.attempts());
            break;
        };
        log::info!("Reconnecting in {}ms (attempt {})", delay.as_millis(), backoff.attempts());
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_disconnected();
    log::debug!("Relay loop for {} ended", shared.url);
}

impl Shared {
    fn set_disconnected(&self) {
        *lock(&self.outbound) = None;
        self.status.send_replace(false);
        self.quality.set_connected(false);
    }

    async fn run_session(&self, socket: Socket, ping_interval: Duration) {
        let (mut sink, mut source) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outgoing>(self.capacity);

        // Publishing the sender under the boards lock means any board added
        // afterwards is subscribed through the queue instead.
        let boards: Vec<String> = {
            let boards = lock(&self.boards);
            *lock(&self.outbound) = Some(tx);
            boards.keys().cloned().collect()
        };
        for board_id in boards {
            let frame = match (RelayFrame::Subscribe { board_id }).encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to encode subscribe frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Binary(frame.into())).await.is_err() {
                return;
            }
        }

        self.status.send_replace(true);
        self.quality.set_connected(true);

        let mut ping = tokio::time::interval(ping_interval);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }

                out = rx.recv() => {
                    let Some(out) = out else { break };
                    let result = sink
                        .send(Message::Binary(out.bytes.into()))
                        .await
                        .map_err(|e| TransportError::SendFailed(e.to_string()));
                    let failed = result.is_err();
                    if let Some(ack) = out.ack {
                        let _ = ack.send(result);
                    }
                    if failed {
                        break;
                    }
                }

                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        self.handle_frame(&bytes, &mut awaiting_pong);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from relay: {e}");
                        break;
                    }
                    _ => {}
                },

                _ = ping.tick() => {
                    if awaiting_pong {
                        self.quality.record_loss();
                    }
                    let Ok(bytes) = (RelayFrame::Ping { sent_at: now_millis() }).encode() else {
                        continue;
                    };
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                    awaiting_pong = true;
                }
            }
        }
    }

    fn handle_frame(&self, bytes: &[u8], awaiting_pong: &mut bool) {
        match RelayFrame::decode(bytes) {
            Ok(RelayFrame::Deliver { board_id, envelope }) => {
                if let Some(sender) = lock(&self.boards).get(&board_id) {
                    let _ = sender.send(Arc::new(envelope));
                }
            }
            Ok(RelayFrame::Pong { sent_at }) => {
                let rtt = now_millis().saturating_sub(sent_at);
                self.quality.record_rtt(Duration::from_millis(rtt));
                *awaiting_pong = false;
            }
            Ok(other) => log::debug!("Unexpected frame from relay: {other:?}"),
            Err(e) => log::warn!("Failed to decode relay frame: {e}"),
        }
    }
}
