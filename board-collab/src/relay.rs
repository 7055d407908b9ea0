//! WebSocket relay with board-based routing.
//!
//! ```text
//! Client A ──┐                          ┌──► Client A
//!             ├── Publish ── BoardChannel ├──► Client B
//! Client B ──┘   (board_id)   (fan-out)   └──► Client C
//! ```
//!
//! The relay holds no board state. It routes `Publish` frames to every
//! connection subscribed to the board (the publisher included) as `Deliver`
//! frames, and answers `Ping` with `Pong` for latency sampling.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelRegistry;
use crate::protocol::RelayFrame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per board channel receiver.
    pub channel_capacity: usize,
    /// Frames buffered per connection before the socket writer.
    pub outbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_published: u64,
    pub bytes_received: u64,
    pub active_boards: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_published: AtomicU64,
    bytes_received: AtomicU64,
}

pub struct RelayServer {
    config: RelayConfig,
    channels: Arc<ChannelRegistry>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let channels = Arc::new(ChannelRegistry::new(config.channel_capacity));
        Self {
            config,
            channels,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Board relay listening on {}", listener.local_addr()?);
        self.serve(listener, CancellationToken::new()).await
    }

    /// Accept connections on `listener` until `cancel` fires.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Board relay shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            log::debug!("New TCP connection from {addr}");

            let channels = self.channels.clone();
            let stats = self.stats.clone();
            let outbound_capacity = self.config.outbound_capacity;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, channels, stats, outbound_capacity, cancel).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            active_boards: self.channels.board_count().await,
        }
    }
}

struct Forwarder {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Forwarder {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    channels: Arc<ChannelRegistry>,
    stats: Arc<AtomicRelayStats>,
    outbound_capacity: usize,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    stats.total_connections.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);

    // Single writer so forwarders and pong replies never interleave a send.
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(outbound_capacity.max(1));
    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut forwarders: HashMap<String, Forwarder> = HashMap::new();

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = ws_receiver.next() => msg,
        };
        match msg {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                stats.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                let frame = match RelayFrame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Failed to decode frame from {addr}: {e}");
                        continue;
                    }
                };

                match frame {
                    RelayFrame::Subscribe { board_id } => {
                        if forwarders.contains_key(&board_id) {
                            continue;
                        }
                        let channel = channels.get_or_create(&board_id).await;
                        let mut rx = channel.subscribe();
                        let cancel = CancellationToken::new();
                        let token = cancel.clone();
                        let out = out_tx.clone();
                        let board = board_id.clone();
                        let task = tokio::spawn(async move {
                            loop {
                                let received = tokio::select! {
                                    _ = token.cancelled() => break,
                                    received = rx.recv() => received,
                                };
                                match received {
                                    Ok(bytes) => {
                                        if out.send(bytes.as_ref().clone()).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(RecvError::Lagged(n)) => {
                                        log::warn!("Connection {addr} lagged by {n} frames on board {board}");
                                    }
                                    Err(RecvError::Closed) => break,
                                }
                            }
                        });
                        forwarders.insert(board_id.clone(), Forwarder { cancel, task });
                        log::info!("{addr} subscribed to board {board_id}");
                    }

                    RelayFrame::Unsubscribe { board_id } => {
                        if let Some(forwarder) = forwarders.remove(&board_id) {
                            forwarder.stop().await;
                            release(&channels, &board_id).await;
                            log::info!("{addr} unsubscribed from board {board_id}");
                        }
                    }

                    RelayFrame::Publish { board_id, envelope } => {
                        let deliver = RelayFrame::Deliver {
                            board_id: board_id.clone(),
                            envelope,
                        }
                        .encode()?;
                        let channel = channels.get_or_create(&board_id).await;
                        let delivered = channel.publish(Arc::new(deliver));
                        stats.frames_published.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Board {board_id}: frame from {addr} to {delivered} subscribers");
                    }

                    RelayFrame::Ping { sent_at } => {
                        let pong = RelayFrame::Pong { sent_at }.encode()?;
                        if out_tx.send(pong).await.is_err() {
                            break;
                        }
                    }

                    other => {
                        log::debug!("Ignoring client-bound frame from {addr}: {other:?}");
                    }
                }
            }

            Some(Ok(Message::Close(_))) | None => {
                log::info!("Connection closed from {addr}");
                break;
            }

            Some(Err(e)) => {
                log::error!("WebSocket error from {addr}: {e}");
                break;
            }

            _ => {}
        }
    }

    for (board_id, forwarder) in forwarders.drain() {
        forwarder.stop().await;
        release(&channels, &board_id).await;
    }
    drop(out_tx);
    let _ = writer.await;

    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    Ok(())
}

async fn release(channels: &ChannelRegistry, board_id: &str) {
    if let Some(channel) = channels.get(board_id).await {
        channel.release();
    }
    channels.remove_if_idle(board_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.channel_capacity, 256);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.stats().await, RelayStats::default());
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let relay = RelayServer::with_defaults();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        relay.serve(listener, cancel).await.unwrap();
    }
}
