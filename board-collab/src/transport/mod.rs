//! Board channel transports.
//!
//! A [`Transport`] moves opaque encoded envelopes between clients of the same
//! board. Delivery is at-most-once with per-sender FIFO; a sender also
//! receives its own frames and is expected to filter them.

mod backoff;
mod local;
mod ws;

pub use backoff::Backoff;
pub use local::{LocalHub, LocalTransport};
pub use ws::WsTransport;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::error::TransportError;

pub type Frame = Arc<Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish one encoded envelope. Resolves once the transport has accepted
    /// the frame; an error means it was not sent.
    async fn send(&self, board_id: &str, frame: Frame) -> Result<(), TransportError>;

    /// Start receiving frames for a board. Subscribing twice to the same
    /// board returns another receiver on the same stream.
    async fn subscribe(&self, board_id: &str) -> Result<broadcast::Receiver<Frame>, TransportError>;

    /// Stop receiving frames for a board; open receivers see the stream close.
    async fn unsubscribe(&self, board_id: &str);

    fn is_connected(&self) -> bool;

    /// Connectivity signal; `true` while the link is usable.
    fn connection_status(&self) -> watch::Receiver<bool>;
}
