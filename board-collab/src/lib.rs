//! # board-collab: Real-time synchronization engine for shared boards
//!
//! Keeps every participant's view of a board consistent under concurrent
//! edits, dropped connections and redelivery, while keeping ephemeral
//! awareness state apart from durable board content.
//!
//! ## Architecture
//!
//! ```text
//!  UI action
//!      │
//!      ▼
//! ┌──────────────────────┐  ephemeral   ┌────────────────┐
//! │ CollaborationSelector│ ───────────► │ AwarenessStore │──┐
//! │ (Legacy | Awareness) │              └────────────────┘  │
//! └──────────┬───────────┘                                  │
//!            │ durable                                      │
//!            ▼                                              ▼
//! ┌──────────────────────┐  offline  ┌──────────────┐  ┌─────────────────────┐
//! │ DurableWriter        │ ────────► │ OfflineQueue │─►│ OperationBroadcaster│
//! │ (replica first)      │ ──────────┴──────────────┴─►│ (board channel)     │
//! └──────────┬───────────┘  online                     └──────────┬──────────┘
//!            │                                                    │ Transport
//!            ▼                                                    ▼
//! ┌──────────────────────┐                             ┌─────────────────────┐
//! │ ReplicaSet +         │ ◄─────── remote ops ─────── │ LocalHub / WsTransport
//! │ ConflictResolver     │                             │ ⇄ board-relay       │
//! └──────────────────────┘                             └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: event taxonomy, operations, wire frames
//! - [`broadcaster`]: publish/subscribe per board and event kind
//! - [`awareness`]: cursor, presence, soft locks, selection
//! - [`conflict`] / [`replica`]: deterministic, idempotent durable state
//! - [`offline`]: persisted FIFO queue and reconnect drain
//! - [`storage`]: RocksDB local store
//! - [`selector`]: one collaboration API over two backends
//! - [`transport`] / [`relay`]: in-process and WebSocket channels
//! - [`session`]: wires a full client session together

pub mod awareness;
pub mod broadcaster;
pub mod channel;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod ingress;
pub mod offline;
pub mod protocol;
pub mod quality;
pub mod relay;
pub mod replica;
pub mod selector;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    AwarenessState, AwarenessStore, AwarenessSync, AwarenessUpdate, ConnectionStats, CursorPatch, EditingUser,
    PresencePatch, PresenceStatus, RemoteCursor, RemotePresence, UserIdentity,
};
pub use broadcaster::{BroadcasterStats, Delivery, OperationBroadcaster};
pub use clock::MonotonicClock;
pub use config::{AwarenessConfig, CollabConfig, OfflineConfig, ReconnectConfig};
pub use conflict::{ConflictResolver, Resolution};
pub use error::{
    BroadcastError, CollabError, HandlerError, ProtocolError, StoreError, TransportError, ValidationError,
};
pub use ingress::{IngressGateway, IngressRequest};
pub use offline::{CommitOutcome, DurableWriter, OfflineQueueManager, PendingChange, SyncReport, SyncState};
pub use protocol::{ElementType, Envelope, EventKind, EventPayload, OpType, Operation};
pub use quality::{ConnectionQuality, QualityMonitor};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use replica::{ApplyOutcome, BoardReplica, BoardSnapshot, ReplicaSet};
pub use selector::{BackendKind, CollabBackend, CollaborationApi, CollaborationSelector};
pub use session::{CollabSession, SessionOptions};
pub use storage::{LocalStore, StoreConfig};
pub use subscription::Subscription;
pub use transport::{LocalHub, LocalTransport, Transport, WsTransport};
