//! Awareness protocol: ephemeral cursor, presence, soft-lock and selection
//! state, kept apart from durable board content.
//!
//! - [`state`]: snapshot types
//! - [`store`]: per-session store with listeners and derived views
//! - [`sync`]: outbound publisher, heartbeat, GC and inbound wiring

pub mod state;
pub mod store;
pub mod sync;

pub use state::{
    AwarenessState, AwarenessUpdate, BoundingBox, CursorColor, CursorPatch, CursorState,
    EditingState, PresencePatch, PresenceState, PresenceStatus, SelectionState, UserIdentity,
};
pub use store::{AwarenessStore, ConnectionStats, EditingUser, RemoteCursor, RemotePresence};
pub use sync::AwarenessSync;
