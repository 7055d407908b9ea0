//! Error taxonomy for the collaboration engine.
//!
//! Boundary errors ([`ValidationError`], authorization failures) are raised
//! before anything reaches shared state. Internal failures
//! ([`BroadcastError`], [`StoreError`]) are reported per call and never
//! poison the awareness store or the offline queue.
//!
//! Conflicts and connection loss are not errors: the former is resolved by
//! [`crate::conflict::ConflictResolver`], the latter is a state transition of
//! [`crate::offline::SyncState`].

use thiserror::Error;

/// Malformed event payload. Rejected at the boundary, never published.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid field `{field}`: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    /// Shorthand for a required field that is missing or empty.
    pub fn missing(field: &'static str) -> Self {
        Self::new(field, "required field is missing or empty")
    }
}

/// Wire codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("payload does not match event kind {0}")]
    PayloadMismatch(&'static str),
}

/// Failures of the underlying channel transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport closed")]
    Closed,
}

/// Transient publish failure, surfaced to the caller as recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl BroadcastError {
    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BroadcastError::Transport(_))
    }
}

/// Local durable store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Top-level error returned across the engine's public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("authenticated user `{authenticated}` cannot act as `{claimed}`")]
    Authorization {
        authenticated: String,
        claimed: String,
    },
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Error type returned by subscription handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::missing("boardId");
        assert!(err.to_string().contains("boardId"));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_broadcast_error_transient() {
        let err = BroadcastError::from(TransportError::Disconnected);
        assert!(err.is_transient());

        let err = BroadcastError::from(ValidationError::missing("x"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_collab_error_wraps_broadcast() {
        let err: CollabError = BroadcastError::from(TransportError::Closed).into();
        assert!(matches!(err, CollabError::Broadcast(_)));
        assert_eq!(err.to_string(), "transport closed");
    }

    #[test]
    fn test_authorization_display() {
        let err = CollabError::Authorization {
            authenticated: "alice".into(),
            claimed: "bob".into(),
        };
        assert!(err.to_string().contains("alice"));
        assert!(err.to_string().contains("bob"));
    }
}
