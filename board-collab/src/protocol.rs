//! Event taxonomy and wire formats.
//!
//! Frame layout (bincode-encoded [`Envelope`]):
//! ```text
//! ┌──────────┬──────────┬──────┬──────────┬───────────┬──────────────┐
//! │ id       │ board_id │ kind │ actor_id │ timestamp │ payload      │
//! │ string   │ string   │ u8   │ string   │ u64       │ JSON bytes   │
//! └──────────┴──────────┴──────┴──────────┴───────────┴──────────────┘
//! ```
//!
//! The header is what routing, echo filtering and conflict resolution need;
//! the payload is JSON because element data is free-form.

use serde::{Deserialize, Serialize};

use crate::awareness::state::{AwarenessUpdate, PresenceState};
use crate::error::{ProtocolError, ValidationError};

/// Fixed event taxonomy for a board channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    CursorMove = 1,
    DrawingStart = 2,
    DrawingUpdate = 3,
    DrawingComplete = 4,
    ElementUpdated = 5,
    ElementDeleted = 6,
    TextCreated = 7,
    TextUpdated = 8,
    TextDeleted = 9,
    TextEditStarted = 10,
    TextEditFinished = 11,
    ShapeCreated = 12,
    ShapeUpdated = 13,
    ShapeDeleted = 14,
    ShapeTransformed = 15,
    UserJoined = 16,
    PresenceUpdate = 17,
    InvitationStatusChanged = 18,
    Awareness = 19,
    AwarenessLeave = 20,
}

impl EventKind {
    pub const ALL: [EventKind; 20] = [
        EventKind::CursorMove,
        EventKind::DrawingStart,
        EventKind::DrawingUpdate,
        EventKind::DrawingComplete,
        EventKind::ElementUpdated,
        EventKind::ElementDeleted,
        EventKind::TextCreated,
        EventKind::TextUpdated,
        EventKind::TextDeleted,
        EventKind::TextEditStarted,
        EventKind::TextEditFinished,
        EventKind::ShapeCreated,
        EventKind::ShapeUpdated,
        EventKind::ShapeDeleted,
        EventKind::ShapeTransformed,
        EventKind::UserJoined,
        EventKind::PresenceUpdate,
        EventKind::InvitationStatusChanged,
        EventKind::Awareness,
        EventKind::AwarenessLeave,
    ];

    /// Channel event name.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::CursorMove => "cursor-move",
            EventKind::DrawingStart => "drawing-start",
            EventKind::DrawingUpdate => "drawing-update",
            EventKind::DrawingComplete => "drawing-complete",
            EventKind::ElementUpdated => "element-updated",
            EventKind::ElementDeleted => "element-deleted",
            EventKind::TextCreated => "text-element-created",
            EventKind::TextUpdated => "text-element-updated",
            EventKind::TextDeleted => "text-element-deleted",
            EventKind::TextEditStarted => "text-element-edit-started",
            EventKind::TextEditFinished => "text-element-edit-finished",
            EventKind::ShapeCreated => "shape-element-created",
            EventKind::ShapeUpdated => "shape-element-updated",
            EventKind::ShapeDeleted => "shape-element-deleted",
            EventKind::ShapeTransformed => "shape-element-transformed",
            EventKind::UserJoined => "user-joined",
            EventKind::PresenceUpdate => "presence-update",
            EventKind::InvitationStatusChanged => "invitation-status-changed",
            EventKind::Awareness => "awareness-update",
            EventKind::AwarenessLeave => "awareness-leave",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Events that carry an [`Operation`] and mutate durable board content.
    pub fn is_durable(self) -> bool {
        matches!(
            self,
            EventKind::DrawingComplete
                | EventKind::ElementUpdated
                | EventKind::ElementDeleted
                | EventKind::TextCreated
                | EventKind::TextUpdated
                | EventKind::TextDeleted
                | EventKind::ShapeCreated
                | EventKind::ShapeUpdated
                | EventKind::ShapeDeleted
                | EventKind::ShapeTransformed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Create,
    Update,
    Delete,
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Element,
    Text,
    Shape,
    Line,
}

impl ElementType {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Element => "element",
            ElementType::Text => "text",
            ElementType::Shape => "shape",
            ElementType::Line => "line",
        }
    }
}

/// A durable, idempotent, uniquely identified mutation of board content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub board_id: String,
    pub actor_id: String,
    pub timestamp: u64,
    pub op_type: OpType,
    pub element_type: ElementType,
    pub element_id: String,
    /// Full element state after the mutation; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Operation {
    /// Event kind this operation is published under.
    pub fn event_kind(&self) -> EventKind {
        match (self.element_type, self.op_type) {
            (ElementType::Text, OpType::Create) => EventKind::TextCreated,
            (ElementType::Text, OpType::Update | OpType::Transform) => EventKind::TextUpdated,
            (ElementType::Text, OpType::Delete) => EventKind::TextDeleted,
            (ElementType::Shape, OpType::Create) => EventKind::ShapeCreated,
            (ElementType::Shape, OpType::Update) => EventKind::ShapeUpdated,
            (ElementType::Shape, OpType::Transform) => EventKind::ShapeTransformed,
            (ElementType::Shape, OpType::Delete) => EventKind::ShapeDeleted,
            (ElementType::Line, OpType::Create) => EventKind::DrawingComplete,
            (ElementType::Element | ElementType::Line, OpType::Delete) => EventKind::ElementDeleted,
            (ElementType::Element | ElementType::Line, _) => EventKind::ElementUpdated,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::missing("id"));
        }
        if self.board_id.trim().is_empty() {
            return Err(ValidationError::missing("boardId"));
        }
        if self.actor_id.trim().is_empty() {
            return Err(ValidationError::missing("actorId"));
        }
        if self.element_id.trim().is_empty() {
            return Err(ValidationError::missing("elementId"));
        }
        match (&self.op_type, &self.payload) {
            (OpType::Delete, _) => Ok(()),
            (_, None) | (_, Some(serde_json::Value::Null)) => Err(ValidationError::missing("payload")),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMove {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingLine {
    pub id: String,
    /// Flattened `[x0, y0, x1, y1, ...]`.
    pub points: Vec<f64>,
    pub tool: String,
    pub color: String,
    pub stroke_width: f64,
}

impl DrawingLine {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::missing("line.id"));
        }
        if self.points.len() % 2 != 0 {
            return Err(ValidationError::new("line.points", "must contain x/y pairs"));
        }
        if self.points.iter().any(|p| !p.is_finite()) {
            return Err(ValidationError::new("line.points", "must be finite"));
        }
        if self.tool.trim().is_empty() {
            return Err(ValidationError::missing("line.tool"));
        }
        if !self.stroke_width.is_finite() || self.stroke_width <= 0.0 {
            return Err(ValidationError::new("line.strokeWidth", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingEvent {
    pub user_name: String,
    pub line: DrawingLine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEditEvent {
    pub user_name: String,
    pub element_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardUser {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationStatus {
    pub invitation_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Typed event payload, JSON-encoded inside an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    Cursor(CursorMove),
    Drawing(DrawingEvent),
    Operation(Operation),
    TextEdit(TextEditEvent),
    UserJoined(BoardUser),
    Presence(PresenceState),
    Invitation(InvitationStatus),
    Awareness(AwarenessUpdate),
    #[serde(rename_all = "camelCase")]
    Leave { client_id: String },
}

impl EventPayload {
    /// Whether this payload may be published under `kind`.
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventPayload::Cursor(_) => kind == EventKind::CursorMove,
            EventPayload::Drawing(_) => {
                matches!(kind, EventKind::DrawingStart | EventKind::DrawingUpdate)
            }
            EventPayload::Operation(op) => op.event_kind() == kind,
            EventPayload::TextEdit(_) => {
                matches!(kind, EventKind::TextEditStarted | EventKind::TextEditFinished)
            }
            EventPayload::UserJoined(_) => kind == EventKind::UserJoined,
            EventPayload::Presence(_) => kind == EventKind::PresenceUpdate,
            EventPayload::Invitation(_) => kind == EventKind::InvitationStatusChanged,
            EventPayload::Awareness(_) => kind == EventKind::Awareness,
            EventPayload::Leave { .. } => kind == EventKind::AwarenessLeave,
        }
    }

    pub fn as_operation(&self) -> Option<&Operation> {
        match self {
            EventPayload::Operation(op) => Some(op),
            _ => None,
        }
    }
}

/// One published event on a board channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event id. For durable events this is the operation id.
    pub id: String,
    pub board_id: String,
    pub kind: EventKind,
    pub actor_id: String,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope, checking that the payload fits the kind.
    pub fn new(
        id: impl Into<String>,
        board_id: impl Into<String>,
        kind: EventKind,
        actor_id: impl Into<String>,
        timestamp: u64,
        payload: &EventPayload,
    ) -> Result<Self, ProtocolError> {
        if !payload.matches(kind) {
            return Err(ProtocolError::PayloadMismatch(kind.name()));
        }
        let payload = serde_json::to_vec(payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            board_id: board_id.into(),
            kind,
            actor_id: actor_id.into(),
            timestamp,
            payload,
        })
    }

    /// Envelope for a durable operation; the id is the operation id.
    pub fn for_operation(op: &Operation) -> Result<Self, ProtocolError> {
        Self::new(
            op.id.clone(),
            op.board_id.clone(),
            op.event_kind(),
            op.actor_id.clone(),
            op.timestamp,
            &EventPayload::Operation(op.clone()),
        )
    }

    /// Decode and kind-check the payload.
    pub fn payload(&self) -> Result<EventPayload, ProtocolError> {
        let payload: EventPayload = serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if !payload.matches(self.kind) {
            return Err(ProtocolError::PayloadMismatch(self.kind.name()));
        }
        Ok(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

/// Frames exchanged between a [`crate::transport::WsTransport`] and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { board_id: String },
    Unsubscribe { board_id: String },
    Publish { board_id: String, envelope: Vec<u8> },
    Deliver { board_id: String, envelope: Vec<u8> },
    Ping { sent_at: u64 },
    Pong { sent_at: u64 },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(op_type: OpType, element_type: ElementType) -> Operation {
        Operation {
            id: "op-1".into(),
            board_id: "board-1".into(),
            actor_id: "alice".into(),
            timestamp: 10,
            op_type,
            element_type,
            element_id: "e1".into(),
            payload: Some(json!({"id": "e1", "x": 1})),
        }
    }

    #[test]
    fn test_event_names_unique_and_reversible() {
        let mut names: Vec<&str> = EventKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), EventKind::ALL.len());

        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("nope"), None);
    }

    #[test]
    fn test_durable_kinds() {
        assert!(EventKind::ShapeTransformed.is_durable());
        assert!(EventKind::ElementDeleted.is_durable());
        assert!(!EventKind::CursorMove.is_durable());
        assert!(!EventKind::Awareness.is_durable());
        assert!(!EventKind::TextEditStarted.is_durable());
    }

    #[test]
    fn test_operation_event_kind_mapping() {
        assert_eq!(op(OpType::Create, ElementType::Text).event_kind(), EventKind::TextCreated);
        assert_eq!(op(OpType::Transform, ElementType::Shape).event_kind(), EventKind::ShapeTransformed);
        assert_eq!(op(OpType::Create, ElementType::Line).event_kind(), EventKind::DrawingComplete);
        assert_eq!(op(OpType::Delete, ElementType::Line).event_kind(), EventKind::ElementDeleted);
        assert_eq!(op(OpType::Create, ElementType::Element).event_kind(), EventKind::ElementUpdated);
        for ty in [ElementType::Element, ElementType::Text, ElementType::Shape, ElementType::Line] {
            for kind in [OpType::Create, OpType::Update, OpType::Delete, OpType::Transform] {
                assert!(op(kind, ty).event_kind().is_durable());
            }
        }
    }

    #[test]
    fn test_operation_validation() {
        assert!(op(OpType::Update, ElementType::Shape).validate().is_ok());

        let mut missing_payload = op(OpType::Update, ElementType::Shape);
        missing_payload.payload = None;
        assert_eq!(
            missing_payload.validate().unwrap_err().field,
            "payload"
        );

        let mut delete = op(OpType::Delete, ElementType::Shape);
        delete.payload = None;
        assert!(delete.validate().is_ok());

        let mut no_element = op(OpType::Update, ElementType::Shape);
        no_element.element_id = String::new();
        assert!(no_element.validate().is_err());
    }

    #[test]
    fn test_envelope_rejects_mismatched_payload() {
        let payload = EventPayload::Cursor(CursorMove { x: 1.0, y: 2.0, tool: None });
        let result = Envelope::new("id", "b", EventKind::UserJoined, "alice", 1, &payload);
        assert!(matches!(result, Err(ProtocolError::PayloadMismatch(_))));
    }

    #[test]
    fn test_envelope_for_operation_uses_op_id() {
        let op = op(OpType::Update, ElementType::Text);
        let envelope = Envelope::for_operation(&op).unwrap();
        assert_eq!(envelope.id, "op-1");
        assert_eq!(envelope.kind, EventKind::TextUpdated);

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload().unwrap().as_operation(), Some(&op));
    }

    #[test]
    fn test_payload_kind_checked_on_decode() {
        let payload = EventPayload::Cursor(CursorMove { x: 1.0, y: 2.0, tool: None });
        let mut envelope = Envelope::new("id", "b", EventKind::CursorMove, "alice", 1, &payload).unwrap();
        envelope.kind = EventKind::PresenceUpdate;
        assert!(envelope.payload().is_err());
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = EventPayload::Leave { client_id: "c1".into() };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, json!({"type": "leave", "data": {"clientId": "c1"}}));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(Envelope::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(RelayFrame::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_drawing_line_validation() {
        let mut line = DrawingLine {
            id: "l1".into(),
            points: vec![0.0, 0.0, 10.0, 10.0],
            tool: "pen".into(),
            color: "#000000".into(),
            stroke_width: 2.0,
        };
        assert!(line.validate().is_ok());

        line.points.push(5.0);
        assert!(line.validate().is_err());

        line.points.pop();
        line.stroke_width = 0.0;
        assert!(line.validate().is_err());
    }

    #[test]
    fn test_relay_frame_publish() {
        let frame = RelayFrame::Publish { board_id: "b".into(), envelope: vec![1, 2, 3] };
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}
