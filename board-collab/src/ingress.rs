//! Boundary between authenticated request handlers and the engine.
//!
//! Every request names the user it acts for. The gateway rejects it when
//! that user is not the authenticated caller, then checks the fields the
//! action needs, and only then publishes on the caller's behalf. Nothing
//! rejected here reaches a board channel.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::awareness::PresenceState;
use crate::broadcaster::OperationBroadcaster;
use crate::error::{CollabError, ValidationError};
use crate::protocol::{
    BoardUser, CursorMove, DrawingEvent, DrawingLine, ElementType, Envelope, EventKind, EventPayload, OpType,
    Operation, TextEditEvent,
};

/// One inbound action, as decoded from a request body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum IngressRequest {
    CursorMove {
        board_id: String,
        user_id: String,
        x: f64,
        y: f64,
        #[serde(default)]
        tool: Option<String>,
    },
    DrawingStart {
        board_id: String,
        user_id: String,
        user_name: String,
        line: DrawingLine,
    },
    DrawingUpdate {
        board_id: String,
        user_id: String,
        user_name: String,
        line: DrawingLine,
    },
    DrawingComplete {
        board_id: String,
        user_id: String,
        user_name: String,
        line: DrawingLine,
    },
    ElementUpdate {
        board_id: String,
        user_id: String,
        element: Value,
    },
    ElementDelete {
        board_id: String,
        user_id: String,
        element_id: String,
    },
    ShapeCreate {
        board_id: String,
        user_id: String,
        user_name: String,
        shape_element: Value,
    },
    ShapeUpdate {
        board_id: String,
        user_id: String,
        user_name: String,
        shape_element: Value,
    },
    ShapeDelete {
        board_id: String,
        user_id: String,
        user_name: String,
        shape_element: Value,
    },
    ShapeTransform {
        board_id: String,
        user_id: String,
        user_name: String,
        shape_element: Value,
    },
    TextCreate {
        board_id: String,
        user_id: String,
        user_name: String,
        text_element: Value,
    },
    TextUpdate {
        board_id: String,
        user_id: String,
        user_name: String,
        text_element: Value,
    },
    TextDelete {
        board_id: String,
        user_id: String,
        user_name: String,
        text_element: Value,
    },
    TextEditStart {
        board_id: String,
        user_id: String,
        user_name: String,
        text_element: Value,
    },
    TextEditFinish {
        board_id: String,
        user_id: String,
        user_name: String,
        text_element: Value,
    },
    Join {
        board_id: String,
        user: BoardUser,
    },
    PresenceUpdate {
        board_id: String,
        user_id: String,
        presence: PresenceState,
    },
}

impl IngressRequest {
    pub fn board_id(&self) -> &str {
        match self {
            IngressRequest::CursorMove { board_id, .. }
            | IngressRequest::DrawingStart { board_id, .. }
            | IngressRequest::DrawingUpdate { board_id, .. }
            | IngressRequest::DrawingComplete { board_id, .. }
            | IngressRequest::ElementUpdate { board_id, .. }
            | IngressRequest::ElementDelete { board_id, .. }
            | IngressRequest::ShapeCreate { board_id, .. }
            | IngressRequest::ShapeUpdate { board_id, .. }
            | IngressRequest::ShapeDelete { board_id, .. }
            | IngressRequest::ShapeTransform { board_id, .. }
            | IngressRequest::TextCreate { board_id, .. }
            | IngressRequest::TextUpdate { board_id, .. }
            | IngressRequest::TextDelete { board_id, .. }
            | IngressRequest::TextEditStart { board_id, .. }
            | IngressRequest::TextEditFinish { board_id, .. }
            | IngressRequest::Join { board_id, .. }
            | IngressRequest::PresenceUpdate { board_id, .. } => board_id,
        }
    }

    /// The user the request claims to act for.
    pub fn user_id(&self) -> &str {
        match self {
            IngressRequest::Join { user, .. } => &user.id,
            IngressRequest::CursorMove { user_id, .. }
            | IngressRequest::DrawingStart { user_id, .. }
            | IngressRequest::DrawingUpdate { user_id, .. }
            | IngressRequest::DrawingComplete { user_id, .. }
            | IngressRequest::ElementUpdate { user_id, .. }
            | IngressRequest::ElementDelete { user_id, .. }
            | IngressRequest::ShapeCreate { user_id, .. }
            | IngressRequest::ShapeUpdate { user_id, .. }
            | IngressRequest::ShapeDelete { user_id, .. }
            | IngressRequest::ShapeTransform { user_id, .. }
            | IngressRequest::TextCreate { user_id, .. }
            | IngressRequest::TextUpdate { user_id, .. }
            | IngressRequest::TextDelete { user_id, .. }
            | IngressRequest::TextEditStart { user_id, .. }
            | IngressRequest::TextEditFinish { user_id, .. }
            | IngressRequest::PresenceUpdate { user_id, .. } => user_id,
        }
    }
}

/// Publishes validated requests on behalf of authenticated users.
pub struct IngressGateway {
    broadcaster: Arc<OperationBroadcaster>,
}

impl IngressGateway {
    pub fn new(broadcaster: Arc<OperationBroadcaster>) -> Self {
        Self { broadcaster }
    }

    /// Check identity and fields, then publish. `authenticated` is the user
    /// id established by the caller's auth layer.
    pub async fn handle(&self, authenticated: &str, request: IngressRequest) -> Result<Envelope, CollabError> {
        let claimed = request.user_id();
        if claimed.trim().is_empty() {
            return Err(reject(ValidationError::missing("userId")));
        }
        if claimed != authenticated {
            log::warn!("Rejected request: user {authenticated} tried to act as {claimed}");
            return Err(CollabError::Authorization {
                authenticated: authenticated.to_string(),
                claimed: claimed.to_string(),
            });
        }
        if request.board_id().trim().is_empty() {
            return Err(reject(ValidationError::missing("boardId")));
        }

        let (kind, payload) = self.translate(&request).map_err(reject)?;
        let envelope = self
            .broadcaster
            .publish_as(claimed, request.board_id(), kind, &payload)
            .await?;
        log::debug!("Ingress published {kind} for {claimed} on board {}", request.board_id());
        Ok(envelope)
    }

    fn translate(&self, request: &IngressRequest) -> Result<(EventKind, EventPayload), ValidationError> {
        let translated = match request {
            IngressRequest::CursorMove { x, y, tool, .. } => {
                if !x.is_finite() || !y.is_finite() {
                    return Err(ValidationError::new("x", "coordinates must be finite"));
                }
                let cursor = CursorMove {
                    x: *x,
                    y: *y,
                    tool: tool.clone(),
                };
                (EventKind::CursorMove, EventPayload::Cursor(cursor))
            }
            IngressRequest::DrawingStart { user_name, line, .. } => {
                (EventKind::DrawingStart, drawing(user_name, line)?)
            }
            IngressRequest::DrawingUpdate { user_name, line, .. } => {
                (EventKind::DrawingUpdate, drawing(user_name, line)?)
            }
            IngressRequest::DrawingComplete {
                board_id,
                user_id,
                user_name,
                line,
            } => {
                require("userName", user_name)?;
                line.validate()?;
                let payload = serde_json::to_value(line)
                    .map_err(|e| ValidationError::new("line", e.to_string()))?;
                self.operation(board_id, user_id, OpType::Create, ElementType::Line, &line.id, Some(payload))
            }
            IngressRequest::ElementUpdate {
                board_id,
                user_id,
                element,
            } => {
                let id = element_id("element", element)?;
                self.operation(board_id, user_id, OpType::Update, ElementType::Element, &id, Some(element.clone()))
            }
            IngressRequest::ElementDelete {
                board_id,
                user_id,
                element_id,
            } => {
                require("elementId", element_id)?;
                self.operation(board_id, user_id, OpType::Delete, ElementType::Element, element_id, None)
            }
            IngressRequest::ShapeCreate {
                board_id,
                user_id,
                user_name,
                shape_element,
            } => self.element_op(board_id, user_id, user_name, "shapeElement", shape_element, ElementType::Shape, OpType::Create)?,
            IngressRequest::ShapeUpdate {
                board_id,
                user_id,
                user_name,
                shape_element,
            } => self.element_op(board_id, user_id, user_name, "shapeElement", shape_element, ElementType::Shape, OpType::Update)?,
            IngressRequest::ShapeDelete {
                board_id,
                user_id,
                user_name,
                shape_element,
            } => self.element_op(board_id, user_id, user_name, "shapeElement", shape_element, ElementType::Shape, OpType::Delete)?,
            IngressRequest::ShapeTransform {
                board_id,
                user_id,
                user_name,
                shape_element,
            } => self.element_op(board_id, user_id, user_name, "shapeElement", shape_element, ElementType::Shape, OpType::Transform)?,
            IngressRequest::TextCreate {
                board_id,
                user_id,
                user_name,
                text_element,
            } => self.element_op(board_id, user_id, user_name, "textElement", text_element, ElementType::Text, OpType::Create)?,
            IngressRequest::TextUpdate {
                board_id,
                user_id,
                user_name,
                text_element,
            } => self.element_op(board_id, user_id, user_name, "textElement", text_element, ElementType::Text, OpType::Update)?,
            IngressRequest::TextDelete {
                board_id,
                user_id,
                user_name,
                text_element,
            } => self.element_op(board_id, user_id, user_name, "textElement", text_element, ElementType::Text, OpType::Delete)?,
            IngressRequest::TextEditStart {
                user_name,
                text_element,
                ..
            } => (EventKind::TextEditStarted, text_edit(user_name, text_element)?),
            IngressRequest::TextEditFinish {
                user_name,
                text_element,
                ..
            } => (EventKind::TextEditFinished, text_edit(user_name, text_element)?),
            IngressRequest::Join { user, .. } => {
                require("user.name", &user.name)?;
                (EventKind::UserJoined, EventPayload::UserJoined(user.clone()))
            }
            IngressRequest::PresenceUpdate { presence, .. } => {
                (EventKind::PresenceUpdate, EventPayload::Presence(presence.clone()))
            }
        };
        Ok(translated)
    }

    #[allow(clippy::too_many_arguments)]
    fn element_op(
        &self,
        board_id: &str,
        user_id: &str,
        user_name: &str,
        field: &'static str,
        element: &Value,
        element_type: ElementType,
        op_type: OpType,
    ) -> Result<(EventKind, EventPayload), ValidationError> {
        require("userName", user_name)?;
        let id = element_id(field, element)?;
        let payload = (op_type != OpType::Delete).then(|| element.clone());
        Ok(self.operation(board_id, user_id, op_type, element_type, &id, payload))
    }

    fn operation(
        &self,
        board_id: &str,
        user_id: &str,
        op_type: OpType,
        element_type: ElementType,
        element_id: &str,
        payload: Option<Value>,
    ) -> (EventKind, EventPayload) {
        let op = Operation {
            id: Uuid::new_v4().to_string(),
            board_id: board_id.to_string(),
            actor_id: user_id.to_string(),
            timestamp: self.broadcaster.clock().tick(),
            op_type,
            element_type,
            element_id: element_id.to_string(),
            payload,
        };
        (op.event_kind(), EventPayload::Operation(op))
    }
}

fn reject(error: ValidationError) -> CollabError {
    log::warn!("Rejected request: {error}");
    error.into()
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::missing(field));
    }
    Ok(())
}

/// The `id` of a free-form element object.
fn element_id(field: &'static str, element: &Value) -> Result<String, ValidationError> {
    if !element.is_object() {
        return Err(ValidationError::new(field, "must be an object"));
    }
    match element.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
        _ => Err(ValidationError::missing(field)),
    }
}

fn drawing(user_name: &str, line: &DrawingLine) -> Result<EventPayload, ValidationError> {
    require("userName", user_name)?;
    line.validate()?;
    Ok(EventPayload::Drawing(DrawingEvent {
        user_name: user_name.to_string(),
        line: line.clone(),
    }))
}

fn text_edit(user_name: &str, text_element: &Value) -> Result<EventPayload, ValidationError> {
    require("userName", user_name)?;
    Ok(EventPayload::TextEdit(TextEditEvent {
        user_name: user_name.to_string(),
        element_id: element_id("textElement", text_element)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::transport::LocalHub;
    use serde_json::json;

    fn gateway() -> (IngressGateway, Arc<OperationBroadcaster>) {
        let hub = LocalHub::new(16);
        let broadcaster = Arc::new(OperationBroadcaster::new(
            Arc::new(hub.endpoint()),
            "ingress",
            Arc::new(MonotonicClock::new()),
        ));
        (IngressGateway::new(broadcaster.clone()), broadcaster)
    }

    #[tokio::test]
    async fn test_identity_mismatch_rejected_before_publish() {
        let (gateway, broadcaster) = gateway();
        let request = IngressRequest::CursorMove {
            board_id: "board-1".into(),
            user_id: "bob".into(),
            x: 1.0,
            y: 2.0,
            tool: None,
        };
        let err = gateway.handle("alice", request).await.unwrap_err();
        assert!(matches!(err, CollabError::Authorization { .. }));
        assert_eq!(broadcaster.stats().published, 0);
    }

    #[tokio::test]
    async fn test_cursor_move_published_as_user() {
        let (gateway, _) = gateway();
        let request = IngressRequest::CursorMove {
            board_id: "board-1".into(),
            user_id: "alice".into(),
            x: 1.0,
            y: 2.0,
            tool: Some("pen".into()),
        };
        let envelope = gateway.handle("alice", request).await.unwrap();
        assert_eq!(envelope.actor_id, "alice");
        assert_eq!(envelope.kind, EventKind::CursorMove);
    }

    #[tokio::test]
    async fn test_shape_transform_becomes_operation() {
        let (gateway, _) = gateway();
        let request: IngressRequest = serde_json::from_value(json!({
            "action": "shape-transform",
            "boardId": "board-1",
            "userId": "alice",
            "userName": "Alice",
            "shapeElement": {"id": "s1", "rotation": 90}
        }))
        .unwrap();
        let envelope = gateway.handle("alice", request).await.unwrap();
        assert_eq!(envelope.kind, EventKind::ShapeTransformed);
        let op = envelope.payload().unwrap().as_operation().cloned().unwrap();
        assert_eq!(op.element_id, "s1");
        assert_eq!(op.op_type, OpType::Transform);
        assert_eq!(envelope.id, op.id);
    }

    #[tokio::test]
    async fn test_missing_element_id_is_validation_error() {
        let (gateway, broadcaster) = gateway();
        let request = IngressRequest::TextCreate {
            board_id: "board-1".into(),
            user_id: "alice".into(),
            user_name: "Alice".into(),
            text_element: json!({"text": "no id"}),
        };
        let err = gateway.handle("alice", request).await.unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));
        assert_eq!(broadcaster.stats().published, 0);
    }

    #[tokio::test]
    async fn test_join_uses_user_id() {
        let (gateway, _) = gateway();
        let request = IngressRequest::Join {
            board_id: "board-1".into(),
            user: BoardUser {
                id: "alice".into(),
                name: "Alice".into(),
                email: None,
                avatar: None,
            },
        };
        assert!(gateway.handle("mallory", request.clone()).await.is_err());
        assert!(gateway.handle("alice", request).await.is_ok());
    }

    #[tokio::test]
    async fn test_text_delete_has_no_payload() {
        let (gateway, _) = gateway();
        let request = IngressRequest::TextDelete {
            board_id: "board-1".into(),
            user_id: "alice".into(),
            user_name: "Alice".into(),
            text_element: json!({"id": "t1"}),
        };
        let envelope = gateway.handle("alice", request).await.unwrap();
        assert_eq!(envelope.kind, EventKind::TextDeleted);
        let op = envelope.payload().unwrap().as_operation().cloned().unwrap();
        assert!(op.payload.is_none());
    }
}
