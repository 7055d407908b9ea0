//! Ephemeral per-client state: cursor, presence, soft edit-lock, selection.
//!
//! A client's [`AwarenessState`] is always sent and stored as a complete
//! snapshot. Receivers replace their copy wholesale; fields are never merged
//! across snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ValidationError;

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct color derived from a user id.
    ///
    /// FNV-1a over the id bytes picks the hue; saturation and lightness are
    /// fixed for vivid cursors.
    pub fn from_id(id: &str) -> Self {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in id.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// CSS hex string (`#rrggbb`).
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Who the client is. Travels inside every snapshot so a receiver that
/// missed the join can still label the cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    pub name: String,
    pub color: CursorColor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = CursorColor::from_id(&user_id);
        Self {
            user_id,
            name: name.into(),
            color,
            avatar: None,
        }
    }
}

/// Last-known pointer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub x: f64,
    pub y: f64,
    pub current_tool: String,
    pub is_drawing: bool,
    pub is_selecting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f32>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            current_tool: "select".to_string(),
            is_drawing: false,
            is_selecting: false,
            active_element_id: None,
            pressure: None,
        }
    }
}

/// Partial cursor update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub current_tool: Option<String>,
    pub is_drawing: Option<bool>,
    pub is_selecting: Option<bool>,
    pub active_element_id: Option<Option<String>>,
    pub pressure: Option<Option<f32>>,
}

impl CursorPatch {
    /// Position-only update.
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.current_tool = Some(tool.into());
        self
    }

    pub fn drawing(mut self, is_drawing: bool) -> Self {
        self.is_drawing = Some(is_drawing);
        self
    }

    pub fn selecting(mut self, is_selecting: bool) -> Self {
        self.is_selecting = Some(is_selecting);
        self
    }

    pub fn active_element(mut self, element_id: Option<String>) -> Self {
        self.active_element_id = Some(element_id);
        self
    }

    pub fn pressure(mut self, pressure: Option<f32>) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub(crate) fn apply(self, cursor: &mut CursorState) {
        if let Some(x) = self.x {
            cursor.x = x;
        }
        if let Some(y) = self.y {
            cursor.y = y;
        }
        if let Some(tool) = self.current_tool {
            cursor.current_tool = tool;
        }
        if let Some(drawing) = self.is_drawing {
            cursor.is_drawing = drawing;
        }
        if let Some(selecting) = self.is_selecting {
            cursor.is_selecting = selecting;
        }
        if let Some(active) = self.active_element_id {
            cursor.active_element_id = active;
        }
        if let Some(pressure) = self.pressure {
            cursor.pressure = pressure;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub status: PresenceStatus,
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<String>,
}

impl PresenceState {
    pub fn online(now: u64) -> Self {
        Self {
            status: PresenceStatus::Online,
            last_seen: now,
            current_activity: None,
        }
    }
}

/// Partial presence update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresencePatch {
    pub status: Option<PresenceStatus>,
    pub current_activity: Option<Option<String>>,
}

impl PresencePatch {
    pub fn status(status: PresenceStatus) -> Self {
        Self {
            status: Some(status),
            current_activity: None,
        }
    }

    pub fn activity(mut self, activity: Option<String>) -> Self {
        self.current_activity = Some(activity);
        self
    }
}

/// Soft lock declared while a client edits one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditingState {
    pub element_id: String,
    pub element_type: String,
    pub start_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionState {
    pub element_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

/// Complete awareness snapshot of one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub client_id: String,
    pub user: UserIdentity,
    pub cursor: CursorState,
    pub presence: PresenceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editing: Option<EditingState>,
    #[serde(default)]
    pub selection: SelectionState,
}

impl AwarenessState {
    pub fn new(client_id: impl Into<String>, user: UserIdentity, now: u64) -> Self {
        Self {
            client_id: client_id.into(),
            user,
            cursor: CursorState::default(),
            presence: PresenceState::online(now),
            editing: None,
            selection: SelectionState::default(),
        }
    }

    /// Reject snapshots a sender could not have produced.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.client_id.trim().is_empty() {
            return Err(ValidationError::missing("clientId"));
        }
        if self.user.user_id.trim().is_empty() {
            return Err(ValidationError::missing("user.userId"));
        }
        if !self.cursor.x.is_finite() || !self.cursor.y.is_finite() {
            return Err(ValidationError::new("cursor", "coordinates must be finite"));
        }
        if let Some(pressure) = self.cursor.pressure {
            if !(0.0..=1.0).contains(&pressure) {
                return Err(ValidationError::new("cursor.pressure", "must be within 0..=1"));
            }
        }
        if let Some(editing) = &self.editing {
            if editing.element_id.trim().is_empty() {
                return Err(ValidationError::missing("editing.elementId"));
            }
        }
        if let Some(bbox) = &self.selection.bounding_box {
            let finite = [bbox.x, bbox.y, bbox.width, bbox.height]
                .iter()
                .all(|v| v.is_finite());
            if !finite || bbox.width < 0.0 || bbox.height < 0.0 {
                return Err(ValidationError::new("selection.boundingBox", "invalid geometry"));
            }
        }
        Ok(())
    }
}

/// Wire form of a snapshot: the state plus the sender's increasing clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessUpdate {
    pub clock: u64,
    pub state: AwarenessState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AwarenessState {
        AwarenessState::new("client-1", UserIdentity::new("alice", "Alice"), 1)
    }

    #[test]
    fn test_color_stable_per_id() {
        assert_eq!(CursorColor::from_id("alice"), CursorColor::from_id("alice"));
        let c = CursorColor::from_id("bob");
        assert!((0.0..=1.0).contains(&c.r));
        assert_eq!(c.a, 1.0);
    }

    #[test]
    fn test_color_hex() {
        let red = CursorColor { r: 1.0, g: 0.0, b: 0.0, a: 1.0 };
        assert_eq!(red.to_hex(), "#ff0000");
    }

    #[test]
    fn test_hsl_achromatic() {
        let (r, g, b) = hsl_to_rgb(0.0, 0.0, 0.5);
        assert!((r - 0.5).abs() < 0.01);
        assert!((g - 0.5).abs() < 0.01);
        assert!((b - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_cursor_patch_keeps_unset_fields() {
        let mut cursor = CursorState {
            current_tool: "pen".into(),
            is_drawing: true,
            ..CursorState::default()
        };
        CursorPatch::at(3.0, 4.0).apply(&mut cursor);
        assert_eq!(cursor.x, 3.0);
        assert_eq!(cursor.y, 4.0);
        assert_eq!(cursor.current_tool, "pen");
        assert!(cursor.is_drawing);
    }

    #[test]
    fn test_cursor_patch_clears_optional() {
        let mut cursor = CursorState {
            active_element_id: Some("e1".into()),
            ..CursorState::default()
        };
        CursorPatch::default().active_element(None).apply(&mut cursor);
        assert!(cursor.active_element_id.is_none());
    }

    #[test]
    fn test_validate_accepts_default() {
        assert!(state().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_snapshots() {
        let mut s = state();
        s.client_id = " ".into();
        assert!(s.validate().is_err());

        let mut s = state();
        s.cursor.x = f64::NAN;
        assert!(s.validate().is_err());

        let mut s = state();
        s.editing = Some(EditingState {
            element_id: String::new(),
            element_type: "text".into(),
            start_time: 0,
        });
        assert!(s.validate().is_err());

        let mut s = state();
        s.cursor.pressure = Some(1.5);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(state()).unwrap();
        assert!(json["cursor"].get("currentTool").is_some());
        assert!(json["cursor"].get("isDrawing").is_some());
        assert_eq!(json["presence"]["status"], "online");
    }

    #[test]
    fn test_snapshot_missing_required_field_fails_decode() {
        let json = serde_json::json!({
            "clientId": "c1",
            "cursor": { "x": 1.0, "y": 2.0, "currentTool": "pen", "isDrawing": false, "isSelecting": false },
            "presence": { "status": "online", "lastSeen": 1 }
        });
        assert!(serde_json::from_value::<AwarenessState>(json).is_err());
    }
}
