//! JSON wire protocol for the canvas and presence channels.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! { "type": "<kind>", ...kind-specific fields... }
//! ```
//!
//! The server is not consistent about field names (a selection may arrive
//! as `selected_elements` or `object_ids`, a peer as `user_id` or as a
//! nested `user.id`, ids as strings or numbers). Everything is normalized
//! here, at the boundary, into [`CanvasMessage`] / [`PresenceMessage`] so
//! that no handler ever sees raw wire variance.
//!
//! Decoding distinguishes three outcomes:
//! - `Ok(Some(msg))`: a known kind with all required fields
//! - `Ok(None)`: a well-formed frame of a kind this client does not consume
//! - `Err(_)`: invalid JSON, not an object, no `type`, or a known kind
//!   missing a required field

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CollabError;

/// Peer identifier as issued by the server.
pub type PeerId = String;

/// Design object identifier as issued by the server.
pub type ObjectId = String;

// ───────────────────────────────────────────────────────────────────
// Shared wire types
// ───────────────────────────────────────────────────────────────────

/// The two logical channels a session keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Operations, locks, selection and element changes.
    Canvas,
    /// Online/offline, presence snapshots and heartbeat.
    Presence,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Canvas, Channel::Presence];

    /// URL path segment under `/ws/`.
    pub fn path_segment(self) -> &'static str {
        match self {
            Channel::Canvas => "canvas",
            Channel::Presence => "presence",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// 2D position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Identity of a participant, as announced on join and carried in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: PeerId,
    pub name: String,
    pub avatar: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// One entry of a full peer list (`sync_state.collaborators` or
/// `presence_update.users`).
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub user: UserIdentity,
    pub is_active: bool,
    pub cursor: Option<Vec2>,
    pub selection: Vec<ObjectId>,
}

impl PeerSnapshot {
    pub fn active(user: UserIdentity) -> Self {
        Self {
            user,
            is_active: true,
            cursor: None,
            selection: Vec::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound frames
// ───────────────────────────────────────────────────────────────────

/// Every frame this client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Join { user: UserIdentity },
    Leave,
    CanvasOperation { operation: Value },
    CursorUpdate { position: Vec2 },
    SelectionChange { object_ids: Vec<ObjectId> },
    LockObject { object_id: ObjectId },
    UnlockObject { object_id: ObjectId },
    Online { user: UserIdentity },
    Heartbeat,
}

impl OutboundFrame {
    /// Channel this frame travels on.
    pub fn channel(&self) -> Channel {
        match self {
            OutboundFrame::Online { .. } | OutboundFrame::Heartbeat => Channel::Presence,
            _ => Channel::Canvas,
        }
    }

    /// Wire `type` value, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Join { .. } => "join",
            OutboundFrame::Leave => "leave",
            OutboundFrame::CanvasOperation { .. } => "canvas_operation",
            OutboundFrame::CursorUpdate { .. } => "cursor_update",
            OutboundFrame::SelectionChange { .. } => "selection_change",
            OutboundFrame::LockObject { .. } => "lock_object",
            OutboundFrame::UnlockObject { .. } => "unlock_object",
            OutboundFrame::Online { .. } => "online",
            OutboundFrame::Heartbeat => "heartbeat",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, CollabError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound messages
// ───────────────────────────────────────────────────────────────────

/// Which element frame was received; the payload itself stays opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementChange {
    Create,
    Update,
    Delete,
}

/// Normalized canvas-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasMessage {
    UserJoined(UserIdentity),
    UserLeft {
        peer_id: PeerId,
    },
    CursorUpdate {
        peer_id: PeerId,
        position: Vec2,
    },
    SelectionChange {
        peer_id: PeerId,
        object_ids: Vec<ObjectId>,
    },
    /// `element_create` / `element_update` / `element_delete`, whole frame.
    Element {
        change: ElementChange,
        message: Value,
    },
    /// `canvas_operation`, the `operation` payload.
    Operation(Value),
    ObjectLocked {
        object_id: ObjectId,
        peer_id: PeerId,
    },
    ObjectUnlocked {
        object_id: ObjectId,
    },
    LockDenied {
        object_id: ObjectId,
        locked_by: Option<PeerId>,
    },
    /// Full resync. `None` leaves the corresponding table untouched.
    SyncState {
        collaborators: Option<Vec<PeerSnapshot>>,
        locked_objects: Option<HashMap<ObjectId, PeerId>>,
    },
}

/// Normalized presence-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceMessage {
    Online(UserIdentity),
    Offline {
        peer_id: PeerId,
    },
    Snapshot(Vec<PeerSnapshot>),
    CursorUpdate {
        peer_id: PeerId,
        position: Vec2,
    },
    SelectionChange {
        peer_id: PeerId,
        object_ids: Vec<ObjectId>,
    },
    Heartbeat,
}

/// Decode a canvas-channel text frame.
pub fn decode_canvas(text: &str) -> Result<Option<CanvasMessage>, CollabError> {
    let (kind, map) = split_frame(text)?;

    let msg = match kind.as_str() {
        "user_joined" => CanvasMessage::UserJoined(
            identity_of(&map).ok_or(missing("user_joined", "user"))?,
        ),
        "user_left" => CanvasMessage::UserLeft {
            peer_id: peer_of(&map).ok_or(missing("user_left", "user_id"))?,
        },
        "cursor_update" => CanvasMessage::CursorUpdate {
            peer_id: peer_of(&map).ok_or(missing("cursor_update", "user_id"))?,
            position: position_of(&map).ok_or(missing("cursor_update", "position"))?,
        },
        "selection_change" => CanvasMessage::SelectionChange {
            peer_id: peer_of(&map).ok_or(missing("selection_change", "user_id"))?,
            object_ids: selection_of(&map),
        },
        "element_create" => element(ElementChange::Create, map),
        "element_update" => element(ElementChange::Update, map),
        "element_delete" => element(ElementChange::Delete, map),
        "canvas_operation" => {
            let mut map = map;
            match map.remove("operation") {
                Some(op) if !op.is_null() => CanvasMessage::Operation(op),
                _ => CanvasMessage::Operation(Value::Object(map)),
            }
        }
        "object_locked" => CanvasMessage::ObjectLocked {
            object_id: string_field(&map, &["object_id", "objectId"])
                .ok_or(missing("object_locked", "object_id"))?,
            peer_id: string_field(&map, &["user_id", "locked_by", "userId"])
                .or_else(|| nested_id(&map, "user"))
                .ok_or(missing("object_locked", "user_id"))?,
        },
        "object_unlocked" => CanvasMessage::ObjectUnlocked {
            object_id: string_field(&map, &["object_id", "objectId"])
                .ok_or(missing("object_unlocked", "object_id"))?,
        },
        "lock_denied" => CanvasMessage::LockDenied {
            object_id: string_field(&map, &["object_id", "objectId"])
                .ok_or(missing("lock_denied", "object_id"))?,
            locked_by: string_field(&map, &["locked_by", "lockedBy", "user_id"]),
        },
        "sync_state" => CanvasMessage::SyncState {
            collaborators: snapshot_field(&map, "collaborators", Value::is_array).map(peer_list),
            locked_objects: snapshot_field(&map, "locked_objects", Value::is_object).map(lock_map),
        },
        _ => return Ok(None),
    };

    Ok(Some(msg))
}

/// Decode a presence-channel text frame.
pub fn decode_presence(text: &str) -> Result<Option<PresenceMessage>, CollabError> {
    let (kind, map) = split_frame(text)?;

    let msg = match kind.as_str() {
        "user_online" => PresenceMessage::Online(
            identity_of(&map).ok_or(missing("user_online", "user"))?,
        ),
        "user_offline" => PresenceMessage::Offline {
            peer_id: peer_of(&map).ok_or(missing("user_offline", "user_id"))?,
        },
        "presence_update" => PresenceMessage::Snapshot(
            map.get("users")
                .map(peer_list)
                .ok_or(missing("presence_update", "users"))?,
        ),
        "cursor_update" => PresenceMessage::CursorUpdate {
            peer_id: peer_of(&map).ok_or(missing("cursor_update", "user_id"))?,
            position: position_of(&map).ok_or(missing("cursor_update", "position"))?,
        },
        "selection_change" => PresenceMessage::SelectionChange {
            peer_id: peer_of(&map).ok_or(missing("selection_change", "user_id"))?,
            object_ids: selection_of(&map),
        },
        "heartbeat" => PresenceMessage::Heartbeat,
        _ => return Ok(None),
    };

    Ok(Some(msg))
}

// ───────────────────────────────────────────────────────────────────
// Normalization helpers
// ───────────────────────────────────────────────────────────────────

fn missing(kind: &'static str, field: &'static str) -> CollabError {
    CollabError::MissingField { kind, field }
}

fn split_frame(text: &str) -> Result<(String, Map<String, Value>), CollabError> {
    let Value::Object(map) = serde_json::from_str::<Value>(text)? else {
        return Err(CollabError::NotAnObject);
    };
    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CollabError::MissingType)?
        .to_owned();
    Ok((kind, map))
}

fn element(change: ElementChange, map: Map<String, Value>) -> CanvasMessage {
    CanvasMessage::Element {
        change,
        message: Value::Object(map),
    }
}

/// Ids arrive as strings from some endpoints and as integers from others.
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First present, non-empty value among `keys`.
fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| map.get(*k).and_then(id_value))
}

fn nested_id(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_object)
        .and_then(|user| string_field(user, &["id", "user_id"]))
}

fn peer_of(map: &Map<String, Value>) -> Option<PeerId> {
    string_field(map, &["user_id", "userId", "peer_id"]).or_else(|| nested_id(map, "user"))
}

fn identity_fields(map: &Map<String, Value>, id_keys: &[&str]) -> Option<UserIdentity> {
    let id = string_field(map, id_keys)?;
    let name = string_field(map, &["name", "username", "user_name", "display_name"])
        .unwrap_or_else(|| id.clone());
    let avatar = string_field(map, &["avatar", "avatar_url"]);
    Some(UserIdentity { id, name, avatar })
}

fn identity_of(map: &Map<String, Value>) -> Option<UserIdentity> {
    match map.get("user").and_then(Value::as_object) {
        Some(user) => identity_fields(user, &["id", "user_id"]),
        None => identity_fields(map, &["user_id", "userId", "peer_id"]),
    }
}

fn point_in(obj: &Map<String, Value>) -> Option<Vec2> {
    Some(Vec2::new(obj.get("x")?.as_f64()?, obj.get("y")?.as_f64()?))
}

fn point(value: &Value) -> Option<Vec2> {
    value.as_object().and_then(point_in)
}

fn position_of(map: &Map<String, Value>) -> Option<Vec2> {
    map.get("position").and_then(point).or_else(|| point_in(map))
}

fn id_list(value: Option<&Value>) -> Vec<ObjectId> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(id_value).collect())
        .unwrap_or_default()
}

/// First non-empty list among the known selection field names.
fn selection_of(map: &Map<String, Value>) -> Vec<ObjectId> {
    ["selected_elements", "object_ids", "selection"]
        .iter()
        .map(|k| id_list(map.get(*k)))
        .find(|ids| !ids.is_empty())
        .unwrap_or_default()
}

fn peer_snapshot(value: &Value) -> Option<PeerSnapshot> {
    let map = value.as_object()?;
    let user = identity_of(map).or_else(|| identity_fields(map, &["id"]))?;
    Some(PeerSnapshot {
        user,
        is_active: map.get("is_active").and_then(Value::as_bool).unwrap_or(true),
        cursor: map
            .get("cursor")
            .or_else(|| map.get("position"))
            .and_then(point),
        selection: selection_of(map),
    })
}

/// A `sync_state` table, if the frame really carries one. Null or a value
/// of the wrong shape counts as absent so it cannot wipe local state.
fn snapshot_field<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    expected: fn(&Value) -> bool,
) -> Option<&'a Value> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(value) if expected(value) => Some(value),
        Some(_) => {
            log::debug!("Ignoring sync_state.{key}: unexpected shape");
            None
        }
    }
}

/// Entries that cannot be read as a peer are skipped, not fatal.
fn peer_list(value: &Value) -> Vec<PeerSnapshot> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(peer_snapshot).collect())
        .unwrap_or_default()
}

fn lock_map(value: &Value) -> HashMap<ObjectId, PeerId> {
    let Some(map) = value.as_object() else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(object_id, owner)| {
            let owner = id_value(owner).or_else(|| {
                owner
                    .as_object()
                    .and_then(|o| string_field(o, &["user_id", "id"]))
            })?;
            Some((object_id.clone(), owner))
        })
        .collect()
}
