//! Read-only views for the rendering surface.
//!
//! Pure functions over session snapshots. Nothing here talks to the
//! network or mutates state; the host calls them again whenever a
//! [`SessionEvent`](crate::bridge::SessionEvent) says something changed.

use crate::client::{ChannelStatus, ConnectionState};
use crate::presence::{Collaborator, CursorColor};
use crate::protocol::{ObjectId, PeerId, Vec2};

// ───────────────────────────────────────────────────────────────────
// Cursor overlay
// ───────────────────────────────────────────────────────────────────

/// Data needed to draw one remote cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorMarker {
    pub peer_id: PeerId,
    pub position: Vec2,
    pub color: CursorColor,
    pub label: String,
    pub selection: Vec<ObjectId>,
}

/// One marker per active collaborator whose cursor is known, ordered by
/// peer id so repeated renders are stable.
pub fn cursor_overlay<'a>(collaborators: impl IntoIterator<Item = &'a Collaborator>) -> Vec<CursorMarker> {
    let mut markers: Vec<CursorMarker> = collaborators
        .into_iter()
        .filter(|c| c.is_active)
        .filter_map(|c| {
            let position = c.cursor?;
            Some(CursorMarker {
                peer_id: c.user.id.clone(),
                position,
                color: c.color,
                label: c.user.name.clone(),
                selection: c.selection.clone(),
            })
        })
        .collect();
    markers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    markers
}

// ───────────────────────────────────────────────────────────────────
// Connection indicator
// ───────────────────────────────────────────────────────────────────

/// Aggregate status across both channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Both channels connected.
    Live,
    /// At least one channel opening, none failed.
    Connecting,
    /// A channel is closed, none failed.
    Offline,
    /// A channel reported an error.
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIndicator {
    pub status: LinkStatus,
    pub label: String,
    /// Offer a manual reconnect action.
    pub offer_retry: bool,
}

/// Summarize both channels into one persistent status badge.
///
/// Errors win over closed channels, closed channels over opening ones.
pub fn connection_indicator(canvas: &ChannelStatus, presence: &ChannelStatus) -> ConnectionIndicator {
    let channels = [canvas, presence];

    let failed = channels
        .iter()
        .find(|c| c.state == ConnectionState::Error);
    let status = if let Some(failed) = failed {
        LinkStatus::Failed {
            message: failed
                .last_error
                .clone()
                .unwrap_or_else(|| "connection error".to_string()),
        }
    } else if channels.iter().any(|c| c.state == ConnectionState::Disconnected) {
        LinkStatus::Offline
    } else if channels.iter().any(|c| c.state == ConnectionState::Connecting) {
        LinkStatus::Connecting
    } else {
        LinkStatus::Live
    };

    let label = match &status {
        LinkStatus::Live => "Live".to_string(),
        LinkStatus::Connecting => "Connecting…".to_string(),
        LinkStatus::Offline => "Offline".to_string(),
        LinkStatus::Failed { message } => format!("Connection error: {message}"),
    };
    let offer_retry = matches!(status, LinkStatus::Offline | LinkStatus::Failed { .. });

    ConnectionIndicator {
        status,
        label,
        offer_retry,
    }
}

// ───────────────────────────────────────────────────────────────────
// Avatar stack
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AvatarChip {
    pub peer_id: PeerId,
    pub name: String,
    pub initials: String,
    pub avatar: Option<String>,
    pub color: CursorColor,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AvatarStack {
    pub visible: Vec<AvatarChip>,
    /// How many active collaborators did not fit ("+N").
    pub overflow: usize,
}

/// Active collaborators as avatar chips, sorted by name then id, cut at
/// `max_visible`.
pub fn avatar_stack<'a>(
    collaborators: impl IntoIterator<Item = &'a Collaborator>,
    max_visible: usize,
) -> AvatarStack {
    let mut active: Vec<&Collaborator> = collaborators.into_iter().filter(|c| c.is_active).collect();
    active.sort_by(|a, b| {
        a.user
            .name
            .to_lowercase()
            .cmp(&b.user.name.to_lowercase())
            .then_with(|| a.user.id.cmp(&b.user.id))
    });

    let overflow = active.len().saturating_sub(max_visible);
    let visible = active
        .into_iter()
        .take(max_visible)
        .map(|c| AvatarChip {
            peer_id: c.user.id.clone(),
            name: c.user.name.clone(),
            initials: initials(&c.user.name),
            avatar: c.user.avatar.clone(),
            color: c.color,
        })
        .collect();

    AvatarStack { visible, overflow }
}

/// Up to two uppercase initials from the first and last word, `?` if the
/// name is blank.
pub fn initials(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    let first_char = |w: &str| w.chars().next();
    let picked = match words.as_slice() {
        [] => return "?".to_string(),
        [only] => vec![first_char(only)],
        [first, .., last] => vec![first_char(first), first_char(last)],
    };
    picked
        .into_iter()
        .flatten()
        .flat_map(char::to_uppercase)
        .collect()
}
