//! Collaborator registry: who else is in the project and what they point at.
//!
//! ## Data flow
//!
//! ```text
//! user_joined / user_online ──► upsert_from_join()
//! user_left                 ──► remove()
//! user_offline              ──► mark_offline()
//! cursor_update             ──► apply_cursor()      (known peers only)
//! selection_change          ──► apply_selection()   (known peers only)
//! sync_state / presence_update ──► apply_presence_snapshot()
//!                                         │
//!                                         ▼
//!                              active_collaborators()  ──► views
//! ```
//!
//! Canvas and presence channels are not ordered relative to each other, so
//! every entry point tolerates duplicates and reordering: applying the same
//! message twice leaves the same state, and updates naming a peer that is
//! not (yet) registered are dropped instead of creating placeholders.
//!
//! The local user is never stored here.
//!
//! This module also holds [`CursorThrottle`], the outbound cursor coalescer.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{ObjectId, PeerId, PeerSnapshot, UserIdentity, Vec2};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Hues (0..1) of the fixed cursor palette, 30° apart.
const PALETTE_HUES: [f32; 12] = [
    0.0 / 12.0,
    7.0 / 12.0,
    2.0 / 12.0,
    9.0 / 12.0,
    4.0 / 12.0,
    11.0 / 12.0,
    6.0 / 12.0,
    1.0 / 12.0,
    8.0 / 12.0,
    3.0 / 12.0,
    10.0 / 12.0,
    5.0 / 12.0,
];

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Palette color for a peer id.
    ///
    /// Pure function of the id: the same peer renders the same color in
    /// every session and on every client, with no coordination.
    pub fn from_peer_id(peer_id: &str) -> Self {
        let slot = stable_hash(peer_id) as usize % PALETTE_HUES.len();
        let (r, g, b) = hsl_to_rgb(PALETTE_HUES[slot], 0.7, 0.55);
        Self { r, g, b, a: 1.0 }
    }

    /// Create from RGBA components.
    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Convert to [f32; 4] array.
    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for CSS-style consumers.
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

/// 32-bit FNV-1a. Must not change between releases: colors depend on it.
fn stable_hash(s: &str) -> u32 {
    s.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// HSL to RGB conversion helper.
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

// ───────────────────────────────────────────────────────────────────
// Collaborator
// ───────────────────────────────────────────────────────────────────

/// One remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub user: UserIdentity,
    /// Absent until the first cursor update.
    pub cursor: Option<Vec2>,
    /// Selected object ids, in the order the peer reported them.
    pub selection: Vec<ObjectId>,
    pub color: CursorColor,
    pub is_active: bool,
    /// Local receipt time of the last message about this peer.
    pub last_seen: Instant,
}

impl Collaborator {
    pub fn new(user: UserIdentity, now: Instant) -> Self {
        let color = CursorColor::from_peer_id(&user.id);
        Self {
            user,
            cursor: None,
            selection: Vec::new(),
            color,
            is_active: true,
            last_seen: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn name(&self) -> &str {
        &self.user.name
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Remote peers of the current session, keyed by peer id.
#[derive(Debug, Clone)]
pub struct CollaboratorRegistry {
    local_user_id: PeerId,
    peers: HashMap<PeerId, Collaborator>,
}

impl CollaboratorRegistry {
    pub fn new(local_user_id: impl Into<PeerId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
        }
    }

    /// Insert or replace a peer from a join/online announcement.
    ///
    /// Returns `false` (and does nothing) for the local user.
    pub fn upsert_from_join(&mut self, user: UserIdentity, now: Instant) -> bool {
        if user.id == self.local_user_id {
            return false;
        }
        self.peers.insert(user.id.clone(), Collaborator::new(user, now));
        true
    }

    /// Drop a peer. No-op if absent.
    pub fn remove(&mut self, peer_id: &str) -> Option<Collaborator> {
        self.peers.remove(peer_id)
    }

    /// Keep the peer but stop reporting it as active.
    pub fn mark_offline(&mut self, peer_id: &str, now: Instant) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.is_active = false;
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Update the cursor of a known peer. Unknown peers are ignored.
    pub fn apply_cursor(&mut self, peer_id: &str, position: Vec2, now: Instant) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.cursor = Some(position);
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Update the selection of a known peer. Unknown peers are ignored.
    pub fn apply_selection(&mut self, peer_id: &str, object_ids: Vec<ObjectId>, now: Instant) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.selection = object_ids;
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Replace the whole registry from a full peer list.
    ///
    /// Peers missing from `list` are dropped. For peers that stay, a cursor
    /// or selection the snapshot does not carry is kept from the previous
    /// state, so periodic snapshots do not blank live cursors.
    pub fn apply_presence_snapshot(&mut self, list: Vec<PeerSnapshot>, now: Instant) {
        let mut previous = std::mem::take(&mut self.peers);

        for entry in list {
            if entry.user.id == self.local_user_id {
                continue;
            }
            let prior = previous.remove(&entry.user.id);
            let mut peer = Collaborator::new(entry.user, now);
            peer.is_active = entry.is_active;
            peer.cursor = entry.cursor.or_else(|| prior.as_ref().and_then(|p| p.cursor));
            peer.selection = if entry.selection.is_empty() {
                prior.map(|p| p.selection).unwrap_or_default()
            } else {
                entry.selection
            };
            self.peers.insert(peer.user.id.clone(), peer);
        }
    }

    /// Active peers, ordered by id. The local user is never included.
    pub fn active_collaborators(&self) -> Vec<&Collaborator> {
        let mut active: Vec<&Collaborator> = self.peers.values().filter(|p| p.is_active).collect();
        active.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        active
    }

    pub fn get(&self, peer_id: &str) -> Option<&Collaborator> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collaborator> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound cursor coalescing
// ───────────────────────────────────────────────────────────────────

/// Coalesces local cursor moves into at most one frame per window.
///
/// The first move of a window arms a deadline; later moves only overwrite
/// the pending position. When the deadline passes, the latest position is
/// taken and the window closes. Staleness is bounded by the window length.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    window: Duration,
    pending: Option<Vec2>,
    deadline: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record the latest local cursor position.
    pub fn record(&mut self, position: Vec2, now: Instant) {
        self.pending = Some(position);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// When the pending position must be flushed, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the pending position if its window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec2> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<Vec2> {
        self.pending
    }

    /// Drop any pending position and disarm the window.
    pub fn clear(&mut self) {
        self.pending = None;
        self.deadline = None;
    }
}
