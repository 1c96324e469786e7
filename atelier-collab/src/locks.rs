//! Exclusive edit locks on design objects.
//!
//! ```text
//!  request_lock(obj)
//!       │
//!       ├─ table says local owner ──────────► true   (no frame)
//!       ├─ table says other owner ──────────► false  (no frame)
//!       └─ unlocked: send lock_object, park in PendingLocks
//!                │
//!                ├─ object_locked / sync_state shows local owner ─► true
//!                ├─ lock_denied naming obj ────────────────────────► false
//!                └─ deadline passes ─► table shows local owner ? true : false
//! ```
//!
//! The [`LockTable`] mirrors server state only. It changes exclusively in
//! response to inbound frames; local intent (request or release) never
//! touches it. It does not arbitrate either: a second grant for the same
//! object simply replaces the first owner.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::{ObjectId, PeerId};

// ───────────────────────────────────────────────────────────────────
// Lock table
// ───────────────────────────────────────────────────────────────────

/// object id → owning peer id. Absence means unlocked.
#[derive(Debug, Clone)]
pub struct LockTable {
    local_peer_id: PeerId,
    owners: HashMap<ObjectId, PeerId>,
}

impl LockTable {
    pub fn new(local_peer_id: impl Into<PeerId>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            owners: HashMap::new(),
        }
    }

    pub fn owner(&self, object_id: &str) -> Option<&str> {
        self.owners.get(object_id).map(String::as_str)
    }

    pub fn is_held_locally(&self, object_id: &str) -> bool {
        self.owner(object_id) == Some(self.local_peer_id.as_str())
    }

    /// Answer a lock request from the table alone, if possible.
    ///
    /// `Some(true)` when already ours, `Some(false)` when someone else
    /// holds it, `None` when the server has to be asked.
    pub fn fast_path(&self, object_id: &str) -> Option<bool> {
        self.owner(object_id)
            .map(|owner| owner == self.local_peer_id)
    }

    /// Record a grant. Last writer wins.
    pub fn apply_grant(&mut self, object_id: impl Into<ObjectId>, peer_id: impl Into<PeerId>) {
        self.owners.insert(object_id.into(), peer_id.into());
    }

    /// Record a release. Returns the previous owner.
    pub fn apply_revoke(&mut self, object_id: &str) -> Option<PeerId> {
        self.owners.remove(object_id)
    }

    /// Replace the whole table from a resync.
    pub fn apply_snapshot(&mut self, owners: HashMap<ObjectId, PeerId>) {
        self.owners = owners;
    }

    /// Drop every lock held by a peer that left. Returns the freed objects.
    pub fn release_peer(&mut self, peer_id: &str) -> Vec<ObjectId> {
        let freed: Vec<ObjectId> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == peer_id)
            .map(|(object_id, _)| object_id.clone())
            .collect();
        for object_id in &freed {
            self.owners.remove(object_id);
        }
        freed
    }

    pub fn snapshot(&self) -> HashMap<ObjectId, PeerId> {
        self.owners.clone()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn clear(&mut self) {
        self.owners.clear();
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }
}

// ───────────────────────────────────────────────────────────────────
// Outstanding requests
// ───────────────────────────────────────────────────────────────────

struct PendingLock {
    deadline: Instant,
    replies: Vec<oneshot::Sender<bool>>,
}

/// Lock requests waiting on the server, one entry per object.
///
/// Every reply sender is completed exactly once: by a grant, a denial, the
/// deadline, or teardown. Concurrent requests for one object share the
/// entry and its outcome.
#[derive(Default)]
pub struct PendingLocks {
    waiting: HashMap<ObjectId, PendingLock>,
}

impl PendingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a reply. Returns `true` if this is the first request for the
    /// object, i.e. a `lock_object` frame has to go out.
    pub fn register(&mut self, object_id: ObjectId, reply: oneshot::Sender<bool>, deadline: Instant) -> bool {
        match self.waiting.get_mut(&object_id) {
            Some(pending) => {
                pending.replies.push(reply);
                false
            }
            None => {
                self.waiting.insert(
                    object_id,
                    PendingLock {
                        deadline,
                        replies: vec![reply],
                    },
                );
                true
            }
        }
    }

    /// Complete every waiter on `object_id`. Returns how many were waiting.
    pub fn resolve(&mut self, object_id: &str, acquired: bool) -> usize {
        let Some(pending) = self.waiting.remove(object_id) else {
            return 0;
        };
        let count = pending.replies.len();
        for reply in pending.replies {
            // The caller may have stopped waiting; that is fine.
            let _ = reply.send(acquired);
        }
        count
    }

    /// Complete, with success, every waiter whose object the table now
    /// shows as locally held.
    pub fn resolve_granted(&mut self, table: &LockTable) -> Vec<ObjectId> {
        let granted: Vec<ObjectId> = self
            .waiting
            .keys()
            .filter(|object_id| table.is_held_locally(object_id))
            .cloned()
            .collect();
        for object_id in &granted {
            self.resolve(object_id, true);
        }
        granted
    }

    /// Complete every waiter whose deadline has passed.
    ///
    /// The deadline is soft: a grant that landed just before the check
    /// still counts as success.
    pub fn expire(&mut self, now: Instant, table: &LockTable) -> Vec<(ObjectId, bool)> {
        let expired: Vec<ObjectId> = self
            .waiting
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(object_id, _)| object_id.clone())
            .collect();
        expired
            .into_iter()
            .map(|object_id| {
                let acquired = table.is_held_locally(&object_id);
                self.resolve(&object_id, acquired);
                (object_id, acquired)
            })
            .collect()
    }

    /// Earliest deadline among outstanding requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().map(|p| p.deadline).min()
    }

    /// Complete everything with the same outcome (teardown).
    pub fn resolve_all(&mut self, acquired: bool) -> usize {
        let objects: Vec<ObjectId> = self.waiting.keys().cloned().collect();
        objects
            .iter()
            .map(|object_id| self.resolve(object_id, acquired))
            .sum()
    }

    pub fn is_pending(&self, object_id: &str) -> bool {
        self.waiting.contains_key(object_id)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
