//! Relay from the session to the rendering surface.
//!
//! ```text
//!  canvas socket ─► decode ─► session actor ─► EventBridge ─► mpsc ─► host
//!                                  │
//!                                  └─ element_* / canvas_operation are
//!                                     never interpreted here, only relayed
//! ```
//!
//! Nothing here ever waits on the host. Relayed canvas traffic
//! ([`EventBridge::emit`]) is delivered in inbound order, exactly once:
//! when the channel is full it queues in a backlog that the session
//! flushes as room appears. State notifications ([`EventBridge::notify`])
//! are dropped when the channel is full or a backlog exists, since the
//! host can always re-read the state they point at. A host that drops
//! the receiver just stops getting events.

use std::collections::VecDeque;
use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::ConnectionState;
use crate::protocol::{Channel, ElementChange, ObjectId, PeerId};

/// Everything the session tells its host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `element_create` / `element_update` / `element_delete`, raw frame.
    CanvasUpdate {
        change: ElementChange,
        message: Value,
    },
    /// Raw `canvas_operation` payload from a peer.
    CanvasOperation(Value),
    /// The server refused a lock request.
    LockDenied {
        object_id: ObjectId,
        locked_by: Option<PeerId>,
    },
    /// A channel moved to a new connection state.
    ConnectionChanged {
        channel: Channel,
        state: ConnectionState,
    },
    /// The collaborator registry changed; re-render presence views.
    CollaboratorsChanged,
    /// The lock table changed.
    LocksChanged,
}

/// What [`EventBridge::room`] resolves to: a reserved slot, or an error
/// once the receiver is gone.
pub(crate) type Room = Result<mpsc::OwnedPermit<SessionEvent>, mpsc::error::SendError<()>>;

/// Sending half of the session event channel.
///
/// Never waits on the host. Relayed events that do not fit are kept in a
/// local backlog and handed over, oldest first, as the host makes room.
pub struct EventBridge {
    tx: mpsc::Sender<SessionEvent>,
    backlog: VecDeque<SessionEvent>,
    receiver_gone: bool,
}

impl EventBridge {
    /// Create a bridge and the receiver the host drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                backlog: VecDeque::new(),
                receiver_gone: false,
            },
            rx,
        )
    }

    /// Deliver one relayed event, exactly once and in order.
    pub fn emit(&mut self, event: SessionEvent) {
        if self.receiver_gone {
            return;
        }
        if !self.backlog.is_empty() {
            self.backlog.push_back(event);
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::debug!("Event channel full; holding relayed events until the host catches up");
                self.backlog.push_back(event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.receiver_dropped(),
        }
    }

    /// Deliver a state notification if there is room, otherwise drop it.
    pub fn notify(&mut self, event: SessionEvent) {
        if self.receiver_gone {
            return;
        }
        if !self.backlog.is_empty() {
            log::trace!("Relays are backlogged; dropping {event:?}");
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::trace!("Event channel full; dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.receiver_dropped(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.receiver_gone || self.tx.is_closed()
    }

    /// Relayed events still waiting for the host.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Resolves once the channel can take one more event. Owns its own
    /// sender, so it can sit in a `select!` next to `&mut self` handlers.
    pub(crate) fn room(&self) -> impl Future<Output = Room> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.reserve_owned().await }
    }

    /// Move as much of the backlog into the channel as fits.
    pub(crate) fn flush(&mut self, room: Room) {
        let Ok(permit) = room else {
            self.receiver_dropped();
            return;
        };
        match self.backlog.pop_front() {
            Some(event) => {
                permit.send(event);
            }
            None => return,
        }
        while let Some(event) = self.backlog.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.receiver_dropped();
                    return;
                }
            }
        }
        log::debug!("Event backlog drained");
    }

    fn receiver_dropped(&mut self) {
        if !self.receiver_gone {
            log::debug!("Session event receiver dropped; further events are discarded");
        }
        self.receiver_gone = true;
        self.backlog.clear();
    }
}
