//! # atelier-collab: Realtime collaboration client core
//!
//! Keeps a design editor in sync with other people working on the same
//! project: who is here, where their cursors are, who holds which object,
//! and what changed on the canvas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  /ws/canvas/{project}/    ┌─────────────┐
//! │              │ ◄───────────────────────► │             │
//! │ CollabSession│                           │   Server    │
//! │  (actor)     │ ◄───────────────────────► │  (fan-out)  │
//! └──┬────┬───┬──┘  /ws/presence/{project}/  └─────────────┘
//!    │    │   │
//!    │    │   └──► EventBridge ──► host (element / operation events)
//!    │    ▼
//!    │  LockTable ──────────────┐
//!    ▼                          ├──► views (cursor overlay, status
//!  CollaboratorRegistry ────────┘        indicator, avatar stack)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON frame codec with field-name normalization
//! - [`presence`]: Collaborator registry, cursor colors, cursor coalescing
//! - [`locks`]: Object lock table and pending lock requests
//! - [`client`]: Session actor: connections, reconnects, routing
//! - [`bridge`]: Session events for the rendering surface
//! - [`transport`]: Socket seam with the tokio-tungstenite implementation
//! - [`views`]: Pure presentation adapters
//! - [`config`] / [`error`]: Settings and the shared error type
//!
//! ## Timing
//!
//! | Behavior | Default |
//! |----------|---------|
//! | Reconnect after abnormal close | 3 s |
//! | Presence heartbeat | 30 s |
//! | Outbound cursor coalescing | 50 ms |
//! | Lock request soft timeout | 2 s |
//! | Socket handshake timeout | 10 s |

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod transport;
pub mod views;

// Re-exports for convenience
pub use bridge::{EventBridge, SessionEvent};
pub use client::{ChannelStatus, CollabSession, ConnectionState};
pub use config::CollabConfig;
pub use error::CollabError;
pub use locks::{LockTable, PendingLocks};
pub use presence::{Collaborator, CollaboratorRegistry, CursorColor, CursorThrottle};
pub use protocol::{
    decode_canvas, decode_presence, CanvasMessage, Channel, ElementChange, ObjectId,
    OutboundFrame, PeerId, PeerSnapshot, PresenceMessage, UserIdentity, Vec2,
};
pub use transport::{Connector, Transport, TransportEvent, WsConnector, WsTransport};
pub use views::{
    avatar_stack, connection_indicator, cursor_overlay, AvatarChip, AvatarStack,
    ConnectionIndicator, CursorMarker, LinkStatus,
};
