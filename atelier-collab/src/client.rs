//! Collaboration session: two sockets, one writer.
//!
//! Provides:
//! - Connection lifecycle for the canvas and presence channels
//! - Reconnection after abnormal closes, on one replaceable timer
//! - Inbound routing into the collaborator registry, lock table and bridge
//! - Outbound framing, cursor coalescing and presence heartbeat
//! - The lock request protocol (the only call that suspends)
//!
//! ## Shape
//!
//! ```text
//!  CollabSession (handle)                      host / rendering surface
//!     │ Command (unbounded mpsc)                        ▲
//!     ▼                                                 │ SessionEvent
//!  SessionActor ── select! ─┬─ commands                 │
//!     │                     ├─ socket events ───────► EventBridge
//!     │ writes              ├─ heartbeat interval
//!     ▼                     ├─ reconnect timer
//!  SharedState (RwLock)     ├─ cursor flush timer
//!     ▲ reads               ├─ lock deadlines
//!     │                     └─ room for backlogged events
//!     │
//!  CollabSession views
//!
//!  per channel:  drive_socket task ◄── SocketCommand ── actor
//!                      │ Transport (Connector)
//!                      └── SocketEvent{channel, epoch, signal} ──► actor
//! ```
//!
//! ## Channel state machine
//!
//! ```text
//! Disconnected ──open──► Connecting ──opened──► Connected
//!      ▲                     │                      │
//!      │                     └──failed──► Error ◄───┤ transport error
//!      │                                   │        │
//!      └──────── close 1000 (terminal) ────┼────────┤
//!                                          │        │ close ≠ 1000
//!                        reconnect timer ◄─┴────────┘
//!                              │ (fixed delay, one timer, replaced)
//!                              └──► Connecting
//! ```
//!
//! Every socket carries an epoch. Events from an epoch the actor has
//! already replaced or closed are dropped, so nothing that happens on a
//! torn-down socket can touch session state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior};

use crate::bridge::{EventBridge, SessionEvent};
use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::locks::{LockTable, PendingLocks};
use crate::presence::{Collaborator, CollaboratorRegistry, CursorThrottle};
use crate::protocol::{
    self, CanvasMessage, Channel, ObjectId, OutboundFrame, PeerId, PresenceMessage, UserIdentity,
    Vec2,
};
use crate::transport::{Connector, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL};

/// How long teardown waits for a socket task to flush its close frame.
const SOCKET_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// ───────────────────────────────────────────────────────────────────
// Public state types
// ───────────────────────────────────────────────────────────────────

/// Per-channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        })
    }
}

/// State plus the last human-readable error of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
        }
    }
}

/// What the actor publishes for the handle's read-only views.
struct SharedState {
    canvas: ChannelStatus,
    presence: ChannelStatus,
    collaborators: CollaboratorRegistry,
    locks: LockTable,
}

impl SharedState {
    fn new(local_user_id: &str) -> Self {
        Self {
            canvas: ChannelStatus::default(),
            presence: ChannelStatus::default(),
            collaborators: CollaboratorRegistry::new(local_user_id),
            locks: LockTable::new(local_user_id),
        }
    }

    fn status(&self, channel: Channel) -> &ChannelStatus {
        match channel {
            Channel::Canvas => &self.canvas,
            Channel::Presence => &self.presence,
        }
    }

    fn status_mut(&mut self, channel: Channel) -> &mut ChannelStatus {
        match channel {
            Channel::Canvas => &mut self.canvas,
            Channel::Presence => &mut self.presence,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

enum Command {
    Cursor(Vec2),
    Selection(Vec<ObjectId>),
    Operation(Value),
    RequestLock {
        object_id: ObjectId,
        reply: oneshot::Sender<bool>,
    },
    ReleaseLock(ObjectId),
    Reconnect,
    Shutdown,
}

/// A live collaboration session for one project.
///
/// Construct with [`CollabSession::new`], take the event receiver, then
/// [`connect`](CollabSession::connect). Dropping the handle tears the
/// session down; [`disconnect`](CollabSession::disconnect) does the same
/// and waits for it.
pub struct CollabSession {
    config: CollabConfig,
    local_user: UserIdentity,
    project_id: String,
    connector: Arc<dyn Connector>,
    shared: Arc<RwLock<SharedState>>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<EventBridge>>,
    /// Held here while no actor is running.
    bridge: Option<EventBridge>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl CollabSession {
    /// Create a session. Nothing is opened until [`connect`](Self::connect).
    pub fn new(
        config: CollabConfig,
        local_user: UserIdentity,
        project_id: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (bridge, event_rx) = EventBridge::channel(config.event_capacity);
        let shared = Arc::new(RwLock::new(SharedState::new(&local_user.id)));
        Self {
            config,
            local_user,
            project_id: project_id.into(),
            connector,
            shared,
            cmd_tx: None,
            task: None,
            bridge: Some(bridge),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Open both channels. No-op while the session is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) {
        if self.is_running() {
            return;
        }
        let Some(bridge) = self.bridge.take() else {
            log::warn!("Session for project {} has no event bridge; not connecting", self.project_id);
            return;
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(
            self.config.clone(),
            self.local_user.clone(),
            self.project_id.clone(),
            self.connector.clone(),
            self.shared.clone(),
            bridge,
            cmd_rx,
        );
        self.cmd_tx = Some(cmd_tx);
        self.task = Some(tokio::spawn(actor.run()));
        log::info!(
            "Collaboration session started for project {} as {}",
            self.project_id,
            self.local_user.id
        );
    }

    /// Deliberate teardown: leave, close both sockets with 1000, cancel
    /// timers, fail pending lock requests. Waits for the actor to finish.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(bridge) => self.bridge = Some(bridge),
                Err(e) => log::error!("Session actor for project {} failed: {e}", self.project_id),
            }
        }
    }

    /// Close live sockets and reopen both channels now, clearing errors.
    ///
    /// After [`disconnect`](Self::disconnect) (or before the first
    /// connect) this starts the session like [`connect`](Self::connect).
    pub fn reconnect(&mut self) {
        if self.is_running() {
            self.command(Command::Reconnect);
        } else {
            self.connect();
        }
    }

    /// Record the local cursor. Coalesced to one frame per flush window.
    pub fn update_cursor(&self, x: f64, y: f64) {
        self.command(Command::Cursor(Vec2::new(x, y)));
    }

    /// Broadcast the local selection.
    pub fn update_selection(&self, object_ids: Vec<ObjectId>) {
        self.command(Command::Selection(object_ids));
    }

    /// Broadcast a canvas operation. Fire-and-forget.
    pub fn send_operation(&self, operation: Value) {
        self.command(Command::Operation(operation));
    }

    /// Ask for an exclusive edit lock.
    ///
    /// Resolves `true` if the object is (or becomes) held by the local user,
    /// `false` on denial, timeout, contention or a closed canvas channel.
    /// Never fails.
    pub async fn request_lock(&self, object_id: impl Into<ObjectId>) -> bool {
        let Some(tx) = &self.cmd_tx else {
            return false;
        };
        let (reply, outcome) = oneshot::channel();
        let request = Command::RequestLock {
            object_id: object_id.into(),
            reply,
        };
        if tx.send(request).is_err() {
            return false;
        }
        outcome.await.unwrap_or(false)
    }

    /// Ask the server to release a lock. The table changes only when the
    /// server confirms.
    pub fn release_lock(&self, object_id: impl Into<ObjectId>) {
        self.command(Command::ReleaseLock(object_id.into()));
    }

    fn command(&self, command: Command) {
        match &self.cmd_tx {
            Some(tx) => {
                if tx.send(command).is_err() {
                    log::debug!("Session for project {} is closed; command dropped", self.project_id);
                }
            }
            None => log::debug!("Session for project {} not connected; command dropped", self.project_id),
        }
    }

    // ── Read-only views ─────────────────────────────────────────

    pub async fn connection_state(&self, channel: Channel) -> ConnectionState {
        self.shared.read().await.status(channel).state
    }

    pub async fn channel_status(&self, channel: Channel) -> ChannelStatus {
        self.shared.read().await.status(channel).clone()
    }

    /// Every registered peer, ordered by id.
    pub async fn collaborators(&self) -> Vec<Collaborator> {
        let shared = self.shared.read().await;
        let mut all: Vec<Collaborator> = shared.collaborators.iter().cloned().collect();
        all.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        all
    }

    /// Active peers, ordered by id. Never includes the local user.
    pub async fn active_collaborators(&self) -> Vec<Collaborator> {
        let shared = self.shared.read().await;
        shared
            .collaborators
            .active_collaborators()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn lock_owner(&self, object_id: &str) -> Option<PeerId> {
        self.shared.read().await.locks.owner(object_id).map(str::to_owned)
    }

    pub async fn locks(&self) -> HashMap<ObjectId, PeerId> {
        self.shared.read().await.locks.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn local_user(&self) -> &UserIdentity {
        &self.local_user
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }
}

// ───────────────────────────────────────────────────────────────────
// Per-socket task
// ───────────────────────────────────────────────────────────────────

enum SocketCommand {
    Send(String),
    Close(u16),
}

#[derive(Debug)]
enum SocketSignal {
    Opened,
    Frame(String),
    Failed(String),
    Closed(u16),
}

#[derive(Debug)]
struct SocketEvent {
    channel: Channel,
    epoch: u64,
    signal: SocketSignal,
}

/// Open one transport and shuttle frames until it closes.
async fn drive_socket(
    connector: Arc<dyn Connector>,
    url: String,
    channel: Channel,
    epoch: u64,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let signal = |signal: SocketSignal| {
        let _ = events.send(SocketEvent { channel, epoch, signal });
    };

    let connected = tokio::time::timeout(connect_timeout, connector.connect(&url))
        .await
        .unwrap_or_else(|_| {
            Err(CollabError::Connect {
                url: url.clone(),
                reason: format!("no handshake within {connect_timeout:?}"),
            })
        });
    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            signal(SocketSignal::Failed(e.to_string()));
            signal(SocketSignal::Closed(CLOSE_ABNORMAL));
            return;
        }
    };
    signal(SocketSignal::Opened);

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Send(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        signal(SocketSignal::Failed(e.to_string()));
                        signal(SocketSignal::Closed(CLOSE_ABNORMAL));
                        break;
                    }
                }
                Some(SocketCommand::Close(code)) => {
                    if let Err(e) = transport.close(code).await {
                        log::debug!("Closing {channel} socket: {e}");
                    }
                    break;
                }
                // Actor dropped this socket without an explicit close.
                None => {
                    let _ = transport.close(CLOSE_NORMAL).await;
                    break;
                }
            },
            incoming = transport.recv() => match incoming {
                Some(Ok(TransportEvent::Text(text))) => signal(SocketSignal::Frame(text)),
                Some(Ok(TransportEvent::Closed(code))) => {
                    signal(SocketSignal::Closed(code));
                    break;
                }
                Some(Err(e)) => {
                    signal(SocketSignal::Failed(e.to_string()));
                    signal(SocketSignal::Closed(CLOSE_ABNORMAL));
                    break;
                }
                None => {
                    signal(SocketSignal::Closed(CLOSE_ABNORMAL));
                    break;
                }
            },
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

/// Actor-side bookkeeping for one channel. Epoch 0 means no live socket.
struct SocketSlot {
    state: ConnectionState,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<SocketCommand>>,
    task: Option<JoinHandle<()>>,
    /// Set by an abnormal close; the reconnect timer reopens these.
    wants_reconnect: bool,
}

impl SocketSlot {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            outbound: None,
            task: None,
            wants_reconnect: false,
        }
    }
}

struct SessionActor {
    config: CollabConfig,
    local_user: UserIdentity,
    project_id: String,
    connector: Arc<dyn Connector>,
    shared: Arc<RwLock<SharedState>>,
    bridge: EventBridge,
    commands: mpsc::UnboundedReceiver<Command>,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    canvas: SocketSlot,
    presence: SocketSlot,
    last_epoch: u64,
    reconnect_at: Option<Instant>,
    cursor: CursorThrottle,
    pending_locks: PendingLocks,
    heartbeat: Interval,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SessionActor {
    fn new(
        config: CollabConfig,
        local_user: UserIdentity,
        project_id: String,
        connector: Arc<dyn Connector>,
        shared: Arc<RwLock<SharedState>>,
        bridge: EventBridge,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let period = config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cursor = CursorThrottle::new(config.cursor_flush_interval);

        Self {
            config,
            local_user,
            project_id,
            connector,
            shared,
            bridge,
            commands,
            socket_tx,
            socket_rx,
            canvas: SocketSlot::new(),
            presence: SocketSlot::new(),
            last_epoch: 0,
            reconnect_at: None,
            cursor,
            pending_locks: PendingLocks::new(),
            heartbeat,
        }
    }

    async fn run(mut self) -> EventBridge {
        for channel in Channel::ALL {
            self.open(channel).await;
        }

        loop {
            let reconnect = sleep_until_opt(self.reconnect_at);
            let cursor_flush = sleep_until_opt(self.cursor.deadline());
            let lock_deadline = sleep_until_opt(self.pending_locks.next_deadline());
            let backlogged = self.bridge.has_backlog();

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = self.socket_rx.recv() => self.handle_socket_event(event).await,
                _ = self.heartbeat.tick() => self.send_heartbeat(),
                _ = reconnect => {
                    self.reconnect_at = None;
                    self.reopen_dropped().await;
                }
                _ = cursor_flush => self.flush_cursor(),
                _ = lock_deadline => self.expire_locks().await,
                room = self.bridge.room(), if backlogged => self.bridge.flush(room),
            }
        }

        self.teardown().await;
        self.bridge
    }

    fn slot(&self, channel: Channel) -> &SocketSlot {
        match channel {
            Channel::Canvas => &self.canvas,
            Channel::Presence => &self.presence,
        }
    }

    fn slot_mut(&mut self, channel: Channel) -> &mut SocketSlot {
        match channel {
            Channel::Canvas => &mut self.canvas,
            Channel::Presence => &mut self.presence,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────

    async fn set_state(&mut self, channel: Channel, state: ConnectionState, error: Option<String>) {
        let changed = {
            let mut shared = self.shared.write().await;
            let status = shared.status_mut(channel);
            let changed = status.state != state || status.last_error != error;
            status.state = state;
            status.last_error = error;
            changed
        };
        self.slot_mut(channel).state = state;
        if changed {
            log::info!("{channel} channel for project {}: {state}", self.project_id);
            self.bridge
                .notify(SessionEvent::ConnectionChanged { channel, state });
        }
    }

    /// Start a fresh socket for `channel`, abandoning any previous one.
    async fn open(&mut self, channel: Channel) {
        let _previous = self.close_socket(channel, CLOSE_NORMAL);

        self.last_epoch += 1;
        let epoch = self.last_epoch;
        let url = self.config.channel_url(channel, &self.project_id);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        log::debug!("Opening {channel} socket (epoch {epoch}): {url}");
        let task = tokio::spawn(drive_socket(
            self.connector.clone(),
            url,
            channel,
            epoch,
            self.config.connect_timeout,
            out_rx,
            self.socket_tx.clone(),
        ));

        let slot = self.slot_mut(channel);
        slot.epoch = epoch;
        slot.outbound = Some(out_tx);
        slot.task = Some(task);
        slot.wants_reconnect = false;
        self.set_state(channel, ConnectionState::Connecting, None).await;
    }

    /// Detach the live socket of `channel`, asking it to close with `code`.
    fn close_socket(&mut self, channel: Channel, code: u16) -> Option<JoinHandle<()>> {
        let slot = self.slot_mut(channel);
        slot.epoch = 0;
        if let Some(out) = slot.outbound.take() {
            let _ = out.send(SocketCommand::Close(code));
        }
        slot.task.take()
    }

    fn schedule_reconnect(&mut self) {
        let at = Instant::now() + self.config.reconnect_delay;
        if self.reconnect_at.replace(at).is_some() {
            log::debug!("Replacing pending reconnect for project {}", self.project_id);
        }
        log::info!(
            "Reconnecting project {} in {:?}",
            self.project_id,
            self.config.reconnect_delay
        );
    }

    async fn reopen_dropped(&mut self) {
        for channel in Channel::ALL {
            if self.slot(channel).wants_reconnect && self.slot(channel).epoch == 0 {
                self.open(channel).await;
            }
        }
    }

    async fn manual_reconnect(&mut self) {
        log::info!("Manual reconnect for project {}", self.project_id);
        self.reconnect_at = None;
        for channel in Channel::ALL {
            self.open(channel).await;
        }
    }

    async fn teardown(&mut self) {
        self.send(OutboundFrame::Leave);
        let tasks: Vec<JoinHandle<()>> = Channel::ALL
            .into_iter()
            .filter_map(|channel| self.close_socket(channel, CLOSE_NORMAL))
            .collect();

        self.reconnect_at = None;
        self.cursor.clear();
        let failed = self.pending_locks.resolve_all(false);
        if failed > 0 {
            log::debug!("Teardown failed {failed} pending lock request(s)");
        }
        for channel in Channel::ALL {
            self.slot_mut(channel).wants_reconnect = false;
            self.set_state(channel, ConnectionState::Disconnected, None).await;
        }

        for task in tasks {
            if tokio::time::timeout(SOCKET_SHUTDOWN_GRACE, task).await.is_err() {
                log::debug!("Socket task did not finish within {SOCKET_SHUTDOWN_GRACE:?}");
            }
        }
        log::info!("Collaboration session for project {} closed", self.project_id);
    }

    // ── Socket events ───────────────────────────────────────────

    async fn handle_socket_event(&mut self, event: SocketEvent) {
        let SocketEvent { channel, epoch, signal } = event;
        if epoch != self.slot(channel).epoch {
            log::trace!("Ignoring {signal:?} from stale {channel} socket (epoch {epoch})");
            return;
        }

        match signal {
            SocketSignal::Opened => {
                self.set_state(channel, ConnectionState::Connected, None).await;
                let user = self.local_user.clone();
                let announce = match channel {
                    Channel::Canvas => OutboundFrame::Join { user },
                    Channel::Presence => OutboundFrame::Online { user },
                };
                self.send(announce);
            }
            SocketSignal::Frame(text) => {
                log::trace!("{channel} <- {text}");
                match channel {
                    Channel::Canvas => self.handle_canvas_frame(&text).await,
                    Channel::Presence => self.handle_presence_frame(&text).await,
                }
            }
            SocketSignal::Failed(message) => {
                log::warn!("{channel} socket for project {}: {message}", self.project_id);
                self.set_state(channel, ConnectionState::Error, Some(message)).await;
            }
            SocketSignal::Closed(code) => {
                let slot = self.slot_mut(channel);
                slot.epoch = 0;
                slot.outbound = None;
                slot.task = None;

                if code == CLOSE_NORMAL {
                    log::info!("{channel} socket closed normally");
                    self.set_state(channel, ConnectionState::Disconnected, None).await;
                } else {
                    log::warn!("{channel} socket closed abnormally (code {code})");
                    if self.slot(channel).state != ConnectionState::Error {
                        self.set_state(channel, ConnectionState::Disconnected, None).await;
                    }
                    self.slot_mut(channel).wants_reconnect = true;
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn log_decode_error(channel: Channel, error: &CollabError) {
        match error {
            CollabError::MissingField { .. } => log::debug!("Dropping {channel} frame: {error}"),
            _ => log::warn!("Dropping undecodable {channel} frame: {error}"),
        }
    }

    async fn handle_canvas_frame(&mut self, text: &str) {
        match protocol::decode_canvas(text) {
            Ok(Some(msg)) => self.apply_canvas(msg).await,
            Ok(None) => log::trace!("Ignoring unknown canvas frame"),
            Err(e) => Self::log_decode_error(Channel::Canvas, &e),
        }
    }

    async fn handle_presence_frame(&mut self, text: &str) {
        match protocol::decode_presence(text) {
            Ok(Some(msg)) => self.apply_presence(msg).await,
            Ok(None) => log::trace!("Ignoring unknown presence frame"),
            Err(e) => Self::log_decode_error(Channel::Presence, &e),
        }
    }

    async fn apply_canvas(&mut self, msg: CanvasMessage) {
        let now = Instant::now();
        match msg {
            CanvasMessage::UserJoined(user) => {
                let joined = self.shared.write().await.collaborators.upsert_from_join(user, now);
                if joined {
                    self.bridge.notify(SessionEvent::CollaboratorsChanged);
                }
            }
            CanvasMessage::UserLeft { peer_id } => {
                let (left, freed) = {
                    let mut shared = self.shared.write().await;
                    let left = shared.collaborators.remove(&peer_id).is_some();
                    (left, shared.locks.release_peer(&peer_id))
                };
                if left {
                    self.bridge.notify(SessionEvent::CollaboratorsChanged);
                }
                if !freed.is_empty() {
                    log::debug!("Peer {peer_id} left holding {} lock(s)", freed.len());
                    self.bridge.notify(SessionEvent::LocksChanged);
                }
            }
            CanvasMessage::CursorUpdate { peer_id, position } => {
                self.apply_cursor(&peer_id, position, now).await;
            }
            CanvasMessage::SelectionChange { peer_id, object_ids } => {
                self.apply_selection(&peer_id, object_ids, now).await;
            }
            CanvasMessage::Element { change, message } => {
                self.bridge.emit(SessionEvent::CanvasUpdate { change, message });
            }
            CanvasMessage::Operation(operation) => {
                self.bridge.emit(SessionEvent::CanvasOperation(operation));
            }
            CanvasMessage::ObjectLocked { object_id, peer_id } => {
                self.shared.write().await.locks.apply_grant(object_id, peer_id);
                self.after_lock_change().await;
            }
            CanvasMessage::ObjectUnlocked { object_id } => {
                self.shared.write().await.locks.apply_revoke(&object_id);
                self.after_lock_change().await;
            }
            CanvasMessage::LockDenied { object_id, locked_by } => {
                let waiting = self.pending_locks.resolve(&object_id, false);
                log::debug!("Lock on {object_id} denied ({waiting} waiting)");
                self.bridge.emit(SessionEvent::LockDenied { object_id, locked_by });
            }
            CanvasMessage::SyncState { collaborators, locked_objects } => {
                {
                    let mut shared = self.shared.write().await;
                    if let Some(list) = collaborators.clone() {
                        shared.collaborators.apply_presence_snapshot(list, now);
                    }
                    if let Some(owners) = locked_objects.clone() {
                        shared.locks.apply_snapshot(owners);
                    }
                }
                if collaborators.is_some() {
                    self.bridge.notify(SessionEvent::CollaboratorsChanged);
                }
                if locked_objects.is_some() {
                    self.after_lock_change().await;
                }
            }
        }
    }

    async fn apply_presence(&mut self, msg: PresenceMessage) {
        let now = Instant::now();
        match msg {
            PresenceMessage::Online(user) => {
                let joined = self.shared.write().await.collaborators.upsert_from_join(user, now);
                if joined {
                    self.bridge.notify(SessionEvent::CollaboratorsChanged);
                }
            }
            PresenceMessage::Offline { peer_id } => {
                let changed = self.shared.write().await.collaborators.mark_offline(&peer_id, now);
                if changed {
                    self.bridge.notify(SessionEvent::CollaboratorsChanged);
                }
            }
            PresenceMessage::Snapshot(list) => {
                self.shared
                    .write()
                    .await
                    .collaborators
                    .apply_presence_snapshot(list, now);
                self.bridge.notify(SessionEvent::CollaboratorsChanged);
            }
            PresenceMessage::CursorUpdate { peer_id, position } => {
                self.apply_cursor(&peer_id, position, now).await;
            }
            PresenceMessage::SelectionChange { peer_id, object_ids } => {
                self.apply_selection(&peer_id, object_ids, now).await;
            }
            PresenceMessage::Heartbeat => {}
        }
    }

    async fn apply_cursor(&mut self, peer_id: &str, position: Vec2, now: Instant) {
        let applied = self
            .shared
            .write()
            .await
            .collaborators
            .apply_cursor(peer_id, position, now);
        if applied {
            self.bridge.notify(SessionEvent::CollaboratorsChanged);
        } else {
            log::trace!("Cursor update for unknown peer {peer_id} dropped");
        }
    }

    async fn apply_selection(&mut self, peer_id: &str, object_ids: Vec<ObjectId>, now: Instant) {
        let applied = self
            .shared
            .write()
            .await
            .collaborators
            .apply_selection(peer_id, object_ids, now);
        if applied {
            self.bridge.notify(SessionEvent::CollaboratorsChanged);
        } else {
            log::trace!("Selection update for unknown peer {peer_id} dropped");
        }
    }

    /// Resolve waiters the new table satisfies and tell the host.
    async fn after_lock_change(&mut self) {
        let granted = {
            let shared = self.shared.read().await;
            self.pending_locks.resolve_granted(&shared.locks)
        };
        for object_id in granted {
            log::debug!("Lock on {object_id} granted");
        }
        self.bridge.notify(SessionEvent::LocksChanged);
    }

    async fn expire_locks(&mut self) {
        let now = Instant::now();
        let outcomes = {
            let shared = self.shared.read().await;
            self.pending_locks.expire(now, &shared.locks)
        };
        for (object_id, acquired) in outcomes {
            log::debug!("Lock request for {object_id} timed out (acquired: {acquired})");
        }
    }

    // ── Commands ────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Cursor(position) => self.cursor.record(position, Instant::now()),
            Command::Selection(object_ids) => {
                self.send(OutboundFrame::SelectionChange { object_ids });
            }
            Command::Operation(operation) => {
                let operation = self.stamp_operation(operation);
                self.send(OutboundFrame::CanvasOperation { operation });
            }
            Command::RequestLock { object_id, reply } => self.request_lock(object_id, reply).await,
            Command::ReleaseLock(object_id) => {
                self.send(OutboundFrame::UnlockObject { object_id });
            }
            Command::Reconnect => self.manual_reconnect().await,
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    async fn request_lock(&mut self, object_id: ObjectId, reply: oneshot::Sender<bool>) {
        let fast = self.shared.read().await.locks.fast_path(&object_id);
        if let Some(acquired) = fast {
            let _ = reply.send(acquired);
            return;
        }
        if self.canvas.state != ConnectionState::Connected {
            log::debug!("Lock request for {object_id} while canvas is {}", self.canvas.state);
            let _ = reply.send(false);
            return;
        }

        let deadline = Instant::now() + self.config.lock_timeout;
        if self.pending_locks.register(object_id.clone(), reply, deadline) {
            self.send(OutboundFrame::LockObject { object_id });
        }
    }

    /// Add `userId` and `timestamp` unless the caller already set them.
    fn stamp_operation(&self, mut operation: Value) -> Value {
        if let Some(fields) = operation.as_object_mut() {
            fields
                .entry("userId")
                .or_insert_with(|| Value::String(self.local_user.id.clone()));
            fields
                .entry("timestamp")
                .or_insert_with(|| Value::from(unix_millis()));
        }
        operation
    }

    fn flush_cursor(&mut self) {
        if let Some(position) = self.cursor.take_due(Instant::now()) {
            self.send(OutboundFrame::CursorUpdate { position });
        }
    }

    fn send_heartbeat(&mut self) {
        if self.presence.state == ConnectionState::Connected {
            self.send(OutboundFrame::Heartbeat);
        }
    }

    /// Fire-and-forget. Dropped unless the frame's channel is connected.
    fn send(&mut self, frame: OutboundFrame) -> bool {
        let channel = frame.channel();
        let slot = self.slot(channel);
        if slot.state != ConnectionState::Connected {
            log::debug!("Dropping {} frame: {channel} is {}", frame.kind(), slot.state);
            return false;
        }
        let Some(out) = &slot.outbound else {
            return false;
        };
        match frame.encode() {
            Ok(text) => {
                log::trace!("{channel} -> {text}");
                out.send(SocketCommand::Send(text)).is_ok()
            }
            Err(e) => {
                log::warn!("Failed to encode {} frame: {e}", frame.kind());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ElementChange;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    // ── Scripted transport ───────────────────────────────────────

    #[derive(Debug, PartialEq)]
    enum Sent {
        Text(String),
        Close(u16),
    }

    struct MockTransport {
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        sent: mpsc::UnboundedSender<Sent>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: String) -> Result<(), CollabError> {
            self.sent
                .send(Sent::Text(frame))
                .map_err(|_| CollabError::Transport("peer gone".into()))
        }

        async fn recv(&mut self) -> Option<Result<TransportEvent, CollabError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self, code: u16) -> Result<(), CollabError> {
            let _ = self.sent.send(Sent::Close(code));
            Ok(())
        }
    }

    /// The server's end of one mock socket.
    struct ServerEnd {
        url: String,
        inbound: mpsc::UnboundedSender<TransportEvent>,
        sent: mpsc::UnboundedReceiver<Sent>,
    }

    impl ServerEnd {
        fn push(&self, frame: Value) {
            self.inbound.send(TransportEvent::Text(frame.to_string())).unwrap();
        }

        fn push_raw(&self, text: &str) {
            self.inbound.send(TransportEvent::Text(text.to_string())).unwrap();
        }

        fn close(&self, code: u16) {
            self.inbound.send(TransportEvent::Closed(code)).unwrap();
        }

        async fn next_sent(&mut self) -> Sent {
            self.sent.recv().await.expect("socket task ended")
        }

        async fn next_frame(&mut self) -> Value {
            match self.next_sent().await {
                Sent::Text(text) => serde_json::from_str(&text).unwrap(),
                Sent::Close(code) => panic!("expected frame, got close {code}"),
            }
        }

        fn drain(&mut self) -> Vec<Sent> {
            let mut out = Vec::new();
            while let Ok(sent) = self.sent.try_recv() {
                out.push(sent);
            }
            out
        }
    }

    struct MockConnector {
        attempts: StdMutex<Vec<String>>,
        accepted: mpsc::UnboundedSender<ServerEnd>,
        refuse: AtomicBool,
        /// Accept the attempt but never finish the handshake.
        hang: AtomicBool,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, CollabError> {
            self.attempts.lock().unwrap().push(url.to_string());
            if self.refuse.load(Ordering::SeqCst) {
                return Err(CollabError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".into(),
                });
            }
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let _ = self.accepted.send(ServerEnd {
                url: url.to_string(),
                inbound: in_tx,
                sent: sent_rx,
            });
            Ok(Box::new(MockTransport {
                inbound: in_rx,
                sent: sent_tx,
            }))
        }
    }

    struct Harness {
        session: CollabSession,
        events: mpsc::Receiver<SessionEvent>,
        connector: Arc<MockConnector>,
        accepted: mpsc::UnboundedReceiver<ServerEnd>,
    }

    impl Harness {
        fn new() -> Self {
            let (accepted_tx, accepted) = mpsc::unbounded_channel();
            let connector = Arc::new(MockConnector {
                attempts: StdMutex::new(Vec::new()),
                accepted: accepted_tx,
                refuse: AtomicBool::new(false),
                hang: AtomicBool::new(false),
            });
            let mut session = CollabSession::new(
                CollabConfig::with_base("ws://test"),
                UserIdentity::new("me", "Me"),
                "proj",
                connector.clone(),
            );
            let events = session.take_event_rx().unwrap();
            Self {
                session,
                events,
                connector,
                accepted,
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.connector.attempts.lock().unwrap().clone()
        }

        async fn accept(&mut self) -> ServerEnd {
            self.accepted.recv().await.expect("connector dropped")
        }

        /// Connect and return (canvas, presence) with announcements drained.
        async fn connect(&mut self) -> (ServerEnd, ServerEnd) {
            self.session.connect();
            let (mut canvas, mut presence) = self.accept_pair().await;
            assert_eq!(canvas.next_frame().await["type"], "join");
            assert_eq!(presence.next_frame().await["type"], "online");
            (canvas, presence)
        }

        async fn accept_pair(&mut self) -> (ServerEnd, ServerEnd) {
            let a = self.accept().await;
            let b = self.accept().await;
            if a.url.contains("/ws/canvas/") {
                (a, b)
            } else {
                (b, a)
            }
        }

        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    /// Let every task run to idle (virtual time advances by 1ms).
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // ── Lifecycle ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_open_announces_identity_on_both_channels() {
        let mut h = Harness::new();
        h.session.connect();
        let (mut canvas, mut presence) = h.accept_pair().await;

        assert_eq!(canvas.url, "ws://test/ws/canvas/proj/");
        assert_eq!(presence.url, "ws://test/ws/presence/proj/");
        assert_eq!(
            canvas.next_frame().await,
            json!({"type": "join", "user": {"id": "me", "name": "Me", "avatar": null}})
        );
        assert_eq!(
            presence.next_frame().await,
            json!({"type": "online", "user": {"id": "me", "name": "Me", "avatar": null}})
        );
        settle().await;
        assert_eq!(h.session.connection_state(Channel::Canvas).await, ConnectionState::Connected);
        assert_eq!(h.session.connection_state(Channel::Presence).await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let mut h = Harness::new();
        let _ends = h.connect().await;
        h.session.connect();
        settle().await;
        assert_eq!(h.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_after_delay() {
        let mut h = Harness::new();
        let (canvas, _presence) = h.connect().await;

        canvas.close(1006);
        settle().await;
        assert_eq!(
            h.session.connection_state(Channel::Canvas).await,
            ConnectionState::Disconnected
        );
        assert_eq!(h.attempts().len(), 2);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(h.attempts().len(), 2);

        let mut reopened = h.accept().await;
        assert!(reopened.url.contains("/ws/canvas/"));
        assert_eq!(h.attempts().len(), 3);
        assert_eq!(reopened.next_frame().await["type"], "join");
        settle().await;
        assert_eq!(h.session.connection_state(Channel::Canvas).await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_abnormal_closes_keep_one_timer() {
        let mut h = Harness::new();
        let (canvas, presence) = h.connect().await;

        canvas.close(1006);
        tokio::time::sleep(Duration::from_secs(1)).await;
        presence.close(1011);
        settle().await;

        // The first timer would have fired at ~3s; it was replaced.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.attempts().len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.attempts().len(), 4);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.attempts().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_is_terminal() {
        let mut h = Harness::new();
        let (canvas, _presence) = h.connect().await;

        canvas.close(1000);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            h.session.connection_state(Channel::Canvas).await,
            ConnectionState::Disconnected
        );
        assert_eq!(h.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_sets_error_then_retries() {
        let mut h = Harness::new();
        h.connector.refuse.store(true, Ordering::SeqCst);
        h.session.connect();
        settle().await;

        let status = h.session.channel_status(Channel::Canvas).await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.last_error.unwrap().contains("connection refused"));

        h.connector.refuse.store(false, Ordering::SeqCst);
        let (mut canvas, _presence) = h.accept_pair().await;
        assert_eq!(canvas.next_frame().await["type"], "join");
        assert_eq!(h.attempts().len(), 4);
        settle().await;
        let status = h.session.channel_status(Channel::Canvas).await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_sets_error_then_retries() {
        let mut h = Harness::new();
        h.connector.hang.store(true, Ordering::SeqCst);
        h.session.connect();

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert_eq!(h.session.connection_state(Channel::Canvas).await, ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = h.session.channel_status(Channel::Canvas).await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.last_error.unwrap().contains("no handshake"));
        assert_eq!(h.attempts().len(), 2);

        h.connector.hang.store(false, Ordering::SeqCst);
        let (mut canvas, _presence) = h.accept_pair().await;
        assert_eq!(canvas.next_frame().await["type"], "join");
        assert_eq!(h.attempts().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_bypasses_delay() {
        let mut h = Harness::new();
        let (mut canvas, mut presence) = h.connect().await;

        h.session.reconnect();
        let (_c2, _p2) = h.accept_pair().await;
        assert_eq!(h.attempts().len(), 4);
        assert_eq!(canvas.next_sent().await, Sent::Close(1000));
        assert_eq!(presence.next_sent().await, Sent::Close(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_cancels_pending_timer() {
        let mut h = Harness::new();
        let (canvas, _presence) = h.connect().await;
        canvas.close(1006);
        settle().await;

        h.session.reconnect();
        let _pair = h.accept_pair().await;
        assert_eq!(h.attempts().len(), 4);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.attempts().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_leaves_and_closes_normally() {
        let mut h = Harness::new();
        let (mut canvas, mut presence) = h.connect().await;

        h.session.disconnect().await;
        assert_eq!(canvas.next_frame().await, json!({"type": "leave"}));
        assert_eq!(canvas.next_sent().await, Sent::Close(1000));
        assert_eq!(presence.next_sent().await, Sent::Close(1000));
        assert!(!h.session.is_running());
        assert_eq!(
            h.session.connection_state(Channel::Canvas).await,
            ConnectionState::Disconnected
        );

        // No timers survive teardown.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_after_disconnect_restarts_session() {
        let mut h = Harness::new();
        let _ends = h.connect().await;
        h.session.disconnect().await;
        assert!(!h.session.is_running());

        h.session.reconnect();
        let (mut canvas, mut presence) = h.accept_pair().await;
        assert_eq!(canvas.next_frame().await["type"], "join");
        assert_eq!(presence.next_frame().await["type"], "online");
        assert!(h.session.is_running());
        assert_eq!(h.attempts().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_can_reconnect_after_disconnect() {
        let mut h = Harness::new();
        let _ends = h.connect().await;
        h.session.disconnect().await;

        let (canvas, _presence) = h.connect().await;
        canvas.push(json!({"type": "canvas_operation", "operation": {"op": "noop"}}));
        settle().await;
        let ops: Vec<SessionEvent> = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::CanvasOperation(_)))
            .collect();
        assert_eq!(ops, vec![SessionEvent::CanvasOperation(json!({"op": "noop"}))]);
    }

    // ── Outbound ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_cursor_updates_are_coalesced() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        for i in 0..10 {
            h.session.update_cursor(f64::from(i), 2.0 * f64::from(i));
        }
        settle().await;
        assert!(canvas.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let sent = canvas.drain();
        assert_eq!(sent.len(), 1);
        let Sent::Text(text) = &sent[0] else {
            panic!("expected text frame");
        };
        let frame: Value = serde_json::from_str(text).unwrap();
        assert_eq!(frame, json!({"type": "cursor_update", "position": {"x": 9.0, "y": 18.0}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_is_stamped() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        h.session.send_operation(json!({"op": "move", "id": "r1"}));
        let frame = canvas.next_frame().await;
        assert_eq!(frame["type"], "canvas_operation");
        assert_eq!(frame["operation"]["op"], "move");
        assert_eq!(frame["operation"]["userId"], "me");
        assert!(frame["operation"]["timestamp"].is_u64());

        h.session.send_operation(json!({"op": "x", "userId": "kept", "timestamp": 5}));
        let frame = canvas.next_frame().await;
        assert_eq!(frame["operation"]["userId"], "kept");
        assert_eq!(frame["operation"]["timestamp"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_and_unlock_frames() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        h.session.update_selection(vec!["a".into(), "b".into()]);
        assert_eq!(
            canvas.next_frame().await,
            json!({"type": "selection_change", "object_ids": ["a", "b"]})
        );

        h.session.release_lock("a");
        assert_eq!(canvas.next_frame().await, json!({"type": "unlock_object", "object_id": "a"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_on_presence_only() {
        let mut h = Harness::new();
        let (mut canvas, mut presence) = h.connect().await;

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(presence.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(presence.next_frame().await, json!({"type": "heartbeat"}));
        assert!(canvas.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_dropped_while_disconnected() {
        let mut h = Harness::new();
        let (canvas, mut presence) = h.connect().await;
        canvas.close(1000);
        settle().await;

        h.session.update_selection(vec!["a".into()]);
        h.session.send_operation(json!({"op": "x"}));
        settle().await;
        assert!(presence.drain().is_empty());
        assert_eq!(h.attempts().len(), 2);
    }

    // ── Inbound routing ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_scenario_sync_state_then_contended_lock() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        canvas.push(json!({
            "type": "sync_state",
            "collaborators": [{"id": "p2", "name": "Bob"}],
            "locked_objects": {"rect1": "p2"},
        }));
        settle().await;

        let collaborators = h.session.collaborators().await;
        assert_eq!(collaborators.len(), 1);
        assert_eq!(collaborators[0].id(), "p2");
        assert_eq!(collaborators[0].name(), "Bob");

        let start = Instant::now();
        assert!(!h.session.request_lock("rect1").await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        settle().await;
        assert!(canvas.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_cursor_for_unknown_peer_dropped() {
        let mut h = Harness::new();
        let (canvas, presence) = h.connect().await;
        h.drain_events();

        canvas.push(json!({"type": "cursor_update", "user_id": "p9", "position": {"x": 1, "y": 2}}));
        presence.push(json!({"type": "selection_change", "user_id": "p9", "object_ids": ["a"]}));
        settle().await;

        assert!(h.session.collaborators().await.is_empty());
        assert!(!h
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::CollaboratorsChanged)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_cursor_leave_flow() {
        let mut h = Harness::new();
        let (canvas, presence) = h.connect().await;

        canvas.push(json!({"type": "user_joined", "user": {"id": "p2", "name": "Bob"}}));
        canvas.push(json!({"type": "user_joined", "user": {"id": "me", "name": "Me"}}));
        presence.push(json!({"type": "cursor_update", "user_id": "p2", "position": {"x": 5, "y": 6}}));
        canvas.push(json!({"type": "selection_change", "user_id": "p2", "selected_elements": ["r1"]}));
        canvas.push(json!({"type": "object_locked", "object_id": "r1", "user_id": "p2"}));
        settle().await;

        let peers = h.session.active_collaborators().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].cursor, Some(Vec2::new(5.0, 6.0)));
        assert_eq!(peers[0].selection, vec!["r1".to_string()]);
        assert_eq!(h.session.lock_owner("r1").await, Some("p2".to_string()));

        canvas.push(json!({"type": "user_left", "user_id": "p2"}));
        settle().await;
        assert!(h.session.collaborators().await.is_empty());
        assert_eq!(h.session.lock_owner("r1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_snapshot_and_offline() {
        let mut h = Harness::new();
        let (_canvas, presence) = h.connect().await;

        presence.push(json!({
            "type": "presence_update",
            "users": [
                {"user_id": "p2", "username": "Bob", "is_active": true},
                {"user_id": "p3", "username": "Cy", "is_active": true},
                {"user_id": "me", "username": "Me", "is_active": true},
            ],
        }));
        presence.push(json!({"type": "user_offline", "user_id": "p3"}));
        settle().await;

        assert_eq!(h.session.collaborators().await.len(), 2);
        let active: Vec<String> = h
            .session
            .active_collaborators()
            .await
            .into_iter()
            .map(|c| c.user.id)
            .collect();
        assert_eq!(active, vec!["p2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_canvas_events_relayed_in_order() {
        let mut h = Harness::new();
        let (canvas, _presence) = h.connect().await;

        let create = json!({"type": "element_create", "element": {"id": "e1"}});
        let update = json!({"type": "element_update", "element": {"id": "e1", "x": 3}});
        canvas.push(create.clone());
        canvas.push(json!({"type": "canvas_operation", "operation": {"op": "group"}}));
        canvas.push(update.clone());
        canvas.push(json!({"type": "lock_denied", "object_id": "e1", "locked_by": "p2"}));
        settle().await;

        let relayed: Vec<SessionEvent> = h
            .drain_events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::CanvasUpdate { .. }
                        | SessionEvent::CanvasOperation(_)
                        | SessionEvent::LockDenied { .. }
                )
            })
            .collect();
        assert_eq!(
            relayed,
            vec![
                SessionEvent::CanvasUpdate { change: ElementChange::Create, message: create },
                SessionEvent::CanvasOperation(json!({"op": "group"})),
                SessionEvent::CanvasUpdate { change: ElementChange::Update, message: update },
                SessionEvent::LockDenied { object_id: "e1".into(), locked_by: Some("p2".into()) },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_undrained_events_do_not_stall_session() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        // More relays than the event channel holds, and nobody reading.
        for n in 0..300 {
            canvas.push(json!({"type": "canvas_operation", "operation": {"n": n}}));
        }
        settle().await;

        let start = Instant::now();
        assert!(!h.session.request_lock("r1").await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
        assert_eq!(canvas.next_frame().await, json!({"type": "lock_object", "object_id": "r1"}));

        // Every relay still arrives once, in order, as the host catches up.
        let mut ops = Vec::new();
        while ops.len() < 300 {
            let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
                .await
                .expect("relay stalled")
                .expect("event channel closed");
            if let SessionEvent::CanvasOperation(operation) = event {
                ops.push(operation["n"].as_u64().unwrap());
            }
        }
        assert_eq!(ops, (0..300).collect::<Vec<u64>>());

        tokio::time::timeout(Duration::from_secs(5), h.session.disconnect())
            .await
            .expect("disconnect stalled");
        assert!(!h.session.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_state_with_null_fields_keeps_tables() {
        let mut h = Harness::new();
        let (canvas, _presence) = h.connect().await;

        canvas.push(json!({
            "type": "sync_state",
            "collaborators": [{"id": "p2", "name": "Bob"}],
            "locked_objects": {"rect1": "p2"},
        }));
        canvas.push(json!({"type": "sync_state", "collaborators": null, "locked_objects": null}));
        canvas.push(json!({"type": "sync_state", "collaborators": {"p2": 1}, "locked_objects": ["rect1"]}));
        settle().await;

        assert_eq!(h.session.collaborators().await.len(), 1);
        assert_eq!(h.session.lock_owner("rect1").await, Some("p2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_does_not_end_session() {
        let mut h = Harness::new();
        let (canvas, _presence) = h.connect().await;

        canvas.push_raw("{this is not json");
        canvas.push_raw(r#"{"type":"object_locked"}"#);
        canvas.push_raw(r#"{"type":"brand_new_kind"}"#);
        canvas.push(json!({"type": "user_joined", "user": {"id": "p2", "name": "Bob"}}));
        settle().await;

        assert_eq!(h.session.collaborators().await.len(), 1);
        assert_eq!(h.session.connection_state(Channel::Canvas).await, ConnectionState::Connected);
    }

    // ── Lock protocol ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_lock_held_locally_resolves_without_frame() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;
        canvas.push(json!({"type": "object_locked", "object_id": "mine", "user_id": "me"}));
        settle().await;

        assert!(h.session.request_lock("mine").await);
        settle().await;
        assert!(canvas.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_granted_within_window() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        let server = async {
            let frame = canvas.next_frame().await;
            assert_eq!(frame, json!({"type": "lock_object", "object_id": "r1"}));
            tokio::time::sleep(Duration::from_millis(500)).await;
            canvas.push(json!({"type": "object_locked", "object_id": "r1", "user_id": "me"}));
        };
        let start = Instant::now();
        let (acquired, ()) = tokio::join!(h.session.request_lock("r1"), server);
        assert!(acquired);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(h.session.lock_owner("r1").await, Some("me".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_denied_resolves_false() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        let server = async {
            canvas.next_frame().await;
            canvas.push(json!({"type": "lock_denied", "object_id": "r1", "locked_by": "p2"}));
        };
        let start = Instant::now();
        let (acquired, ()) = tokio::join!(h.session.request_lock("r1"), server);
        assert!(!acquired);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(h
            .drain_events()
            .contains(&SessionEvent::LockDenied { object_id: "r1".into(), locked_by: Some("p2".into()) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out_false() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        let start = Instant::now();
        assert!(!h.session.request_lock("r1").await);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(canvas.next_frame().await, json!({"type": "lock_object", "object_id": "r1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_frame() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        let server = async {
            canvas.next_frame().await;
            settle().await;
            canvas.push(json!({"type": "object_locked", "object_id": "r1", "user_id": "me"}));
        };
        let (a, b, ()) = tokio::join!(
            h.session.request_lock("r1"),
            h.session.request_lock("r1"),
            server
        );
        assert!(a && b);
        settle().await;
        assert!(canvas.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_request_while_canvas_down_is_immediate_false() {
        let mut h = Harness::new();
        let (canvas, _presence) = h.connect().await;
        canvas.close(1000);
        settle().await;

        let start = Instant::now();
        assert!(!h.session.request_lock("r1").await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_lock_request_before_connect_is_false() {
        let h = Harness::new();
        assert!(!h.session.request_lock("r1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_pending_lock() {
        let mut h = Harness::new();
        let (mut canvas, _presence) = h.connect().await;

        // Park a request directly on the actor so the handle stays free
        // for disconnect().
        let (reply, outcome) = oneshot::channel();
        let tx = h.session.cmd_tx.clone().unwrap();
        assert!(tx.send(Command::RequestLock { object_id: "r1".into(), reply }).is_ok());
        assert_eq!(canvas.next_frame().await["type"], "lock_object");

        let start = Instant::now();
        h.session.disconnect().await;
        assert_eq!(outcome.await, Ok(false));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
