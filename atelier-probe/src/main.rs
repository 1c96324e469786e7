//! atelier-probe: join a project's collaboration channels and log traffic.
//!
//! ```text
//! RUST_LOG=info atelier-probe --project demo --name "Probe"
//! ```

use std::sync::Arc;
use std::time::Duration;

use atelier_collab::{
    avatar_stack, connection_indicator, Channel, CollabConfig, CollabSession, ConnectionState,
    SessionEvent, UserIdentity, WsConnector,
};
use clap::Parser;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "atelier-probe", about = "Atelier realtime collaboration probe")]
struct Cli {
    /// WebSocket base URL.
    #[arg(long, env = "ATELIER_WS_BASE", default_value = "ws://127.0.0.1:8000")]
    ws_base: String,

    #[arg(long, env = "ATELIER_PROJECT")]
    project: String,

    /// Peer id to announce. A random one is used if absent.
    #[arg(long, env = "ATELIER_USER_ID")]
    user_id: Option<String>,

    #[arg(long, env = "ATELIER_USER_NAME", default_value = "probe")]
    name: String,

    #[arg(long)]
    avatar: Option<String>,

    /// Request a lock on this object once the canvas channel is up.
    #[arg(long)]
    lock: Option<String>,

    /// Exit after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    seconds: Option<u64>,

    /// How many avatars to list before "+N".
    #[arg(long, default_value_t = 5)]
    max_avatars: usize,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let user_id = cli.user_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut user = UserIdentity::new(user_id, cli.name);
    if let Some(avatar) = cli.avatar {
        user = user.with_avatar(avatar);
    }

    let config = CollabConfig::with_base(cli.ws_base);
    log::info!(
        "Joining {} at {} as {}",
        cli.project,
        config.channel_url(Channel::Canvas, &cli.project),
        user.id
    );

    let mut session = CollabSession::new(config, user, cli.project, Arc::new(WsConnector));
    let Some(mut events) = session.take_event_rx() else {
        log::error!("Session event receiver unavailable");
        return;
    };
    session.connect();

    let seconds = cli.seconds;
    let deadline = async move {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    tokio::pin!(deadline);

    let mut pending_lock = cli.lock;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::ConnectionChanged { channel, state } => {
                        let indicator = connection_indicator(
                            &session.channel_status(Channel::Canvas).await,
                            &session.channel_status(Channel::Presence).await,
                        );
                        log::info!("{channel} is {state}; status: {}", indicator.label);
                        if indicator.offer_retry {
                            log::info!("Retry available");
                        }

                        if channel == Channel::Canvas && state == ConnectionState::Connected {
                            if let Some(object_id) = pending_lock.take() {
                                let acquired = session.request_lock(object_id.clone()).await;
                                log::info!("Lock on {object_id}: {}", if acquired { "acquired" } else { "not acquired" });
                            }
                        }
                    }
                    SessionEvent::CollaboratorsChanged => {
                        let collaborators = session.active_collaborators().await;
                        let stack = avatar_stack(&collaborators, cli.max_avatars);
                        let names: Vec<String> = stack
                            .visible
                            .iter()
                            .map(|chip| format!("{} ({})", chip.name, chip.initials))
                            .collect();
                        if stack.overflow > 0 {
                            log::info!("Here: {} +{}", names.join(", "), stack.overflow);
                        } else {
                            log::info!("Here: {}", names.join(", "));
                        }
                    }
                    SessionEvent::LocksChanged => {
                        log::debug!("Locks: {:?}", session.locks().await);
                    }
                    SessionEvent::LockDenied { object_id, locked_by } => {
                        log::info!("Lock on {object_id} denied (held by {})", locked_by.as_deref().unwrap_or("unknown"));
                    }
                    SessionEvent::CanvasUpdate { change, message } => {
                        log::info!("Element {change:?}: {message}");
                    }
                    SessionEvent::CanvasOperation(operation) => {
                        log::info!("Operation: {}", serde_json::to_string(&operation).unwrap_or_default());
                    }
                }
            }
        }
    }

    log::info!("Leaving");
    drop(events);
    session.disconnect().await;
}
