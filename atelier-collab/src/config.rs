//! Session configuration.

use std::time::Duration;

use crate::protocol::Channel;

/// Timing and endpoint settings for a [`CollabSession`](crate::client::CollabSession).
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// WebSocket base, e.g. `wss://atelier.example.com`.
    pub ws_base: String,
    /// Delay before reopening after an abnormal close.
    pub reconnect_delay: Duration,
    /// Presence keep-alive period.
    pub heartbeat_interval: Duration,
    /// Outbound cursor coalescing window.
    pub cursor_flush_interval: Duration,
    /// How long a lock request waits for a grant or denial.
    pub lock_timeout: Duration,
    /// How long opening a socket may take before it counts as failed.
    pub connect_timeout: Duration,
    /// Capacity of the session event channel. Relayed events beyond it
    /// queue inside the session instead of blocking it.
    pub event_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            ws_base: "ws://127.0.0.1:8000".to_string(),
            reconnect_delay: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            cursor_flush_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl CollabConfig {
    /// Default timings against the given base URL.
    pub fn with_base(ws_base: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into(),
            ..Self::default()
        }
    }

    /// `{ws_base}/ws/{channel}/{project_id}/`
    pub fn channel_url(&self, channel: Channel, project_id: &str) -> String {
        format!(
            "{}/ws/{}/{}/",
            self.ws_base.trim_end_matches('/'),
            channel.path_segment(),
            project_id
        )
    }
}
