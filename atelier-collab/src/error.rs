//! Error type shared by the codec, transport and session layers.
//!
//! Runtime failures never cross the public session API as errors: they are
//! folded into connection state, log lines, or a `false` lock result. The
//! enum exists so the layers underneath can use `?` and so hosts that drive
//! a [`Transport`](crate::transport::Transport) directly get a real error.

use thiserror::Error;

/// Errors raised inside the collaboration core.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame has no string `type` field")]
    MissingType,

    #[error("`{kind}` frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl CollabError {
    /// Whether this error came from frame decoding (as opposed to the wire).
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::NotAnObject | Self::MissingType | Self::MissingField { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = CollabError::Connect {
            url: "ws://x/ws/canvas/p/".into(),
            reason: "refused".into(),
        };
        assert_eq!(e.to_string(), "Failed to connect to ws://x/ws/canvas/p/: refused");

        let e = CollabError::MissingField { kind: "object_locked", field: "object_id" };
        assert_eq!(e.to_string(), "`object_locked` frame is missing `object_id`");
    }

    #[test]
    fn test_is_decode() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let e: CollabError = bad.unwrap_err().into();
        assert!(e.is_decode());
        assert!(CollabError::MissingType.is_decode());
        assert!(!CollabError::Transport("reset".into()).is_decode());
        assert!(!CollabError::Connect { url: "ws://x".into(), reason: "refused".into() }.is_decode());
    }
}
