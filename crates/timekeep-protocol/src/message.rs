//! Protocol message types for daemon communication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use timekeep_core::{ActiveSession, ProgramName};

/// Maximum accepted line length (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ping to check the daemon is responsive
    Ping {
        /// Sequence number echoed in the pong
        seq: u64,
    },

    /// The program catalog changed; reload it and resync the monitor
    Refresh,

    /// Request the currently open sessions
    ListActive,
}

/// Messages sent from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Pong {
        seq: u64,
    },

    /// Catalog reloaded
    Refreshed {
        /// Number of programs now tracked
        tracked: usize,
    },

    ActiveSessions {
        sessions: Vec<ActiveSessionView>,
    },

    Error {
        message: String,
    },
}

/// A currently open session as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSessionView {
    pub program: ProgramName,
    pub started_at: DateTime<Utc>,
    /// Seconds elapsed since `started_at` at the time of the response
    pub elapsed_seconds: i64,
}

impl ActiveSessionView {
    pub fn from_active(session: &ActiveSession, now: DateTime<Utc>) -> Self {
        Self {
            program: session.program.clone(),
            started_at: session.started_at,
            elapsed_seconds: now
                .signed_duration_since(session.started_at)
                .num_seconds()
                .max(0),
        }
    }
}

impl DaemonMessage {
    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Errors decoding a request line.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decodes one newline-delimited request.
pub fn decode_line(line: &str) -> Result<ClientMessage, DecodeError> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(DecodeError::TooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_client_message_serialization() {
        let json = serde_json::to_string(&ClientMessage::Ping { seq: 42 }).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));
    }

    #[test]
    fn test_decode_refresh() {
        let msg = decode_line("{\"type\":\"refresh\"}\n").unwrap();
        assert_eq!(msg, ClientMessage::Refresh);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = decode_line("{\"type\":\"reboot\"}").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_oversized_line() {
        let line = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let err = decode_line(&line).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { .. }));
    }

    #[test]
    fn test_active_session_view_elapsed() {
        let now = Utc::now();
        let session = ActiveSession {
            program: ProgramName::new("Obsidian"),
            started_at: now - Duration::seconds(90),
        };
        let view = ActiveSessionView::from_active(&session, now);
        assert_eq!(view.program.as_str(), "obsidian");
        assert_eq!(view.elapsed_seconds, 90);

        let json = serde_json::to_string(&DaemonMessage::ActiveSessions {
            sessions: vec![view],
        })
        .unwrap();
        assert!(json.contains("\"type\":\"active_sessions\""));
        assert!(json.contains("\"program\":\"obsidian\""));
    }
}
