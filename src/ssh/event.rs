//! Connection status and lifecycle events

use std::fmt;

use serde::Serialize;

use super::error::{ErrorKind, SshError};
use super::keyboard_interactive::KbiPromptEvent;
use crate::session::ReconnectEvent;

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Reconnection suspended by the user
    Paused,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published by a [`super::Connection`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Status {
        connection_id: String,
        status: ConnectionStatus,
    },
    Error {
        connection_id: String,
        kind: ErrorKind,
        message: String,
    },
    /// Pre-auth banner sent by the server
    Banner {
        connection_id: String,
        message: String,
    },
    /// Keyboard-interactive prompts that need an answer from the caller
    KbiPrompt(KbiPromptEvent),
    /// Scheduler progress, nested under `reconnect` with its own `type` tag
    Reconnect {
        connection_id: String,
        reconnect: ReconnectEvent,
    },
}

impl ConnectionEvent {
    pub(crate) fn error(connection_id: &str, err: &SshError) -> Self {
        Self::Error {
            connection_id: connection_id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
