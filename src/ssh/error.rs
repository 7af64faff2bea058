//! SSH Error types

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport dropped: {0}")]
    TransportDropped(String),

    #[error("Reconnection exhausted after {0} attempts")]
    ReconnectionExhausted(u32),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel error: handle from generation {handle} used on generation {current}")]
    StaleChannel { handle: u64, current: u64 },

    #[error("Key error: {0}")]
    Key(String),

    #[error("SSH Agent error: {0}")]
    Agent(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

/// Coarse error category carried by `Error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Proxy,
    Handshake,
    Auth,
    TransportDropped,
    ReconnectionExhausted,
    Channel,
    Other,
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::Proxy(_) => ErrorKind::Proxy,
            SshError::Handshake(_) | SshError::Timeout(_) | SshError::Protocol(_) => {
                ErrorKind::Handshake
            }
            SshError::Auth(_) | SshError::Key(_) | SshError::Agent(_) => ErrorKind::Auth,
            SshError::TransportDropped(_) => ErrorKind::TransportDropped,
            SshError::ReconnectionExhausted(_) => ErrorKind::ReconnectionExhausted,
            SshError::Channel(_) | SshError::StaleChannel { .. } => ErrorKind::Channel,
            SshError::InvalidState(_) | SshError::Io(_) | SshError::Disconnected => {
                ErrorKind::Other
            }
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(err.to_string())
    }
}

impl Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
