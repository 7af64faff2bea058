//! SFTP Error types

use serde::Serialize;
use thiserror::Error;

use super::types::TransferStatus;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Channel error: file-transfer channel from generation {channel} used on generation {current}")]
    StaleChannel { channel: u64, current: u64 },

    #[error("No file-transfer channel available")]
    NoChannel,

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("SFTP protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transfer error: {0}")]
    TransferError(String),

    #[error("Transfer cancelled")]
    TransferCancelled,

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Cannot {action} transfer {id} while {status:?}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: TransferStatus,
    },

    #[error("Destination exists and no conflict resolution was chosen: {0}")]
    ConflictUnresolved(String),
}

impl From<russh_sftp::client::error::Error> for SftpError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SftpError::ProtocolError(err.to_string())
    }
}

impl Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
