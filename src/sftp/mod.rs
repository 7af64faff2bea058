//! File transfer
//!
//! Uploads and downloads run through [`TransferQueue`] over any [`RemoteFs`],
//! normally the [`FileTransferChannel`] handed out by
//! [`Connection::get_file_transfer_channel`](crate::ssh::Connection::get_file_transfer_channel).
//! [`ConflictResolver`] is the pre-flight check callers run before enqueueing.

pub mod conflict;
pub mod error;
pub mod path_utils;
pub mod remote;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod memory;

pub use conflict::{ConflictFileInfo, ConflictInfo, ConflictPolicy, ConflictResolution, ConflictResolver};
pub use error::SftpError;
pub use remote::{FileTransferChannel, RemoteFs, RemoteReader, RemoteWriter, RusshRemoteFs};
pub use transfer::{TransferControl, TransferQueue};
pub use types::*;
