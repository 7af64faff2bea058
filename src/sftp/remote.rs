//! Remote filesystem seam
//!
//! [`RemoteFs`] is the small slice of SFTP the transfer queue and conflict
//! resolver need. [`RusshRemoteFs`] implements it over `russh-sftp`;
//! [`FileTransferChannel`] wraps any implementation with the generation check
//! that keeps callers from using a channel of a transport that was replaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::error::SftpError;
use super::types::FileStat;

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// `None` when nothing exists at `path`.
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SftpError>;

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError>;

    /// Create or truncate `path` for writing.
    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError>;

    /// Set access and modification times (unix seconds).
    async fn set_times(&self, path: &str, accessed: i64, modified: i64) -> Result<(), SftpError>;
}

/// SFTP subsystem channel over russh
pub struct RusshRemoteFs {
    sftp: RusshSftpSession,
}

impl RusshRemoteFs {
    pub fn new(sftp: RusshSftpSession) -> Self {
        Self { sftp }
    }

    fn map_error(err: SftpErrorInner, path: &str) -> SftpError {
        let message = err.to_string();
        if message.contains("No such file") || message.contains("not found") {
            SftpError::NotFound(path.to_string())
        } else {
            SftpError::ProtocolError(message)
        }
    }
}

#[async_trait]
impl RemoteFs for RusshRemoteFs {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SftpError> {
        match self.sftp.metadata(path).await {
            Ok(attrs) => Ok(Some(FileStat {
                size: attrs.size.unwrap_or(0),
                modified: attrs.mtime.map(i64::from).unwrap_or(0),
                accessed: attrs.atime.map(i64::from).unwrap_or(0),
                is_dir: attrs.is_dir(),
            })),
            Err(e) => match Self::map_error(e, path) {
                SftpError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| Self::map_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| Self::map_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn set_times(&self, path: &str, accessed: i64, modified: i64) -> Result<(), SftpError> {
        let attrs = FileAttributes {
            atime: Some(clamp_u32(accessed)),
            mtime: Some(clamp_u32(modified)),
            ..FileAttributes::default()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| Self::map_error(e, path))
    }
}

/// SFTP v3 carries 32-bit timestamps
fn clamp_u32(secs: i64) -> u32 {
    secs.clamp(0, u32::MAX as i64) as u32
}

/// A file-transfer channel bound to one transport generation.
///
/// Every operation first compares its generation with the owning connection's
/// current one and fails with [`SftpError::StaleChannel`] after a reconnect.
#[derive(Clone)]
pub struct FileTransferChannel {
    inner: Arc<dyn RemoteFs>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl FileTransferChannel {
    pub fn new(inner: Arc<dyn RemoteFs>, generation: u64, current: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            generation,
            current,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn check(&self) -> Result<(), SftpError> {
        let current = self.current.load(Ordering::SeqCst);
        if current != self.generation {
            debug!(
                "Rejecting file-transfer op on generation {} (current {})",
                self.generation, current
            );
            return Err(SftpError::StaleChannel {
                channel: self.generation,
                current,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for FileTransferChannel {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SftpError> {
        self.check()?;
        self.inner.stat(path).await
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        self.check()?;
        self.inner.open_read(path).await
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        self.check()?;
        self.inner.open_write(path).await
    }

    async fn set_times(&self, path: &str, accessed: i64, modified: i64) -> Result<(), SftpError> {
        self.check()?;
        self.inner.set_times(path, accessed, modified).await
    }
}
