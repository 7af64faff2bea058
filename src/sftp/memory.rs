//! In-memory [`RemoteFs`] used by tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::Semaphore;

use super::error::SftpError;
use super::remote::{RemoteFs, RemoteReader, RemoteWriter};
use super::types::FileStat;

#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    pub data: Vec<u8>,
    pub modified: i64,
    pub accessed: i64,
}

#[derive(Default)]
pub struct MemoryFs {
    files: Arc<Mutex<HashMap<String, MemoryFile>>>,
    failing: Mutex<HashSet<String>>,
    /// When set, every open waits for a permit
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, data: &[u8], modified: i64) {
        self.files.lock().insert(
            path.to_string(),
            MemoryFile {
                data: data.to_vec(),
                modified,
                accessed: modified,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<MemoryFile> {
        self.files.lock().get(path).cloned()
    }

    pub fn fail(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    pub fn heal(&self, path: &str) {
        self.failing.lock().remove(path);
    }

    /// Hold every subsequent open until a permit is added to the returned semaphore.
    pub fn gate(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(semaphore.clone());
        semaphore
    }

    async fn pass_gate(&self, path: &str) -> Result<(), SftpError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| SftpError::ChannelError("gate closed".into()))?
                .forget();
        }
        if self.failing.lock().contains(path) {
            return Err(SftpError::ProtocolError(format!("injected failure for {}", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SftpError> {
        Ok(self.files.lock().get(path).map(|f| FileStat {
            size: f.data.len() as u64,
            modified: f.modified,
            accessed: f.accessed,
            is_dir: false,
        }))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        self.pass_gate(path).await?;
        let data = self
            .files
            .lock()
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| SftpError::NotFound(path.to_string()))?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        self.pass_gate(path).await?;
        self.files.lock().insert(
            path.to_string(),
            MemoryFile {
                modified: chrono::Utc::now().timestamp(),
                ..MemoryFile::default()
            },
        );
        Ok(Box::new(MemoryWriter {
            path: path.to_string(),
            files: self.files.clone(),
        }))
    }

    async fn set_times(&self, path: &str, accessed: i64, modified: i64) -> Result<(), SftpError> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(path)
            .ok_or_else(|| SftpError::NotFound(path.to_string()))?;
        file.accessed = accessed;
        file.modified = modified;
        Ok(())
    }
}

struct MemoryWriter {
    path: String,
    files: Arc<Mutex<HashMap<String, MemoryFile>>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut files = self.files.lock();
        files
            .entry(self.path.clone())
            .or_default()
            .data
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
