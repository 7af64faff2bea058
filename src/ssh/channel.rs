//! Channel registry
//!
//! Tracks the open shell channels and the cached file-transfer channel of one
//! connection, all tagged with the transport generation they were opened on.
//! A reset to a new generation forgets everything from the previous one.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::SshError;
use super::transport::ShellCommand;
use crate::sftp::FileTransferChannel;

/// Caller-side reference to an open shell: `(id, generation)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ShellHandle {
    pub id: String,
    pub generation: u64,
}

#[derive(Default)]
pub struct ChannelRegistry {
    generation: u64,
    shells: HashMap<String, mpsc::Sender<ShellCommand>>,
    file_transfer: Option<FileTransferChannel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start tracking a new transport generation.
    pub fn reset(&mut self, generation: u64) {
        self.close_all();
        self.generation = generation;
    }

    /// Ask every shell to close and forget all channels.
    pub fn close_all(&mut self) {
        for (id, tx) in self.shells.drain() {
            debug!("Closing shell channel {}", id);
            // Full queue or a finished bridge both mean nothing to drain
            let _ = tx.try_send(ShellCommand::Close);
        }
        self.file_transfer = None;
    }

    fn check(&self, handle: &ShellHandle) -> Result<(), SshError> {
        if handle.generation != self.generation {
            return Err(SshError::StaleChannel {
                handle: handle.generation,
                current: self.generation,
            });
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shells.contains_key(id)
    }

    pub fn insert_shell(
        &mut self,
        handle: &ShellHandle,
        commands: mpsc::Sender<ShellCommand>,
    ) -> Result<(), SshError> {
        self.check(handle)?;
        if self.shells.contains_key(&handle.id) {
            return Err(SshError::Channel(format!(
                "Shell {} is already open",
                handle.id
            )));
        }
        self.shells.insert(handle.id.clone(), commands);
        Ok(())
    }

    pub fn shell(&self, handle: &ShellHandle) -> Result<mpsc::Sender<ShellCommand>, SshError> {
        self.check(handle)?;
        self.shells
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| SshError::Channel(format!("Shell {} not found", handle.id)))
    }

    pub fn remove_shell(
        &mut self,
        handle: &ShellHandle,
    ) -> Result<mpsc::Sender<ShellCommand>, SshError> {
        self.check(handle)?;
        self.shells
            .remove(&handle.id)
            .ok_or_else(|| SshError::Channel(format!("Shell {} not found", handle.id)))
    }

    pub fn shell_count(&self) -> usize {
        self.shells.len()
    }

    pub fn file_transfer(&self) -> Option<FileTransferChannel> {
        self.file_transfer
            .as_ref()
            .filter(|c| c.generation() == self.generation)
            .cloned()
    }

    /// Cache `channel` unless one for this generation is already cached; returns
    /// the channel callers should use.
    pub fn set_file_transfer(&mut self, channel: FileTransferChannel) -> FileTransferChannel {
        if let Some(existing) = self.file_transfer() {
            return existing;
        }
        self.file_transfer = Some(channel.clone());
        channel
    }
}
