//! SFTP transfer types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Waiting in queue
    Queued,
    /// Holding one of the concurrency slots
    Active,
    /// Stream abandoned by the user; resuming re-queues from zero
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Transfer request accepted by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
}

impl TransferRequest {
    pub fn upload(local_path: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Upload,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }

    pub fn download(remote_path: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Download,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }
}

/// One queued transfer and its progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub status: TransferStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// Transfer speed in bytes/second
    pub speed: u64,
    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferItem {
    pub(crate) fn new(id: String, request: TransferRequest) -> Self {
        Self {
            id,
            direction: request.direction,
            local_path: request.local_path,
            remote_path: request.remote_path,
            status: TransferStatus::Queued,
            total_bytes: 0,
            transferred_bytes: 0,
            speed: 0,
            eta_seconds: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn source(&self) -> &str {
        match self.direction {
            TransferDirection::Upload => &self.local_path,
            TransferDirection::Download => &self.remote_path,
        }
    }

    pub fn destination(&self) -> &str {
        match self.direction {
            TransferDirection::Upload => &self.remote_path,
            TransferDirection::Download => &self.local_path,
        }
    }

    /// Calculate progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Clear progress before the item runs again
    pub(crate) fn reset_progress(&mut self) {
        self.transferred_bytes = 0;
        self.speed = 0;
        self.eta_seconds = None;
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Queue notifications
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "item", rename_all = "snake_case")]
pub enum TransferEvent {
    Update(TransferItem),
    Complete(TransferItem),
    Error(TransferItem),
}

impl TransferEvent {
    pub fn item(&self) -> &TransferItem {
        match self {
            Self::Update(item) | Self::Complete(item) | Self::Error(item) => item,
        }
    }
}

/// Metadata for a file on either side of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    /// Unix seconds
    pub modified: i64,
    /// Unix seconds
    pub accessed: i64,
    pub is_dir: bool,
}
