//! Settings types

use serde::{Deserialize, Serialize};

use crate::session::ReconnectionPolicy;
use crate::sftp::ConflictPolicy;
use crate::ssh::KeepaliveConfig;

/// Current settings file format version
pub const SETTINGS_VERSION: u32 = 1;

/// Root of the persisted settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub version: u32,
    #[serde(default)]
    pub connection: ConnectionDefaults,
    #[serde(default)]
    pub transfer: TransferSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            connection: ConnectionDefaults::default(),
            transfer: TransferSettings::default(),
        }
    }
}

/// Defaults applied to new connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDefaults {
    pub keepalive: KeepaliveConfig,
    pub ready_timeout_secs: u64,
    pub reconnection: ReconnectionPolicy,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveConfig::default(),
            ready_timeout_secs: 30,
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

/// Transfer queue tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Simultaneously active transfers (1-10)
    pub max_concurrent: usize,
    /// Per-transfer limit in KB/s (0 = unlimited)
    pub speed_limit_kbps: usize,
    /// Policy used when the caller does not choose one
    pub conflict_policy: ConflictPolicy,
    pub preserve_timestamps: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            speed_limit_kbps: 0,
            conflict_policy: ConflictPolicy::Ask,
            preserve_timestamps: true,
        }
    }
}
