//! Configuration Management Module
//!
//! Persistent engine settings: connection defaults (keepalive, ready timeout,
//! reconnection policy) and transfer queue tuning.

pub mod storage;
pub mod types;

pub use storage::{config_dir, settings_file, SettingsStorage, StorageError};
pub use types::{ConnectionDefaults, EngineSettings, TransferSettings, SETTINGS_VERSION};
