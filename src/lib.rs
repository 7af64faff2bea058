//! shelltether - managed remote-shell client engine
//!
//! Owns a single SSH transport per [`ssh::Connection`], multiplexes interactive
//! shells and the SFTP subsystem over it, recovers from transport loss with
//! [`session::ReconnectionManager`], and moves files through a bounded
//! [`sftp::TransferQueue`] with destination conflict handling.
//!
//! ```text
//!   Connection ──► ProxyTunnel ──► handshake ──► AuthNegotiator
//!       │                                              │
//!       │◄────────────── transport (generation N) ◄────┘
//!       ├── ChannelRegistry (shells, file-transfer channel)
//!       └── ReconnectionManager (on unexpected drop)
//!
//!   ConflictResolver ──► TransferQueue ──► FileTransferChannel
//! ```

pub mod config;
pub mod events;
pub mod session;
pub mod sftp;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Honors `RUST_LOG`, falling back to `info`. Safe to call more than once; only
/// the first call installs the subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
