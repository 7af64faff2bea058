//! SSH module - connection lifecycle over russh
//!
//! # Features
//! - Direct connections or through a SOCKS4/SOCKS5/HTTP CONNECT proxy
//! - Ordered authentication: password, key file, agent, keyboard-interactive (2FA)
//! - Host key gating via a pluggable [`HostKeyVerifier`]
//! - Automatic reconnection with exponential backoff (see [`crate::session`])
//! - Generation-scoped shell and file-transfer channels

mod agent;
pub mod auth;
mod channel;
mod client;
mod config;
mod connection;
mod error;
mod event;
mod handle_owner;
pub mod host_key;
pub mod keyboard_interactive;
mod proxy;
mod registry;
pub mod transport;

pub use agent::{is_agent_available, SshAgentClient};
pub use auth::{AuthMethodKind, AuthNegotiator, AuthOutcome, AuthPlan, AuthStep, KeyError};
pub use channel::{ChannelRegistry, ShellHandle};
pub use client::{ClientHandler, RusshConnector};
pub use config::{
    AlgorithmPreferences, AuthStrategy, ConnectionConfig, KeepaliveConfig, ProxyConfig, ProxyKind,
    ShellOptions,
};
pub use connection::{Connection, OpenedShell};
pub use error::{ErrorKind, SshError};
pub use event::{ConnectionEvent, ConnectionStatus};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use host_key::{HostKeyStatus, HostKeyVerifier, KnownHostKeys};
pub use keyboard_interactive::{KbiError, KbiPrompt, KbiPromptEvent};
pub use proxy::connect_via_proxy;
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use transport::{
    HandshakeContext, PendingAuth, ShellCommand, ShellIo, ShellOutput, Transport,
    TransportConnector,
};
