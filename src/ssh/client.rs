//! SSH client over russh
//!
//! [`RusshConnector`] opens the TCP stream (directly or through a proxy),
//! runs the key exchange with [`ClientHandler`] gating the server key, and
//! hands back a [`PendingAuth`] that authenticates and spawns the handle owner.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::auth::AuthNegotiator;
use super::config::ConnectionConfig;
use super::error::SshError;
use super::event::ConnectionEvent;
use super::handle_owner::spawn_handle_owner_task;
use super::host_key::{check_host_key, HostKeyVerifier};
use super::keyboard_interactive::KbiContext;
use super::proxy::connect_via_proxy;
use super::transport::{HandshakeContext, PendingAuth, Transport, TransportConnector};
use crate::events::EventBus;

/// Client handler for russh callbacks
///
/// Verifies the server key through the configured [`HostKeyVerifier`] and
/// forwards the pre-auth banner as a [`ConnectionEvent::Banner`].
pub struct ClientHandler {
    host: String,
    port: u16,
    accept_new: bool,
    verifier: Arc<dyn HostKeyVerifier>,
    connection_id: String,
    events: EventBus<ConnectionEvent>,
}

impl ClientHandler {
    pub fn new(
        config: &ConnectionConfig,
        verifier: Arc<dyn HostKeyVerifier>,
        ctx: &HandshakeContext,
    ) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            accept_new: config.accept_new_host_keys,
            verifier,
            connection_id: ctx.connection_id.clone(),
            events: ctx.events.clone(),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        check_host_key(
            self.verifier.as_ref(),
            &self.host,
            self.port,
            &fingerprint,
            self.accept_new,
        )
        .map_err(SshError::Handshake)?;
        info!("Host key accepted for {}:{}", self.host, self.port);
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!("Auth banner from {}:{}", self.host, self.port);
        self.events.emit(ConnectionEvent::Banner {
            connection_id: self.connection_id.clone(),
            message: banner.to_string(),
        });
        Ok(())
    }
}

/// Production [`TransportConnector`]
pub struct RusshConnector {
    host_keys: Arc<dyn HostKeyVerifier>,
}

impl RusshConnector {
    pub fn new(host_keys: Arc<dyn HostKeyVerifier>) -> Self {
        Self { host_keys }
    }
}

async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, SshError> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SshError::Handshake(format!("Failed to resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| SshError::Handshake(format!("No address found for {}:{}", host, port)))?;

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| SshError::Handshake(format!("Failed to connect to {}: {}", addr, e)))?;
    // Interactive traffic; Nagle only adds latency
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[async_trait]
impl TransportConnector for RusshConnector {
    async fn handshake(
        &self,
        config: &ConnectionConfig,
        ctx: &HandshakeContext,
    ) -> Result<Box<dyn PendingAuth>, SshError> {
        info!("Connecting to SSH server at {}", config.address());

        let stream = match &config.proxy {
            Some(proxy) => {
                connect_via_proxy(proxy, &config.host, config.port, config.ready_timeout()).await?
            }
            None => connect_direct(&config.host, config.port).await?,
        };

        let handler = ClientHandler::new(config, self.host_keys.clone(), ctx);
        let handle = client::connect_stream(config.client_config(), stream, handler)
            .await
            .map_err(|e| match e {
                SshError::Handshake(_) => e,
                other => SshError::Handshake(other.to_string()),
            })?;

        debug!("SSH handshake completed with {}", config.address());
        Ok(Box::new(RusshPendingAuth { handle }))
    }
}

struct RusshPendingAuth {
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl PendingAuth for RusshPendingAuth {
    async fn authenticate(
        self: Box<Self>,
        config: &ConnectionConfig,
        kbi: KbiContext,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let mut handle = self.handle;
        AuthNegotiator::new(&config.username, &config.auth, kbi)
            .authenticate(&mut handle)
            .await?;
        info!(
            "SSH authentication successful for {}@{}",
            config.username,
            config.address()
        );

        let controller = spawn_handle_owner_task(handle, config.session_id.clone());
        Ok(Arc::new(controller))
    }
}
