//! Connection state machine
//!
//! ```text
//!   Disconnected ─connect─► Connecting ─► Authenticating ─► Connected
//!        ▲                      │               │              │ transport lost
//!        │                      └──── Error ◄───┘              ▼
//!   disconnect (any state)            ▲                  Reconnecting ⇄ Paused
//!                                     └──── exhausted ─────────┘
//! ```
//!
//! A `Connection` owns one transport at a time. Every successful (re)connect
//! bumps the transport generation; shell handles and file-transfer channels
//! carry the generation they were opened on and are rejected once it moves on.
//!
//! Reconnection is driven by a [`ReconnectionManager`]: the manager decides
//! *when*, a driver task owned by the connection turns each `Attempt` into a
//! fresh handshake and reports the outcome back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::channel::{ChannelRegistry, ShellHandle};
use super::client::RusshConnector;
use super::config::{ConnectionConfig, ShellOptions};
use super::error::SshError;
use super::event::{ConnectionEvent, ConnectionStatus};
use super::host_key::HostKeyVerifier;
use super::keyboard_interactive::{KbiContext, KbiError, KbiRegistry};
use super::transport::{HandshakeContext, ShellCommand, ShellOutput, Transport, TransportConnector};
use crate::events::EventBus;
use crate::session::{ReconnectEvent, ReconnectSnapshot, ReconnectionManager};
use crate::sftp::FileTransferChannel;

/// A freshly opened shell: the handle for commands plus its output stream
pub struct OpenedShell {
    pub handle: ShellHandle,
    pub output: mpsc::Receiver<ShellOutput>,
}

struct ConnectionState {
    status: ConnectionStatus,
    transport: Option<Arc<dyn Transport>>,
    channels: ChannelRegistry,
    /// Watches the current transport's close signal
    monitor: Option<JoinHandle<()>>,
    reconnect: Option<ReconnectionManager>,
    /// Turns manager events into reconnect attempts
    driver: Option<JoinHandle<()>>,
}

pub struct Connection {
    id: String,
    config: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    state: parking_lot::Mutex<ConnectionState>,
    generation: Arc<AtomicU64>,
    events: EventBus<ConnectionEvent>,
    kbi: Arc<KbiRegistry>,
    /// Wakes in-flight handshakes when the user disconnects
    interrupt: Notify,
    /// Abandons the in-flight reconnect attempt once `retry_now` fires a newer one
    superseded: Notify,
}

impl Connection {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn TransportConnector>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            connector,
            state: parking_lot::Mutex::new(ConnectionState {
                status: ConnectionStatus::Disconnected,
                transport: None,
                channels: ChannelRegistry::new(),
                monitor: None,
                reconnect: None,
                driver: None,
            }),
            generation: Arc::new(AtomicU64::new(0)),
            events: EventBus::new(),
            kbi: Arc::new(KbiRegistry::new()),
            interrupt: Notify::new(),
            superseded: Notify::new(),
        })
    }

    /// Connection over russh, gating server keys through `host_keys`.
    pub fn russh(config: ConnectionConfig, host_keys: Arc<dyn HostKeyVerifier>) -> Arc<Self> {
        Self::new(config, Arc::new(RusshConnector::new(host_keys)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Current transport generation (0 before the first connect)
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Attach a listener. Attach before `connect()` to see every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn reconnection_snapshot(&self) -> Option<ReconnectSnapshot> {
        self.state.lock().reconnect.as_ref().map(|m| m.snapshot())
    }

    fn set_status(&self, s: &mut ConnectionState, status: ConnectionStatus) {
        if s.status == status {
            return;
        }
        debug!("Connection {}: {} -> {}", self.id, s.status, status);
        s.status = status;
        self.events.emit(ConnectionEvent::Status {
            connection_id: self.id.clone(),
            status,
        });
    }

    fn emit_error(&self, err: &SshError) {
        self.events.emit(ConnectionEvent::error(&self.id, err));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect from `disconnected` or `error`.
    ///
    /// A failure here lands in `error` and never starts reconnection.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SshError> {
        {
            let mut s = self.state.lock();
            match s.status {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
                other => {
                    return Err(SshError::InvalidState(format!(
                        "cannot connect while {}",
                        other
                    )))
                }
            }
            self.set_status(&mut s, ConnectionStatus::Connecting);
        }
        info!("Connection {}: connecting to {}", self.id, self.config.address());

        let result = tokio::select! {
            r = self.establish(None) => r,
            _ = self.interrupt.notified() => Err(SshError::Disconnected),
        };

        if let Err(e) = &result {
            let mut s = self.state.lock();
            if matches!(
                s.status,
                ConnectionStatus::Connecting | ConnectionStatus::Authenticating
            ) {
                warn!("Connection {}: connect failed: {}", self.id, e);
                self.set_status(&mut s, ConnectionStatus::Error);
                self.emit_error(e);
            }
        }
        result
    }

    /// Proxy + handshake + authentication within one ready-timeout budget,
    /// then install the new transport.
    ///
    /// `attempt` is `None` for the user's connect and the reconnect attempt
    /// number otherwise.
    async fn establish(self: &Arc<Self>, attempt: Option<u32>) -> Result<(), SshError> {
        let budget = self.config.ready_timeout();
        let started = Instant::now();
        let ctx = HandshakeContext {
            connection_id: self.id.clone(),
            events: self.events.clone(),
        };

        let pending = match timeout(budget, self.connector.handshake(&self.config, &ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SshError::Handshake(format!(
                    "handshake timed out after {:?}",
                    budget
                )))
            }
        };

        if attempt.is_none() {
            let mut s = self.state.lock();
            if s.status != ConnectionStatus::Connecting {
                return Err(SshError::Disconnected);
            }
            self.set_status(&mut s, ConnectionStatus::Authenticating);
        }

        let remaining = budget.saturating_sub(started.elapsed());
        let kbi = KbiContext::new(self.id.clone(), self.kbi.clone(), self.events.clone());
        let transport = match timeout(remaining, pending.authenticate(&self.config, kbi)).await {
            Ok(result) => result?,
            Err(_) => {
                self.kbi.cancel_all();
                return Err(SshError::Auth(format!(
                    "authentication timed out after {:?}",
                    budget
                )));
            }
        };

        self.install_transport(transport, attempt)
    }

    fn install_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        attempt: Option<u32>,
    ) -> Result<(), SshError> {
        let mut s = self.state.lock();
        let expected = match attempt {
            None => matches!(
                s.status,
                ConnectionStatus::Connecting | ConnectionStatus::Authenticating
            ),
            // A superseded attempt must not install over its successor
            Some(n) => {
                matches!(
                    s.status,
                    ConnectionStatus::Reconnecting | ConnectionStatus::Paused
                ) && s.reconnect.as_ref().is_some_and(|m| m.is_current(n))
            }
        };
        if !expected {
            drop(s);
            debug!(
                "Connection {}: discarding transport that is no longer wanted",
                self.id
            );
            tokio::spawn(async move { transport.disconnect().await });
            return Err(SshError::Disconnected);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        s.channels.reset(generation);
        if let Some(monitor) = s.monitor.take() {
            monitor.abort();
        }
        s.monitor = Some(self.spawn_monitor(generation, transport.subscribe_closed()));
        s.transport = Some(transport);
        self.set_status(&mut s, ConnectionStatus::Connected);
        info!(
            "Connection {}: connected (generation {})",
            self.id, generation
        );
        Ok(())
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        generation: u64,
        mut closed: watch::Receiver<Option<String>>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = match closed.wait_for(|reason| reason.is_some()).await {
                Ok(reason) => reason.clone().unwrap_or_default(),
                Err(_) => "transport closed".to_string(),
            };
            if let Some(conn) = weak.upgrade() {
                conn.on_transport_closed(generation, reason);
            }
        })
    }

    fn on_transport_closed(self: &Arc<Self>, generation: u64, reason: String) {
        let mut s = self.state.lock();
        if self.generation() != generation || s.status != ConnectionStatus::Connected {
            return;
        }
        warn!("Connection {}: transport lost: {}", self.id, reason);

        s.transport = None;
        s.monitor = None;
        s.channels.close_all();
        let err = SshError::TransportDropped(reason);

        match self.config.reconnection.as_ref().filter(|p| p.enabled) {
            Some(policy) => {
                self.set_status(&mut s, ConnectionStatus::Reconnecting);
                self.emit_error(&err);
                let manager = match &s.reconnect {
                    Some(manager) => manager.clone(),
                    None => {
                        let (manager, rx) = ReconnectionManager::with_channel(policy.clone());
                        s.driver = Some(self.spawn_driver(rx));
                        s.reconnect = Some(manager.clone());
                        manager
                    }
                };
                manager.start(&self.config.session_id);
            }
            None => {
                self.set_status(&mut s, ConnectionStatus::Error);
                self.emit_error(&err);
            }
        }
    }

    fn spawn_driver(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ReconnectEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                conn.events.emit(ConnectionEvent::Reconnect {
                    connection_id: conn.id.clone(),
                    reconnect: event.clone(),
                });
                match event {
                    ReconnectEvent::Attempt { attempt, .. } => conn.run_attempt(attempt).await,
                    ReconnectEvent::Exhausted { attempts } => conn.on_exhausted(attempts),
                    _ => {}
                }
            }
        })
    }

    fn manager(&self) -> Option<ReconnectionManager> {
        self.state.lock().reconnect.clone()
    }

    async fn run_attempt(self: &Arc<Self>, attempt: u32) {
        if self.status() != ConnectionStatus::Reconnecting {
            debug!(
                "Connection {}: skipping reconnect attempt {} while {}",
                self.id,
                attempt,
                self.status()
            );
            return;
        }
        let Some(manager) = self.manager() else {
            return;
        };
        if !manager.is_current(attempt) {
            debug!(
                "Connection {}: skipping superseded reconnect attempt {}",
                self.id, attempt
            );
            return;
        }

        info!("Connection {}: reconnect attempt {}", self.id, attempt);
        let result = tokio::select! {
            r = self.establish(Some(attempt)) => r,
            _ = self.interrupt.notified() => Err(SshError::Disconnected),
            _ = self.superseded.notified() => Err(SshError::Disconnected),
        };
        match result {
            Ok(()) => {
                manager.on_success(attempt);
            }
            Err(SshError::Disconnected) => {
                debug!("Connection {}: attempt {} abandoned", self.id, attempt);
            }
            Err(e) => {
                manager.on_failure(attempt, e.to_string());
            }
        }
    }

    fn on_exhausted(&self, attempts: u32) {
        let mut s = self.state.lock();
        if !matches!(
            s.status,
            ConnectionStatus::Reconnecting | ConnectionStatus::Paused
        ) {
            return;
        }
        self.set_status(&mut s, ConnectionStatus::Error);
        self.emit_error(&SshError::ReconnectionExhausted(attempts));
    }

    /// Disconnect from any state: reconnection is cancelled and all channels are
    /// closed immediately.
    pub async fn disconnect(&self) {
        let transport = {
            let mut s = self.state.lock();
            self.set_status(&mut s, ConnectionStatus::Disconnected);
            if let Some(manager) = &s.reconnect {
                manager.cancel();
            }
            if let Some(monitor) = s.monitor.take() {
                monitor.abort();
            }
            s.channels.close_all();
            s.transport.take()
        };
        self.interrupt.notify_waiters();
        self.kbi.cancel_all();

        if let Some(transport) = transport {
            info!("Connection {}: disconnecting", self.id);
            transport.disconnect().await;
        }
    }

    /// Disconnect and release everything; listeners observe end-of-stream.
    pub async fn destroy(&self) {
        self.disconnect().await;
        {
            let mut s = self.state.lock();
            if let Some(driver) = s.driver.take() {
                driver.abort();
            }
            s.reconnect = None;
        }
        self.events.close();
        info!("Connection {} destroyed", self.id);
    }

    // ========================================================================
    // Reconnection controls
    // ========================================================================

    /// Attempt immediately. Valid while reconnecting, paused, or in `error`
    /// after a drop. An attempt still in flight is abandoned in favour of the
    /// new one. Returns the attempt number.
    pub fn retry_now(&self) -> Result<u32, SshError> {
        let mut s = self.state.lock();
        if !matches!(
            s.status,
            ConnectionStatus::Reconnecting | ConnectionStatus::Paused | ConnectionStatus::Error
        ) {
            return Err(SshError::InvalidState(format!(
                "cannot retry while {}",
                s.status
            )));
        }
        let Some(manager) = s.reconnect.clone() else {
            return Err(SshError::InvalidState(
                "no reconnection in progress".to_string(),
            ));
        };
        self.set_status(&mut s, ConnectionStatus::Reconnecting);
        let attempt = manager.retry_now();
        self.superseded.notify_waiters();
        Ok(attempt)
    }

    pub fn pause_reconnection(&self) -> Result<(), SshError> {
        let mut s = self.state.lock();
        if s.status != ConnectionStatus::Reconnecting {
            return Err(SshError::InvalidState(format!(
                "cannot pause reconnection while {}",
                s.status
            )));
        }
        let paused = s.reconnect.as_ref().is_some_and(|m| m.pause());
        if !paused {
            return Err(SshError::InvalidState(
                "no pending reconnect attempt".to_string(),
            ));
        }
        self.set_status(&mut s, ConnectionStatus::Paused);
        Ok(())
    }

    pub fn resume_reconnection(&self) -> Result<(), SshError> {
        let mut s = self.state.lock();
        if s.status != ConnectionStatus::Paused {
            return Err(SshError::InvalidState(format!(
                "cannot resume reconnection while {}",
                s.status
            )));
        }
        // The manager's next Attempt is handled after this lock is released,
        // so it observes `reconnecting`.
        let resumed = s.reconnect.as_ref().is_some_and(|m| m.resume());
        if !resumed {
            return Err(SshError::InvalidState(
                "reconnection is not paused".to_string(),
            ));
        }
        self.set_status(&mut s, ConnectionStatus::Reconnecting);
        Ok(())
    }

    /// Stop reconnecting and settle in `disconnected`.
    pub fn cancel_reconnection(&self) -> Result<(), SshError> {
        let mut s = self.state.lock();
        if !matches!(
            s.status,
            ConnectionStatus::Reconnecting | ConnectionStatus::Paused
        ) {
            return Err(SshError::InvalidState(format!(
                "no reconnection to cancel while {}",
                s.status
            )));
        }
        if let Some(manager) = &s.reconnect {
            manager.cancel();
        }
        self.set_status(&mut s, ConnectionStatus::Disconnected);
        drop(s);
        self.interrupt.notify_waiters();
        self.kbi.cancel_all();
        Ok(())
    }

    // ========================================================================
    // Keyboard-interactive
    // ========================================================================

    pub fn respond_keyboard_interactive(
        &self,
        auth_flow_id: &str,
        responses: Vec<String>,
    ) -> Result<(), KbiError> {
        self.kbi.complete(auth_flow_id, responses)
    }

    pub fn cancel_keyboard_interactive(&self, auth_flow_id: &str) -> Result<(), KbiError> {
        self.kbi.cancel(auth_flow_id)
    }

    // ========================================================================
    // Channels
    // ========================================================================

    fn connected_transport(
        s: &ConnectionState,
    ) -> Result<(Arc<dyn Transport>, u64), SshError> {
        if s.status != ConnectionStatus::Connected {
            return Err(SshError::InvalidState(format!("not connected ({})", s.status)));
        }
        let transport = s.transport.clone().ok_or(SshError::Disconnected)?;
        Ok((transport, s.channels.generation()))
    }

    /// Open a shell channel on the current transport under the caller's `id`.
    pub async fn open_shell(
        &self,
        id: impl Into<String>,
        options: ShellOptions,
    ) -> Result<OpenedShell, SshError> {
        let id = id.into();
        let (transport, generation) = {
            let s = self.state.lock();
            let current = Self::connected_transport(&s)?;
            if s.channels.contains(&id) {
                return Err(SshError::Channel(format!("Shell {} is already open", id)));
            }
            current
        };

        let io = transport.open_shell(&options).await?;
        let handle = ShellHandle { id, generation };

        let mut s = self.state.lock();
        let current = self.generation();
        if current != generation {
            let _ = io.commands.try_send(ShellCommand::Close);
            return Err(SshError::StaleChannel {
                handle: generation,
                current,
            });
        }
        if s.status != ConnectionStatus::Connected {
            let _ = io.commands.try_send(ShellCommand::Close);
            return Err(SshError::Channel("transport lost while opening shell".into()));
        }
        if let Err(e) = s.channels.insert_shell(&handle, io.commands.clone()) {
            let _ = io.commands.try_send(ShellCommand::Close);
            return Err(e);
        }
        debug!(
            "Connection {}: shell {} opened on generation {}",
            self.id, handle.id, generation
        );
        Ok(OpenedShell {
            handle,
            output: io.output,
        })
    }

    pub async fn write_to_shell(&self, handle: &ShellHandle, data: &[u8]) -> Result<(), SshError> {
        let tx = self.state.lock().channels.shell(handle)?;
        tx.send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::Channel(format!("Shell {} is closed", handle.id)))
    }

    pub async fn resize_shell(&self, handle: &ShellHandle, cols: u32, rows: u32) -> Result<(), SshError> {
        let tx = self.state.lock().channels.shell(handle)?;
        tx.send(ShellCommand::Resize { cols, rows })
            .await
            .map_err(|_| SshError::Channel(format!("Shell {} is closed", handle.id)))
    }

    pub async fn close_shell(&self, handle: &ShellHandle) -> Result<(), SshError> {
        let tx = self.state.lock().channels.remove_shell(handle)?;
        // Already-finished bridges need no close
        let _ = tx.send(ShellCommand::Close).await;
        Ok(())
    }

    /// The file-transfer channel of the current generation, opened on first use.
    ///
    /// After a reconnect, channels from earlier generations reject every
    /// operation; callers must fetch a new one.
    pub async fn get_file_transfer_channel(&self) -> Result<FileTransferChannel, SshError> {
        let (transport, generation) = {
            let s = self.state.lock();
            let current = Self::connected_transport(&s)?;
            if let Some(channel) = s.channels.file_transfer() {
                return Ok(channel);
            }
            current
        };

        let fs = transport.open_file_transfer().await?;
        let channel = FileTransferChannel::new(fs, generation, self.generation.clone());

        let mut s = self.state.lock();
        let current = self.generation();
        if current != generation || s.status != ConnectionStatus::Connected {
            return Err(SshError::StaleChannel {
                handle: generation,
                current,
            });
        }
        Ok(s.channels.set_file_transfer(channel))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let s = self.state.get_mut();
        if let Some(monitor) = s.monitor.take() {
            monitor.abort();
        }
        if let Some(driver) = s.driver.take() {
            driver.abort();
        }
        if let Some(manager) = s.reconnect.take() {
            manager.cancel();
        }
    }
}
