//! Transport seam
//!
//! [`super::Connection`] drives any implementation of these traits; the russh
//! implementation lives in [`super::client`] and [`super::handle_owner`].
//!
//! Connecting is split in two so the connection can report `authenticating`
//! and attribute a ready-timeout to the right phase:
//! [`TransportConnector::handshake`] (proxy + key exchange) returns a
//! [`PendingAuth`], whose [`PendingAuth::authenticate`] yields the usable
//! [`Transport`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::config::{ConnectionConfig, ShellOptions};
use super::error::SshError;
use super::event::ConnectionEvent;
use super::keyboard_interactive::KbiContext;
use crate::events::EventBus;
use crate::sftp::RemoteFs;

/// What the connector may need from its owning connection
#[derive(Clone)]
pub struct HandshakeContext {
    pub connection_id: String,
    pub events: EventBus<ConnectionEvent>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn handshake(
        &self,
        config: &ConnectionConfig,
        ctx: &HandshakeContext,
    ) -> Result<Box<dyn PendingAuth>, SshError>;
}

#[async_trait]
pub trait PendingAuth: Send {
    async fn authenticate(
        self: Box<Self>,
        config: &ConnectionConfig,
        kbi: KbiContext,
    ) -> Result<Arc<dyn Transport>, SshError>;
}

/// An authenticated transport
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_shell(&self, options: &ShellOptions) -> Result<ShellIo, SshError>;

    async fn open_file_transfer(&self) -> Result<Arc<dyn RemoteFs>, SshError>;

    /// Becomes `Some(reason)` once the transport is gone, for whatever reason.
    fn subscribe_closed(&self) -> watch::Receiver<Option<String>>;

    async fn disconnect(&self);
}

/// Commands to a shell channel
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Close,
}

/// Output from a shell channel
#[derive(Debug, Clone, PartialEq)]
pub enum ShellOutput {
    Data(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    Closed,
}

/// Both ends of an open shell channel
pub struct ShellIo {
    pub commands: mpsc::Sender<ShellCommand>,
    pub output: mpsc::Receiver<ShellOutput>,
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-process transport for state machine tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::sftp::memory::MemoryFs;
    use crate::ssh::keyboard_interactive::KbiPrompt;

    /// Scripted result of one connect attempt
    #[derive(Debug, Clone)]
    pub enum Outcome {
        Succeed,
        ProxyFail,
        HandshakeFail,
        AuthFail,
        /// Ask the caller one keyboard-interactive question, succeed on any answer
        AskCode,
        /// Never finish the handshake
        Hang,
    }

    #[derive(Default)]
    pub struct MockConnector {
        script: Mutex<VecDeque<Outcome>>,
        pub attempts: AtomicUsize,
        transports: Mutex<Vec<Arc<MockTransport>>>,
    }

    impl MockConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue outcomes; once the script is empty every attempt succeeds.
        pub fn push(&self, outcomes: impl IntoIterator<Item = Outcome>) {
            self.script.lock().extend(outcomes);
        }

        pub fn transport(&self, index: usize) -> Arc<MockTransport> {
            self.transports.lock()[index].clone()
        }

        pub fn latest(&self) -> Arc<MockTransport> {
            self.transports
                .lock()
                .last()
                .cloned()
                .expect("no transport created yet")
        }

        pub fn transport_count(&self) -> usize {
            self.transports.lock().len()
        }
    }

    #[async_trait]
    impl TransportConnector for MockConnector {
        async fn handshake(
            &self,
            _config: &ConnectionConfig,
            _ctx: &HandshakeContext,
        ) -> Result<Box<dyn PendingAuth>, SshError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.lock().pop_front().unwrap_or(Outcome::Succeed);
            match outcome {
                Outcome::ProxyFail => Err(SshError::Proxy("proxy refused".into())),
                Outcome::HandshakeFail => Err(SshError::Handshake("connection refused".into())),
                Outcome::Hang => std::future::pending().await,
                outcome => {
                    let transport = Arc::new(MockTransport::new());
                    self.transports.lock().push(transport.clone());
                    Ok(Box::new(MockPending { outcome, transport }))
                }
            }
        }
    }

    struct MockPending {
        outcome: Outcome,
        transport: Arc<MockTransport>,
    }

    #[async_trait]
    impl PendingAuth for MockPending {
        async fn authenticate(
            self: Box<Self>,
            _config: &ConnectionConfig,
            kbi: KbiContext,
        ) -> Result<Arc<dyn Transport>, SshError> {
            match self.outcome {
                Outcome::AuthFail => Err(SshError::Auth("password rejected".into())),
                Outcome::AskCode => {
                    kbi.request(
                        String::new(),
                        String::new(),
                        vec![KbiPrompt {
                            prompt: "Verification code: ".into(),
                            echo: false,
                        }],
                    )
                    .await?;
                    Ok(self.transport)
                }
                _ => Ok(self.transport),
            }
        }
    }

    pub struct MockTransport {
        closed_tx: watch::Sender<Option<String>>,
        pub written: Arc<Mutex<Vec<ShellCommand>>>,
        pub fs: Arc<MemoryFs>,
        pub shells_opened: AtomicUsize,
        pub file_channels_opened: AtomicUsize,
    }

    impl MockTransport {
        fn new() -> Self {
            let (closed_tx, _) = watch::channel(None);
            Self {
                closed_tx,
                written: Arc::new(Mutex::new(Vec::new())),
                fs: Arc::new(MemoryFs::new()),
                shells_opened: AtomicUsize::new(0),
                file_channels_opened: AtomicUsize::new(0),
            }
        }

        /// Simulate the peer going away.
        pub fn drop_link(&self, reason: &str) {
            self.closed_tx.send_replace(Some(reason.to_string()));
        }

        pub fn is_closed(&self) -> bool {
            self.closed_tx.borrow().is_some()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open_shell(&self, _options: &ShellOptions) -> Result<ShellIo, SshError> {
            if self.is_closed() {
                return Err(SshError::Channel("transport closed".into()));
            }
            self.shells_opened.fetch_add(1, Ordering::SeqCst);
            let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
            let (out_tx, out_rx) = mpsc::channel(32);
            let written = self.written.clone();
            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    let close = cmd == ShellCommand::Close;
                    if let ShellCommand::Data(data) = &cmd {
                        // Echo like a remote tty
                        let _ = out_tx.send(ShellOutput::Data(data.clone())).await;
                    }
                    written.lock().push(cmd);
                    if close {
                        let _ = out_tx.send(ShellOutput::Closed).await;
                        break;
                    }
                }
            });
            Ok(ShellIo {
                commands: cmd_tx,
                output: out_rx,
            })
        }

        async fn open_file_transfer(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
            if self.is_closed() {
                return Err(SshError::Channel("transport closed".into()));
            }
            self.file_channels_opened.fetch_add(1, Ordering::SeqCst);
            Ok(self.fs.clone())
        }

        fn subscribe_closed(&self) -> watch::Receiver<Option<String>> {
            self.closed_tx.subscribe()
        }

        async fn disconnect(&self) {
            self.closed_tx
                .send_replace(Some("disconnect requested".to_string()));
        }
    }
}
