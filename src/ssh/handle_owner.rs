//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through [`HandleController`], which sends commands over an mpsc channel.
//! This keeps `.await` on the handle out of any lock and serializes channel
//! opens on the session.
//!
//! The owner also watches the session: once the handle reports closed (peer
//! gone, missed keepalives) or a disconnect is requested, it publishes the
//! reason on a watch channel that [`Transport::subscribe_closed`] exposes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::client::ClientHandler;
use super::config::ShellOptions;
use super::error::SshError;
use super::transport::{ShellCommand, ShellIo, ShellOutput, Transport};
use crate::sftp::{RemoteFs, RusshRemoteFs};

/// How often the owner polls the handle for a dead session
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell or a subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    closed_rx: watch::Receiver<Option<String>>,
    session_id: String,
}

impl HandleController {
    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::Channel(e.to_string()))
    }
}

#[async_trait]
impl Transport for HandleController {
    async fn open_shell(&self, options: &ShellOptions) -> Result<ShellIo, SshError> {
        let channel = self.open_session_channel().await?;

        channel
            .request_pty(false, &options.term, options.cols, options.rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::Channel(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::Channel(format!("Shell request failed: {}", e)))?;

        info!("Interactive shell started for session {}", self.session_id);

        let (cmd_tx, cmd_rx) = mpsc::channel::<ShellCommand>(1024);
        let (out_tx, out_rx) = mpsc::channel::<ShellOutput>(1024);
        tokio::spawn(run_shell_channel(channel, cmd_rx, out_tx, self.session_id.clone()));

        Ok(ShellIo {
            commands: cmd_tx,
            output: out_rx,
        })
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        info!("Opening SFTP subsystem for session {}", self.session_id);
        let channel = self.open_session_channel().await?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Channel(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Channel(format!("SFTP subsystem not available: {}", e)))?;

        info!("SFTP subsystem opened for session {}", self.session_id);
        Ok(Arc::new(RusshRemoteFs::new(sftp)))
    }

    fn subscribe_closed(&self) -> watch::Receiver<Option<String>> {
        self.closed_rx.clone()
    }

    async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }
}

/// Bridge one shell channel to its command/output queues.
async fn run_shell_channel(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    out_tx: mpsc::Sender<ShellOutput>,
    sid: String,
) {
    debug!("Shell channel handler started for session {}", sid);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ShellCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            error!("Failed to send data to SSH channel: {}", e);
                            break;
                        }
                    }
                    Some(ShellCommand::Resize { cols, rows }) => {
                        debug!("Sending window_change: {}x{} for session {}", cols, rows, sid);
                        if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                            // Resize failures leave the shell usable
                            error!("Failed to resize PTY: {}", e);
                        }
                    }
                    Some(ShellCommand::Close) | None => {
                        info!("Closing shell channel for session {}", sid);
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let _ = out_tx.send(ShellOutput::Data(data.to_vec())).await;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            let _ = out_tx.send(ShellOutput::Stderr(data.to_vec())).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("SSH channel exit status {} for session {}", exit_status, sid);
                        let _ = out_tx.send(ShellOutput::ExitStatus(exit_status)).await;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        info!("SSH channel closed for session {}", sid);
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let _ = out_tx.send(ShellOutput::Closed).await;
    debug!("Shell channel handler terminated for session {}", sid);
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a [`HandleController`].
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, session_id: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (closed_tx, closed_rx) = watch::channel::<Option<String>>(None);
    let sid = session_id.clone();

    tokio::spawn(async move {
        let handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Handle owner task started for session {}", sid);

        let reason = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                        let result = handle.channel_open_session().await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving channel_open_session result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for session {}", sid);
                        break "disconnect requested".to_string();
                    }
                    None => {
                        info!("All controllers dropped for session {}", sid);
                        break "controller dropped".to_string();
                    }
                },

                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH session {} closed by peer or keepalive", sid);
                        break "connection lost".to_string();
                    }
                }
            }
        };

        let _ = closed_tx.send(Some(reason));
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", sid);
    });

    HandleController {
        cmd_tx,
        closed_rx,
        session_id,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
