//! Authentication negotiation
//!
//! An [`AuthStrategy`] is turned into an [`AuthPlan`]: an ordered list of
//! [`AuthStep`]s plus a rejection handler that is consulted once per server
//! reply with the methods the server still offers. The public-key-then-password
//! strategy lives entirely in that handler: the password is only sent when the
//! key was refused *and* the server still lists `password`.
//!
//! [`AuthNegotiator`] executes the plan against a russh handle.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::client::ClientHandler;
use super::config::AuthStrategy;
use super::error::SshError;
use super::keyboard_interactive::{resolve_saved_responses, KbiContext, KbiPrompt};

/// Authentication methods a server can offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethodKind {
    None,
    Password,
    PublicKey,
    KeyboardInteractive,
    HostBased,
}

fn offered_methods(methods: &MethodSet) -> Vec<AuthMethodKind> {
    [
        (MethodKind::None, AuthMethodKind::None),
        (MethodKind::Password, AuthMethodKind::Password),
        (MethodKind::PublicKey, AuthMethodKind::PublicKey),
        (MethodKind::KeyboardInteractive, AuthMethodKind::KeyboardInteractive),
        (MethodKind::HostBased, AuthMethodKind::HostBased),
    ]
    .into_iter()
    .filter(|(kind, _)| methods.contains(kind))
    .map(|(_, ours)| ours)
    .collect()
}

/// One authentication request sent to the server
#[derive(Debug, Clone, PartialEq)]
pub enum AuthStep {
    None,
    Password(String),
    PublicKey {
        key_path: String,
        passphrase: Option<String>,
    },
    KeyboardInteractive {
        saved_responses: HashMap<String, String>,
        password: Option<String>,
    },
    Agent,
}

impl AuthStep {
    pub fn label(&self) -> &'static str {
        match self {
            AuthStep::None => "none",
            AuthStep::Password(_) => "password",
            AuthStep::PublicKey { .. } => "publickey",
            AuthStep::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthStep::Agent => "agent",
        }
    }
}

/// Result of a single step
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Success,
    /// Server refused; `remaining` is what it still offers
    Rejected { remaining: Vec<AuthMethodKind> },
    /// Step could not be sent (unreadable key, ...)
    Unavailable(String),
}

#[derive(Debug)]
pub struct AuthPlan {
    steps: VecDeque<AuthStep>,
    fallback_password: Option<String>,
}

impl AuthPlan {
    pub fn new(strategy: &AuthStrategy) -> Self {
        let mut fallback_password = None;
        let steps = match strategy {
            AuthStrategy::Password { password } => vec![AuthStep::Password(password.clone())],
            AuthStrategy::PublicKey { key_path } => vec![AuthStep::PublicKey {
                key_path: key_path.clone(),
                passphrase: None,
            }],
            AuthStrategy::PublicKeyWithPassphrase {
                key_path,
                passphrase,
            } => vec![AuthStep::PublicKey {
                key_path: key_path.clone(),
                passphrase: Some(passphrase.clone()),
            }],
            AuthStrategy::PublicKeyThenPassword {
                key_path,
                passphrase,
                password,
            } => {
                fallback_password = Some(password.clone());
                vec![AuthStep::PublicKey {
                    key_path: key_path.clone(),
                    passphrase: passphrase.clone(),
                }]
            }
            AuthStrategy::KeyboardInteractive {
                saved_responses,
                password,
            } => vec![AuthStep::KeyboardInteractive {
                saved_responses: saved_responses.clone(),
                password: password.clone(),
            }],
            AuthStrategy::Agent => vec![AuthStep::Agent],
            // russh has no GSSAPI mechanism; `none` is the best remaining effort
            AuthStrategy::Gssapi | AuthStrategy::None => vec![AuthStep::None],
        };
        Self {
            steps: steps.into(),
            fallback_password,
        }
    }

    pub fn first(&mut self) -> Option<AuthStep> {
        self.steps.pop_front()
    }

    /// Server refused the last step and still offers `remaining`.
    pub fn after_rejection(&mut self, remaining: &[AuthMethodKind]) -> Option<AuthStep> {
        if let Some(password) = self.fallback_password.take() {
            if remaining.contains(&AuthMethodKind::Password) {
                return Some(AuthStep::Password(password));
            }
            debug!("Server no longer offers password, skipping fallback");
        }
        self.steps.pop_front()
    }

    /// The last step could not be attempted at all.
    pub fn after_unavailable(&mut self) -> Option<AuthStep> {
        match self.fallback_password.take() {
            Some(password) => Some(AuthStep::Password(password)),
            None => self.steps.pop_front(),
        }
    }
}

/// Errors that can occur during key loading
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read key file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse key: {0}")]
    ParseError(String),

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("Invalid passphrase")]
    InvalidPassphrase,
}

/// Load a private key, expanding `~`.
pub async fn load_private_key_async(
    path: &str,
    passphrase: Option<&str>,
) -> Result<PrivateKey, KeyError> {
    let path = expand_tilde(Path::new(path));
    let passphrase = passphrase.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || load_private_key(&path, passphrase.as_deref()))
        .await
        .map_err(|e| KeyError::ParseError(format!("Task join error: {}", e)))?
}

/// Load a private key from file (sync; use spawn_blocking in async contexts)
pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
    if !path.exists() {
        return Err(KeyError::NotFound(path.to_path_buf()));
    }
    let key_data = std::fs::read_to_string(path)?;

    let is_encrypted =
        key_data.contains("ENCRYPTED") || key_data.contains("Proc-Type: 4,ENCRYPTED");
    if is_encrypted && passphrase.is_none() {
        return Err(KeyError::PassphraseRequired);
    }

    match passphrase {
        Some(pass) => russh::keys::decode_secret_key(&key_data, Some(pass)).map_err(|e| {
            let message = e.to_string();
            if message.contains("decrypt") || message.contains("password") {
                KeyError::InvalidPassphrase
            } else {
                KeyError::ParseError(message)
            }
        }),
        None => russh::keys::decode_secret_key(&key_data, None)
            .map_err(|e| KeyError::ParseError(e.to_string())),
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}

fn outcome(result: Result<AuthResult, russh::Error>) -> Result<AuthOutcome, SshError> {
    match result.map_err(|e| SshError::Auth(e.to_string()))? {
        AuthResult::Success => Ok(AuthOutcome::Success),
        AuthResult::Failure {
            remaining_methods, ..
        } => Ok(AuthOutcome::Rejected {
            remaining: offered_methods(&remaining_methods),
        }),
    }
}

/// Drives an [`AuthPlan`] over an established (unauthenticated) transport.
pub struct AuthNegotiator<'a> {
    username: &'a str,
    strategy: &'a AuthStrategy,
    kbi: KbiContext,
}

impl<'a> AuthNegotiator<'a> {
    pub fn new(username: &'a str, strategy: &'a AuthStrategy, kbi: KbiContext) -> Self {
        Self {
            username,
            strategy,
            kbi,
        }
    }

    pub async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<(), SshError> {
        let mut plan = AuthPlan::new(self.strategy);
        let mut last_problem: Option<String> = None;
        let mut next = plan.first();

        while let Some(step) = next {
            debug!("Trying {} authentication for {}", step.label(), self.username);
            next = match self.attempt(handle, &step).await? {
                AuthOutcome::Success => {
                    info!(
                        "Authenticated {} via {}",
                        self.username,
                        step.label()
                    );
                    return Ok(());
                }
                AuthOutcome::Rejected { remaining } => {
                    debug!(
                        "{} rejected; server offers {:?}",
                        step.label(),
                        remaining
                    );
                    last_problem = Some(format!("{} rejected", step.label()));
                    plan.after_rejection(&remaining)
                }
                AuthOutcome::Unavailable(reason) => {
                    warn!("{} authentication unavailable: {}", step.label(), reason);
                    last_problem = Some(reason);
                    plan.after_unavailable()
                }
            };
        }

        Err(SshError::Auth(format!(
            "{} authentication failed for {}{}",
            self.strategy.name(),
            self.username,
            last_problem
                .map(|p| format!(": {}", p))
                .unwrap_or_default()
        )))
    }

    async fn attempt(
        &self,
        handle: &mut Handle<ClientHandler>,
        step: &AuthStep,
    ) -> Result<AuthOutcome, SshError> {
        match step {
            AuthStep::None => outcome(handle.authenticate_none(self.username).await),
            AuthStep::Password(password) => {
                outcome(handle.authenticate_password(self.username, password).await)
            }
            AuthStep::PublicKey {
                key_path,
                passphrase,
            } => {
                let key = match load_private_key_async(key_path, passphrase.as_deref()).await {
                    Ok(key) => key,
                    Err(e) => return Ok(AuthOutcome::Unavailable(e.to_string())),
                };
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                outcome(handle.authenticate_publickey(self.username, key).await)
            }
            AuthStep::KeyboardInteractive {
                saved_responses,
                password,
            } => {
                self.keyboard_interactive(handle, saved_responses, password.as_deref())
                    .await
            }
            AuthStep::Agent => {
                let mut agent = SshAgentClient::connect().await?;
                if agent.authenticate(handle, self.username).await? {
                    Ok(AuthOutcome::Success)
                } else {
                    Ok(AuthOutcome::Rejected {
                        remaining: Vec::new(),
                    })
                }
            }
        }
    }

    async fn keyboard_interactive(
        &self,
        handle: &mut Handle<ClientHandler>,
        saved: &HashMap<String, String>,
        password: Option<&str>,
    ) -> Result<AuthOutcome, SshError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(self.username, None::<String>)
            .await
            .map_err(|e| SshError::Auth(e.to_string()))?;
        // Saved answers are offered once; a repeated challenge goes to the caller
        let mut saved_used = false;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(AuthOutcome::Success),
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    return Ok(AuthOutcome::Rejected {
                        remaining: Vec::new(),
                    })
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let prompts: Vec<KbiPrompt> = prompts
                        .into_iter()
                        .map(|p| KbiPrompt {
                            prompt: p.prompt,
                            echo: p.echo,
                        })
                        .collect();

                    let answers = if prompts.is_empty() {
                        Vec::new()
                    } else {
                        let saved_answers = if saved_used {
                            None
                        } else {
                            resolve_saved_responses(saved, password, &prompts)
                        };
                        match saved_answers {
                            Some(answers) => {
                                saved_used = true;
                                debug!("Answering {} prompt(s) from saved data", prompts.len());
                                answers
                            }
                            None => self.kbi.request(name, instructions, prompts).await?,
                        }
                    };

                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| SshError::Auth(e.to_string()))?;
                }
            }
        }
    }
}
