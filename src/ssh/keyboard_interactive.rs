//! Keyboard-Interactive Authentication (2FA) Support
//!
//! Prompts the negotiator cannot answer from saved data are handed to the
//! caller through a pending-response token:
//!
//! ```text
//! Caller                                 Connection
//!    │                                       │
//!    │◀─── KbiPrompt { auth_flow_id } ───────│ InfoRequest from server
//!    │                                       │ (negotiator suspended)
//!    │──── respond_keyboard_interactive ────▶│ responses routed by flow id
//!    │     or cancel_keyboard_interactive    │
//! ```
//!
//! The registry is owned by one connection. No timeout is imposed here; the
//! connection's ready-timeout bounds the whole authentication phase.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use super::error::SshError;
use super::event::ConnectionEvent;
use crate::events::EventBus;

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    pub prompt: String,
    /// true = show input, false = mask input (password-style)
    pub echo: bool,
}

/// Sent when the server requests input nobody has saved an answer for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPromptEvent {
    pub connection_id: String,
    /// Routes the responses back to the suspended negotiator
    pub auth_flow_id: String,
    /// Display name from server (may be empty)
    pub name: String,
    /// Instructions from server (may be empty)
    pub instructions: String,
    pub prompts: Vec<KbiPrompt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbiError {
    /// User cancelled the authentication
    Cancelled,
    /// Flow already completed, cancelled or never existed
    FlowNotFound,
    /// Number of responses differs from number of prompts
    ResponseCountMismatch { expected: usize, got: usize },
}

impl std::fmt::Display for KbiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KbiError::Cancelled => write!(f, "Authentication cancelled by user"),
            KbiError::FlowNotFound => write!(f, "Authentication flow not found"),
            KbiError::ResponseCountMismatch { expected, got } => {
                write!(f, "Expected {} responses, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for KbiError {}

struct PendingRequest {
    expected: usize,
    sender: oneshot::Sender<Result<Vec<String>, KbiError>>,
}

/// Pending keyboard-interactive requests of one connection
#[derive(Default)]
pub struct KbiRegistry {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl KbiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register before emitting the prompt event so a fast responder always
    /// finds the flow.
    pub fn register(
        &self,
        auth_flow_id: String,
        expected: usize,
    ) -> oneshot::Receiver<Result<Vec<String>, KbiError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            auth_flow_id,
            PendingRequest {
                expected,
                sender: tx,
            },
        );
        rx
    }

    pub fn complete(&self, auth_flow_id: &str, responses: Vec<String>) -> Result<(), KbiError> {
        let mut pending = self.pending.lock();
        let expected = pending
            .get(auth_flow_id)
            .ok_or(KbiError::FlowNotFound)?
            .expected;
        if responses.len() != expected {
            return Err(KbiError::ResponseCountMismatch {
                expected,
                got: responses.len(),
            });
        }
        let request = pending.remove(auth_flow_id).ok_or(KbiError::FlowNotFound)?;
        // Receiver gone means the flow was abandoned (timeout/disconnect)
        let _ = request.sender.send(Ok(responses));
        Ok(())
    }

    pub fn cancel(&self, auth_flow_id: &str) -> Result<(), KbiError> {
        let request = self
            .pending
            .lock()
            .remove(auth_flow_id)
            .ok_or(KbiError::FlowNotFound)?;
        let _ = request.sender.send(Err(KbiError::Cancelled));
        Ok(())
    }

    pub fn cleanup(&self, auth_flow_id: &str) {
        self.pending.lock().remove(auth_flow_id);
    }

    /// Cancel every outstanding flow (disconnect, ready-timeout).
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (flow_id, request) in drained {
            debug!("Cancelling pending keyboard-interactive flow {}", flow_id);
            let _ = request.sender.send(Err(KbiError::Cancelled));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes the flow from the registry when the waiting future is dropped.
struct PendingGuard<'a> {
    registry: &'a KbiRegistry,
    auth_flow_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.cleanup(self.auth_flow_id);
    }
}

/// Everything the negotiator needs to delegate prompts to the caller.
#[derive(Clone)]
pub struct KbiContext {
    connection_id: String,
    registry: Arc<KbiRegistry>,
    events: EventBus<ConnectionEvent>,
}

impl KbiContext {
    pub fn new(
        connection_id: impl Into<String>,
        registry: Arc<KbiRegistry>,
        events: EventBus<ConnectionEvent>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            registry,
            events,
        }
    }

    /// Emit the prompts and suspend until the caller answers or cancels.
    pub async fn request(
        &self,
        name: String,
        instructions: String,
        prompts: Vec<KbiPrompt>,
    ) -> Result<Vec<String>, SshError> {
        let auth_flow_id = uuid::Uuid::new_v4().to_string();
        let rx = self.registry.register(auth_flow_id.clone(), prompts.len());
        let _guard = PendingGuard {
            registry: &self.registry,
            auth_flow_id: &auth_flow_id,
        };

        debug!(
            "Connection {}: delegating {} keyboard-interactive prompt(s), flow {}",
            self.connection_id,
            prompts.len(),
            auth_flow_id
        );
        self.events.emit(ConnectionEvent::KbiPrompt(KbiPromptEvent {
            connection_id: self.connection_id.clone(),
            auth_flow_id: auth_flow_id.clone(),
            name,
            instructions,
            prompts,
        }));

        match rx.await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(e)) => Err(SshError::Auth(e.to_string())),
            Err(_) => Err(SshError::Auth(
                "Keyboard-interactive flow abandoned".to_string(),
            )),
        }
    }
}

/// Answer prompts from saved data, or `None` when the caller must be asked.
///
/// Order: every prompt found in `saved` (matched on trimmed text), then a
/// saved password for a single prompt.
pub fn resolve_saved_responses(
    saved: &HashMap<String, String>,
    password: Option<&str>,
    prompts: &[KbiPrompt],
) -> Option<Vec<String>> {
    if prompts.is_empty() {
        return Some(Vec::new());
    }

    let lookup = |prompt: &str| {
        saved.get(prompt).or_else(|| {
            let trimmed = prompt.trim();
            saved
                .iter()
                .find(|(k, _)| k.trim() == trimmed)
                .map(|(_, v)| v)
        })
    };

    let mapped: Option<Vec<String>> = prompts
        .iter()
        .map(|p| lookup(&p.prompt).cloned())
        .collect();
    if mapped.is_some() {
        return mapped;
    }

    match (prompts.len(), password) {
        (1, Some(password)) => Some(vec![password.to_string()]),
        _ => None,
    }
}
