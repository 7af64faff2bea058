//! Host key verification gate
//!
//! The russh handler consults a [`HostKeyVerifier`] before the handshake
//! proceeds. Storage of known keys is up to the embedding application;
//! [`KnownHostKeys`] is an in-memory store keyed by `host:port`.

use dashmap::DashMap;
use tracing::{info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Fingerprint matches the recorded key
    Trusted,
    /// Host has no recorded key
    Unknown,
    /// Key changed from the recorded one (possible MITM)
    Changed { expected: String },
}

pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, fingerprint: &str) -> HostKeyStatus;

    /// Record a key accepted on first use.
    fn trust(&self, host: &str, port: u16, fingerprint: &str);
}

#[derive(Debug, Default)]
pub struct KnownHostKeys {
    keys: DashMap<String, String>,
}

impl KnownHostKeys {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(host: &str, port: u16) -> String {
        format!("{}:{}", host.to_ascii_lowercase(), port)
    }

    pub fn insert(&self, host: &str, port: u16, fingerprint: impl Into<String>) {
        self.keys.insert(Self::key(host, port), fingerprint.into());
    }

    pub fn remove(&self, host: &str, port: u16) -> Option<String> {
        self.keys.remove(&Self::key(host, port)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl HostKeyVerifier for KnownHostKeys {
    fn verify(&self, host: &str, port: u16, fingerprint: &str) -> HostKeyStatus {
        match self.keys.get(&Self::key(host, port)) {
            Some(known) if known.value() == fingerprint => HostKeyStatus::Trusted,
            Some(known) => HostKeyStatus::Changed {
                expected: known.value().clone(),
            },
            None => HostKeyStatus::Unknown,
        }
    }

    fn trust(&self, host: &str, port: u16, fingerprint: &str) {
        info!("Recording host key for {}:{} ({})", host, port, fingerprint);
        self.insert(host, port, fingerprint);
    }
}

/// Decide whether the handshake may continue.
pub(crate) fn check_host_key(
    verifier: &dyn HostKeyVerifier,
    host: &str,
    port: u16,
    fingerprint: &str,
    accept_new: bool,
) -> Result<(), String> {
    match verifier.verify(host, port, fingerprint) {
        HostKeyStatus::Trusted => Ok(()),
        HostKeyStatus::Unknown if accept_new => {
            verifier.trust(host, port, fingerprint);
            Ok(())
        }
        HostKeyStatus::Unknown => {
            warn!(
                "Unknown host key for {}:{} ({}), rejecting",
                host, port, fingerprint
            );
            Err(format!(
                "Host key verification failed: unknown host {}:{} (fingerprint {})",
                host, port, fingerprint
            ))
        }
        HostKeyStatus::Changed { expected } => {
            warn!(
                "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                host, port, expected, fingerprint
            );
            Err(format!(
                "Host key for {}:{} has changed (expected {}, got {})",
                host, port, expected, fingerprint
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_host_trusted_on_first_use() {
        let store = KnownHostKeys::new();
        assert!(check_host_key(&store, "Example.com", 22, "SHA256:abc", true).is_ok());
        assert_eq!(
            store.verify("example.com", 22, "SHA256:abc"),
            HostKeyStatus::Trusted
        );
    }

    #[test]
    fn test_unknown_host_rejected_when_not_accepting() {
        let store = KnownHostKeys::new();
        assert!(check_host_key(&store, "example.com", 22, "SHA256:abc", false).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_changed_key_always_rejected() {
        let store = KnownHostKeys::new();
        store.insert("example.com", 22, "SHA256:old");

        let err = check_host_key(&store, "example.com", 22, "SHA256:new", true).unwrap_err();
        assert!(err.contains("changed"));
        assert_eq!(
            store.verify("example.com", 22, "SHA256:new"),
            HostKeyStatus::Changed {
                expected: "SHA256:old".into()
            }
        );
    }

    #[test]
    fn test_ports_are_distinct_hosts() {
        let store = KnownHostKeys::new();
        store.insert("example.com", 22, "SHA256:a");
        assert_eq!(
            store.verify("example.com", 2222, "SHA256:a"),
            HostKeyStatus::Unknown
        );
    }
}
