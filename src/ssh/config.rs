//! SSH Configuration

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use russh::{client, Preferred};
use serde::{Deserialize, Serialize};

use crate::config::ConnectionDefaults;
use crate::session::ReconnectionPolicy;

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication strategy
    pub auth: AuthStrategy,

    /// Optional SOCKS/HTTP proxy in front of the TCP connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub algorithms: AlgorithmPreferences,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Budget for proxy + handshake + authentication, in seconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Automatic reconnection after an unexpected drop (None = disabled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnection: Option<ReconnectionPolicy>,

    /// Logical session id, stable across reconnects
    #[serde(default = "new_session_id")]
    pub session_id: String,

    /// Trust host keys seen for the first time
    /// - true: record and accept unknown keys
    /// - false: reject unknown keys
    ///
    /// Changed keys are always rejected.
    #[serde(default = "default_true")]
    pub accept_new_host_keys: bool,
}

fn default_port() -> u16 {
    22
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthStrategy) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth,
            proxy: None,
            algorithms: AlgorithmPreferences::default(),
            keepalive: KeepaliveConfig::default(),
            ready_timeout_secs: default_ready_timeout(),
            reconnection: None,
            session_id: new_session_id(),
            accept_new_host_keys: true,
        }
    }

    /// Apply persisted engine defaults (keepalive, ready timeout, reconnection).
    pub fn with_defaults(mut self, defaults: &ConnectionDefaults) -> Self {
        self.keepalive = defaults.keepalive.clone();
        self.ready_timeout_secs = defaults.ready_timeout_secs;
        self.reconnection = Some(defaults.reconnection.clone());
        self
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs.max(1))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the russh client configuration (keepalive + algorithm preferences).
    pub fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            // Liveness is driven by keepalives; an idle shell is not an error
            inactivity_timeout: None,
            keepalive_interval: self.keepalive.interval(),
            keepalive_max: self.keepalive.max_missed,
            preferred: self.algorithms.to_preferred(),
            ..Default::default()
        })
    }
}

/// Authentication strategies supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthStrategy {
    Password { password: String },

    /// Unencrypted private key
    PublicKey { key_path: String },

    PublicKeyWithPassphrase { key_path: String, passphrase: String },

    /// Offer the key first; fall back to the password when the server still
    /// lists `password` among the remaining methods.
    PublicKeyThenPassword {
        key_path: String,
        #[serde(default)]
        passphrase: Option<String>,
        password: String,
    },

    /// Keyboard-Interactive (2FA/TOTP)
    ///
    /// `saved_responses` maps a prompt text to its answer. Prompts that cannot
    /// be answered from saved data are delegated to the caller.
    KeyboardInteractive {
        #[serde(default)]
        saved_responses: HashMap<String, String>,
        #[serde(default)]
        password: Option<String>,
    },

    /// SSH agent authentication
    Agent,

    /// Kerberos/GSSAPI, best effort
    Gssapi,

    /// The `none` method
    None,
}

impl AuthStrategy {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        match passphrase {
            Some(passphrase) => Self::PublicKeyWithPassphrase {
                key_path: key_path.into(),
                passphrase,
            },
            None => Self::PublicKey {
                key_path: key_path.into(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::PublicKey { .. } => "public_key",
            Self::PublicKeyWithPassphrase { .. } => "public_key_with_passphrase",
            Self::PublicKeyThenPassword { .. } => "public_key_then_password",
            Self::KeyboardInteractive { .. } => "keyboard_interactive",
            Self::Agent => "agent",
            Self::Gssapi => "gssapi",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Socks4,
    Socks5,
    Http,
}

/// Proxy in front of the SSH TCP connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Transport keepalive settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between keepalive probes (0 disables keepalive)
    pub interval_secs: u64,
    /// Unanswered probes tolerated before the transport is considered dead
    pub max_missed: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_missed: 3,
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// Algorithm preferences
///
/// Names listed here move to the front of russh's defaults in the given order.
/// Unknown names are ignored; algorithms not listed keep their default order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmPreferences {
    pub kex: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub compression: bool,
}

impl AlgorithmPreferences {
    pub fn to_preferred(&self) -> Preferred {
        let base = if self.compression {
            Preferred::COMPRESSED
        } else {
            Preferred::DEFAULT
        };
        Preferred {
            kex: reorder(&base.kex, &self.kex),
            cipher: reorder(&base.cipher, &self.ciphers),
            mac: reorder(&base.mac, &self.macs),
            ..base
        }
    }
}

fn reorder<N>(defaults: &[N], preferred: &[String]) -> Cow<'static, [N]>
where
    N: Clone + AsRef<str> + 'static,
{
    let mut ordered: Vec<N> = preferred
        .iter()
        .filter_map(|name| defaults.iter().find(|d| d.as_ref() == name.as_str()).cloned())
        .collect();
    for name in defaults {
        if !ordered.iter().any(|o| o.as_ref() == name.as_ref()) {
            ordered.push(name.clone());
        }
    }
    Cow::Owned(ordered)
}

/// PTY parameters for a new shell channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellOptions {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_config() {
        let json = r#"{
            "host": "example.com",
            "username": "deploy",
            "auth": { "type": "password", "password": "hunter2" }
        }"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.ready_timeout_secs, 30);
        assert!(config.reconnection.is_none());
        assert!(config.accept_new_host_keys);
        assert!(!config.session_id.is_empty());
        assert_eq!(config.keepalive, KeepaliveConfig::default());
    }

    #[test]
    fn test_keyboard_interactive_strategy_json() {
        let json = r#"{
            "type": "keyboard_interactive",
            "saved_responses": { "Verification code: ": "123456" }
        }"#;
        let strategy: AuthStrategy = serde_json::from_str(json).unwrap();
        match strategy {
            AuthStrategy::KeyboardInteractive {
                saved_responses,
                password,
            } => {
                assert_eq!(saved_responses.len(), 1);
                assert!(password.is_none());
            }
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn test_key_helper_picks_variant() {
        assert!(matches!(
            AuthStrategy::key("~/.ssh/id_ed25519", None),
            AuthStrategy::PublicKey { .. }
        ));
        assert!(matches!(
            AuthStrategy::key("~/.ssh/id_ed25519", Some("pw".into())),
            AuthStrategy::PublicKeyWithPassphrase { .. }
        ));
    }

    #[test]
    fn test_keepalive_zero_disables() {
        let keepalive = KeepaliveConfig {
            interval_secs: 0,
            max_missed: 3,
        };
        assert!(keepalive.interval().is_none());
    }

    #[test]
    fn test_reorder_moves_preferred_first() {
        let defaults = ["a", "b", "c"];
        let preferred = vec!["c".to_string(), "zz".to_string()];
        let ordered = reorder(&defaults, &preferred);
        assert_eq!(ordered.as_ref(), &["c", "a", "b"]);
    }

    #[test]
    fn test_algorithm_preferences_keep_all_defaults() {
        let prefs = AlgorithmPreferences::default();
        let preferred = prefs.to_preferred();
        assert_eq!(preferred.kex.len(), Preferred::DEFAULT.kex.len());
        assert_eq!(preferred.cipher.len(), Preferred::DEFAULT.cipher.len());
    }
}
