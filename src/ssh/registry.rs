//! Connection registry
//!
//! Process-wide table of live [`Connection`]s keyed by connection id, so
//! callers can address a connection by id and tear everything down on exit.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use super::config::ConnectionConfig;
use super::connection::Connection;
use super::event::ConnectionStatus;
use super::host_key::HostKeyVerifier;

/// Serializable summary of one registered connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub status: ConnectionStatus,
    pub generation: u64,
}

impl ConnectionInfo {
    fn of(conn: &Connection) -> Self {
        let config = conn.config();
        Self {
            id: conn.id().to_string(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            status: conn.status(),
            generation: conn.generation(),
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) -> Arc<Connection> {
        self.connections.insert(conn.id().to_string(), conn.clone());
        conn
    }

    /// Build a russh-backed connection and register it.
    pub fn create(
        &self,
        config: ConnectionConfig,
        host_keys: Arc<dyn HostKeyVerifier>,
    ) -> Arc<Connection> {
        self.insert(Connection::russh(config, host_keys))
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|e| e.value().clone())
    }

    /// Unregister and destroy a connection. Returns `false` for unknown ids.
    pub async fn remove(&self, connection_id: &str) -> bool {
        // Entry guard must be released before awaiting
        let Some((_, conn)) = self.connections.remove(connection_id) else {
            return false;
        };
        conn.destroy().await;
        true
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|e| ConnectionInfo::of(e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Disconnect every registered connection, keeping them registered.
    pub async fn disconnect_all(&self) {
        info!("Disconnecting all SSH connections...");

        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        for conn in connections {
            if conn.status() == ConnectionStatus::Disconnected {
                continue;
            }
            conn.disconnect().await;
            if conn.status() != ConnectionStatus::Disconnected {
                warn!("Connection {} did not settle after disconnect", conn.id());
            }
        }

        info!("All SSH connections disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::config::AuthStrategy;
    use crate::ssh::transport::mock::MockConnector;

    fn connection() -> Arc<Connection> {
        let config = ConnectionConfig::new("web-1", "ops", AuthStrategy::password("pw"));
        Connection::new(config, MockConnector::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_get_remove() {
        let registry = ConnectionRegistry::new();
        let conn = registry.insert(connection());
        let id = conn.id().to_string();

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &conn));
        assert_eq!(registry.ids(), vec![id.clone()]);

        let info = &registry.list()[0];
        assert_eq!(info.host, "web-1");
        assert_eq!(info.status, ConnectionStatus::Disconnected);

        assert!(registry.remove(&id).await);
        assert!(!registry.remove(&id).await);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all() {
        let registry = ConnectionRegistry::new();
        let a = registry.insert(connection());
        let b = registry.insert(connection());
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        registry.disconnect_all().await;

        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert_eq!(b.status(), ConnectionStatus::Disconnected);
        assert_eq!(registry.len(), 2);
    }
}
