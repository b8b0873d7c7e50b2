//! Connection registry: the authoritative store of tunnel reservations.
//!
//! Every state change is a compare-and-swap performed under the write lock,
//! so concurrent closers (session teardown, failed ping, cancel request)
//! agree on exactly one winner.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::connection::{
    validate_subdomain, Connection, ConnectionKind, ConnectionStatus, SubdomainValidation, TeamUser,
};
use crate::error::TunnelError;

/// Resolves a secret key to the team member that owns it.
pub trait SecretKeyLookup: Send + Sync {
    fn lookup(&self, secret_key: &str) -> Option<TeamUser>;
}

/// Team members loaded once from a JSON array.
#[derive(Debug, Default)]
pub struct StaticUsers {
    by_key: HashMap<String, TeamUser>,
}

impl StaticUsers {
    pub fn new(users: Vec<TeamUser>) -> Self {
        let by_key = users
            .into_iter()
            .map(|user| (user.secret_key.clone(), user))
            .collect();
        Self { by_key }
    }

    /// Load users from `path`. A missing file yields an empty set.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(
                "Users file {} not found, no secret key will be accepted",
                path.display()
            );
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)?;
        let users: Vec<TeamUser> = serde_json::from_str(&data)?;
        info!("Loaded {} team users from {}", users.len(), path.display());
        Ok(Self::new(users))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl SecretKeyLookup for StaticUsers {
    fn lookup(&self, secret_key: &str) -> Option<TeamUser> {
        self.by_key.get(secret_key).cloned()
    }
}

/// Number of closed records kept for the "recent" listing.
const MAX_CLOSED_RETAINED: usize = 1000;

pub struct ConnectionRegistry {
    users: Arc<dyn SecretKeyLookup>,
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new(users: Arc<dyn SecretKeyLookup>) -> Self {
        Self {
            users,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup_user(&self, secret_key: &str) -> Option<TeamUser> {
        self.users.lookup(secret_key)
    }

    /// Create a Reserved connection for the owner of `secret_key`.
    pub async fn create_reserved(
        &self,
        kind: ConnectionKind,
        subdomain: Option<&str>,
        secret_key: &str,
    ) -> Result<Connection, TunnelError> {
        let user = self
            .users
            .lookup(secret_key)
            .ok_or(TunnelError::InvalidSecretKey)?;

        let subdomain = match kind {
            ConnectionKind::Tcp => None,
            ConnectionKind::Http => {
                let subdomain = subdomain
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(TunnelError::SubdomainRequired)?;
                if validate_subdomain(subdomain) != SubdomainValidation::Valid {
                    return Err(TunnelError::InvalidSubdomain(subdomain.to_string()));
                }
                Some(subdomain.to_string())
            }
        };

        let mut connections = self.connections.write().await;
        if let Some(subdomain) = &subdomain {
            if connections.values().any(|c| c.holds_subdomain(subdomain)) {
                return Err(TunnelError::SubdomainConflict(subdomain.clone()));
            }
        }

        let connection = Connection::new(kind, subdomain, user);
        info!(
            "Reserved {} connection {} for {} (subdomain: {:?})",
            connection.kind, connection.id, connection.created_by.email, connection.subdomain
        );
        connections.insert(connection.id.clone(), connection.clone());
        Ok(connection)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Connection, TunnelError> {
        let connections = self.connections.read().await;
        connections
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::ConnectionNotFound(id.to_string()))
    }

    /// Reserved -> Active, recording the public port (tcp) or proxy backend (http).
    pub async fn mark_active(
        &self,
        id: &str,
        port: Option<u16>,
        backend: Option<String>,
    ) -> Result<Connection, TunnelError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(id)
            .ok_or_else(|| TunnelError::ConnectionNotFound(id.to_string()))?;

        if !connection.status.can_transition_to(ConnectionStatus::Active) {
            return Err(TunnelError::InvalidTransition {
                id: id.to_string(),
                from: connection.status,
                to: ConnectionStatus::Active,
            });
        }

        connection.status = ConnectionStatus::Active;
        connection.started_at = Some(Utc::now());
        connection.port = port;
        connection.backend = backend;
        info!("Connection {} is active", id);
        Ok(connection.clone())
    }

    /// Active -> Closed. Returns `true` only for the caller that performed the
    /// transition; closing an already closed connection is a no-op.
    pub async fn mark_closed(&self, id: &str) -> Result<bool, TunnelError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(id)
            .ok_or_else(|| TunnelError::ConnectionNotFound(id.to_string()))?;

        match connection.status {
            ConnectionStatus::Closed => {
                debug!("Connection {} already closed", id);
                Ok(false)
            }
            ConnectionStatus::Active => {
                connection.status = ConnectionStatus::Closed;
                connection.closed_at = Some(Utc::now());
                info!("Connection {} closed", id);
                Ok(true)
            }
            ConnectionStatus::Reserved => Err(TunnelError::InvalidTransition {
                id: id.to_string(),
                from: ConnectionStatus::Reserved,
                to: ConnectionStatus::Closed,
            }),
        }
    }

    pub async fn list_active(&self) -> Vec<Connection> {
        let connections = self.connections.read().await;
        let mut active: Vec<Connection> = connections
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.id.cmp(&a.id));
        active
    }

    /// Most recently created connections of any status, newest first.
    pub async fn list_recent(&self, limit: usize) -> Vec<Connection> {
        let connections = self.connections.read().await;
        let mut recent: Vec<Connection> = connections.values().cloned().collect();
        recent.sort_by(|a, b| b.id.cmp(&a.id));
        recent.truncate(limit);
        recent
    }

    /// Delete Reserved connections created before `cutoff`, freeing their
    /// subdomains. Also trims the closed history.
    pub async fn sweep_reserved(&self, cutoff: DateTime<Utc>) -> Vec<Connection> {
        let mut connections = self.connections.write().await;

        let stale: Vec<String> = connections
            .values()
            .filter(|c| c.status == ConnectionStatus::Reserved && c.created_at < cutoff)
            .map(|c| c.id.clone())
            .collect();

        let removed: Vec<Connection> = stale
            .iter()
            .filter_map(|id| connections.remove(id))
            .collect();

        let mut closed: Vec<(String, DateTime<Utc>)> = connections
            .values()
            .filter(|c| c.status == ConnectionStatus::Closed)
            .map(|c| (c.id.clone(), c.closed_at.unwrap_or(c.created_at)))
            .collect();
        if closed.len() > MAX_CLOSED_RETAINED {
            closed.sort_by(|a, b| b.1.cmp(&a.1));
            for (id, _) in closed.drain(MAX_CLOSED_RETAINED..) {
                connections.remove(&id);
            }
        }

        removed
    }
}
