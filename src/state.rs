//! Shared server state: configuration, registry, routes and live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use russh::server::Handle;
use russh::Disconnect;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::TunnelError;
use crate::proxy::ProxyRouter;
use crate::registry::{ConnectionRegistry, SecretKeyLookup};

/// Ties an active connection to the SSH session serving it.
#[derive(Clone)]
pub struct SessionLink {
    pub handle: Handle,
    /// Cancelled to stop the forwarded listener
    pub forward: CancellationToken,
}

pub struct AppState {
    pub config: ServerConfig,
    pub registry: ConnectionRegistry,
    pub router: ProxyRouter,
    sessions: RwLock<HashMap<String, SessionLink>>,
}

impl AppState {
    pub fn new(config: ServerConfig, users: Arc<dyn SecretKeyLookup>) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(users),
            router: ProxyRouter::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn attach_session(&self, connection_id: &str, link: SessionLink) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(connection_id.to_string(), link);
    }

    /// Close an active connection: mark it Closed, drop its route and stop
    /// its forwarded listener. Returns `true` only for the caller that
    /// performed the transition.
    pub async fn close_connection(&self, connection_id: &str) -> Result<bool, TunnelError> {
        if !self.registry.mark_closed(connection_id).await? {
            return Ok(false);
        }

        let connection = self.registry.get_by_id(connection_id).await?;
        if let (Some(subdomain), Some(backend)) = (&connection.subdomain, &connection.backend) {
            if let Err(e) = self.router.remove_backend(subdomain, backend).await {
                debug!("Route for {} already gone: {}", subdomain, e);
            }
        }

        let link = self.sessions.write().await.remove(connection_id);
        if let Some(link) = link {
            link.forward.cancel();
        }

        info!("Cleaned up connection {}", connection_id);
        Ok(true)
    }

    /// Close a connection and disconnect the SSH session that carried it.
    pub async fn terminate_connection(&self, connection_id: &str, reason: &str) -> Result<bool, TunnelError> {
        let handle = self
            .sessions
            .read()
            .await
            .get(connection_id)
            .map(|link| link.handle.clone());

        let closed = self.close_connection(connection_id).await?;

        if let Some(handle) = handle {
            let reason = reason.to_string();
            tokio::spawn(async move {
                if let Err(e) = handle
                    .disconnect(Disconnect::ByApplication, reason, "en".to_string())
                    .await
                {
                    debug!("Disconnect result: {:?}", e);
                }
            });
        } else if closed {
            warn!("Connection {} had no live session to disconnect", connection_id);
        }

        Ok(closed)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionKind, ConnectionStatus, TeamUser};
    use crate::registry::StaticUsers;

    fn state() -> AppState {
        let users = StaticUsers::new(vec![TeamUser {
            email: "amy@example.com".to_string(),
            team: "core".to_string(),
            secret_key: "sk-amy".to_string(),
        }]);
        AppState::new(ServerConfig::default(), Arc::new(users))
    }

    #[tokio::test]
    async fn test_close_connection_removes_route_once() {
        let state = state();
        let conn = state
            .registry
            .create_reserved(ConnectionKind::Http, Some("shop"), "sk-amy")
            .await
            .unwrap();
        state.router.add_backend("shop", "127.0.0.1:20001").await;
        state
            .registry
            .mark_active(&conn.id, None, Some("127.0.0.1:20001".to_string()))
            .await
            .unwrap();

        assert!(state.close_connection(&conn.id).await.unwrap());
        assert_eq!(state.router.backend_count("shop").await, 0);
        assert_eq!(
            state.registry.get_by_id(&conn.id).await.unwrap().status,
            ConnectionStatus::Closed
        );

        // A second closer loses the race and changes nothing
        assert!(!state.close_connection(&conn.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_keeps_other_backends() {
        let state = state();
        let conn = state
            .registry
            .create_reserved(ConnectionKind::Http, Some("shop"), "sk-amy")
            .await
            .unwrap();
        state.router.add_backend("shop", "127.0.0.1:20001").await;
        state.router.add_backend("shop", "127.0.0.1:20002").await;
        state
            .registry
            .mark_active(&conn.id, None, Some("127.0.0.1:20001".to_string()))
            .await
            .unwrap();

        assert!(state.terminate_connection(&conn.id, "test").await.unwrap());
        assert_eq!(state.router.backend_count("shop").await, 1);
        assert_eq!(
            state.router.get_next_backend("shop").await.unwrap(),
            "127.0.0.1:20002"
        );
    }

    #[tokio::test]
    async fn test_close_unknown_connection() {
        let state = state();
        assert!(matches!(
            state.close_connection("missing").await,
            Err(TunnelError::ConnectionNotFound(_))
        ));
    }
}
