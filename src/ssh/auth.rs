//! Session authentication against the connection registry.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{Connection, ConnectionStatus};
use crate::error::TunnelError;
use crate::state::AppState;

/// Decides whether an SSH login may claim a connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, user: &str, password: &str) -> Result<Connection, TunnelError>;
}

/// Split an SSH username of the form `{connectionId}:{secretKey}`.
pub fn parse_ssh_user(user: &str) -> Result<(&str, &str), TunnelError> {
    match user.split_once(':') {
        Some((id, secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
        _ => Err(TunnelError::AuthFailed("invalid user format".to_string())),
    }
}

/// Accepts logins for Reserved connections whose owner holds the presented secret key.
/// The password is ignored.
pub struct SecretKeyAuthenticator {
    state: Arc<AppState>,
}

impl SecretKeyAuthenticator {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Authenticator for SecretKeyAuthenticator {
    async fn authenticate(&self, user: &str, _password: &str) -> Result<Connection, TunnelError> {
        let (connection_id, secret_key) = parse_ssh_user(user)?;

        let connection = self
            .state
            .registry
            .get_by_id(connection_id)
            .await
            .map_err(|_| TunnelError::AuthFailed("unknown connection".to_string()))?;

        if connection.status != ConnectionStatus::Reserved {
            return Err(TunnelError::AuthFailed(format!(
                "connection is {}, not reserved",
                connection.status
            )));
        }

        if connection.created_by.secret_key != secret_key {
            return Err(TunnelError::AuthFailed("secret key mismatch".to_string()));
        }

        Ok(connection)
    }
}
