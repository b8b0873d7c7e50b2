//! SSH server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use russh::server::{Config, Handler, Server};
use russh::{MethodSet, SshId};
use russh_keys::PrivateKey;
use tokio_util::sync::CancellationToken;

use super::auth::{Authenticator, SecretKeyAuthenticator};
use super::SshHandler;
use crate::error::TunnelError;
use crate::state::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MAX: usize = 3;

/// The main SSH server that creates handlers for each connection.
#[derive(Clone)]
pub struct TunnelServer {
    state: Arc<AppState>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: CancellationToken,
}

impl TunnelServer {
    pub fn new(state: Arc<AppState>, shutdown: CancellationToken) -> Self {
        let authenticator = Arc::new(SecretKeyAuthenticator::new(state.clone()));
        Self::with_authenticator(state, authenticator, shutdown)
    }

    pub fn with_authenticator(
        state: Arc<AppState>,
        authenticator: Arc<dyn Authenticator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            authenticator,
            shutdown,
        }
    }

    /// Serve SSH on `addr` until the shutdown token fires.
    pub async fn run(mut self, key: PrivateKey, addr: &str) -> anyhow::Result<()> {
        let config = Arc::new(ssh_config(key));
        let shutdown = self.shutdown.clone();

        info!("SSH server listening on {}", addr);
        tokio::select! {
            result = self.run_on_address(config, addr) => result?,
            _ = shutdown.cancelled() => info!("SSH server shutting down"),
        }
        Ok(())
    }
}

pub fn ssh_config(key: PrivateKey) -> Config {
    Config {
        // Password authentication only; the username carries the credentials
        methods: MethodSet::PASSWORD,
        server_id: SshId::Standard(format!("SSH-2.0-portr-{}", env!("CARGO_PKG_VERSION"))),
        keys: vec![key],
        inactivity_timeout: Some(Duration::from_secs(3600)),
        // Half-open sessions end after KEEPALIVE_MAX unanswered keepalives
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}

impl Server for TunnelServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!("New SSH connection from {:?}", peer_addr);
        SshHandler::new(
            self.state.clone(),
            self.authenticator.clone(),
            peer_addr,
            self.shutdown.child_token(),
        )
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        match error {
            TunnelError::SshError(e) => error!("SSH session error: {:?}", e),
            other => error!("Session error: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::Algorithm;

    #[test]
    fn test_ssh_config_detects_dead_peers() {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let config = ssh_config(key);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(15)));
        assert_eq!(config.keepalive_max, 3);
        assert_eq!(config.methods, MethodSet::PASSWORD);
    }
}
