//! SSH handler for individual tunnel sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use tokio_util::sync::CancellationToken;

use super::auth::Authenticator;
use super::forward::{backend_addr, bind_forward, spawn_accept_loop, spawn_lifecycle_watcher};
use crate::connection::{ConnectionKind, ConnectionStatus};
use crate::error::TunnelError;
use crate::state::{AppState, SessionLink};

/// Handler for a single SSH connection.
///
/// One session serves one connection: the identity presented at login names
/// the connection, and every forward it requests activates that connection.
pub struct SshHandler {
    state: Arc<AppState>,
    authenticator: Arc<dyn Authenticator>,
    peer_addr: Option<SocketAddr>,
    connection_id: Option<String>,
    session_handle: Option<Handle>,
    /// Cancelled when the session ends; parent of every forward token
    session_token: CancellationToken,
    forwards: HashMap<(String, u32), CancellationToken>,
}

impl SshHandler {
    pub fn new(
        state: Arc<AppState>,
        authenticator: Arc<dyn Authenticator>,
        peer_addr: Option<SocketAddr>,
        session_token: CancellationToken,
    ) -> Self {
        Self {
            state,
            authenticator,
            peer_addr,
            connection_id: None,
            session_handle: None,
            session_token,
            forwards: HashMap::new(),
        }
    }

    /// Bind the forwarded port, register it and mark the connection active.
    /// `Ok(false)` rejects the request so the client can try another port.
    async fn activate_forward(&mut self, address: &str, port: &mut u32) -> Result<bool, TunnelError> {
        let (Some(connection_id), Some(handle)) = (self.connection_id.clone(), self.session_handle.clone()) else {
            warn!("Forward request before authentication from {:?}", self.peer_addr);
            return Ok(false);
        };

        let connection = self.state.registry.get_by_id(&connection_id).await?;
        if connection.status != ConnectionStatus::Reserved {
            warn!(
                "Rejecting forward for connection {}: status is {}",
                connection_id, connection.status
            );
            return Ok(false);
        }

        let Ok(requested_port) = u16::try_from(*port) else {
            warn!("Rejecting forward to out-of-range port {}", port);
            return Ok(false);
        };

        let listener = match bind_forward(address, requested_port).await {
            Ok(listener) => listener,
            Err(e) => {
                info!("Port {}:{} unavailable: {}", address, requested_port, e);
                return Ok(false);
            }
        };
        let bound_port = listener.local_addr()?.port();
        *port = bound_port as u32;

        let activation = match connection.kind {
            ConnectionKind::Tcp => self.state.registry.mark_active(&connection_id, Some(bound_port), None).await,
            ConnectionKind::Http => {
                let subdomain = connection.subdomain.clone().ok_or(TunnelError::SubdomainRequired)?;
                let backend = backend_addr(address, bound_port);
                self.state.router.add_backend(&subdomain, &backend).await;
                let result = self
                    .state
                    .registry
                    .mark_active(&connection_id, None, Some(backend.clone()))
                    .await;
                if result.is_err() {
                    let _ = self.state.router.remove_backend(&subdomain, &backend).await;
                }
                result
            }
        };

        if let Err(e) = activation {
            warn!("Activation of {} failed: {}", connection_id, e);
            return Ok(false);
        }

        let token = self.session_token.child_token();
        self.state
            .attach_session(
                &connection_id,
                SessionLink {
                    handle: handle.clone(),
                    forward: token.clone(),
                },
            )
            .await;
        self.forwards.insert((address.to_string(), *port), token.clone());

        spawn_accept_loop(
            listener,
            handle,
            address.to_string(),
            *port,
            connection.subdomain.clone(),
            token.clone(),
        );
        spawn_lifecycle_watcher(self.state.clone(), connection_id.clone(), token);

        match connection.kind {
            ConnectionKind::Http => info!(
                "Tunnel {} live at {}",
                connection_id,
                self.state
                    .config
                    .http_tunnel_url(connection.subdomain.as_deref().unwrap_or_default())
            ),
            ConnectionKind::Tcp => info!(
                "Tunnel {} live at {}",
                connection_id,
                self.state.config.tcp_tunnel_addr(bound_port)
            ),
        }
        Ok(true)
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        debug!("Session from {:?} ended", self.peer_addr);
        self.session_token.cancel();
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = TunnelError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.authenticator.authenticate(user, password).await {
            Ok(connection) => {
                info!(
                    "Authenticated {} for connection {} from {:?}",
                    connection.created_by.email, connection.id, self.peer_addr
                );
                self.connection_id = Some(connection.id);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!("Authentication failed from {:?}: {}", self.peer_addr, e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        self.session_handle = Some(session.handle());
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: id={:?}", channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        debug!("Ignoring {} bytes on channel {:?}", data.len(), channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("tcpip-forward request: {}:{} from {:?}", address, port, self.peer_addr);
        self.activate_forward(address, port).await
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("Cancel tcpip-forward: address='{}', port={}", address, port);
        match self.forwards.remove(&(address.to_string(), port)) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
