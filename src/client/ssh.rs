//! SSH side of the tunnel client: dial, authenticate, claim a remote port
//! and hand every forwarded channel to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::seq::index::sample;
use russh::client::{self, Handle, Msg, Session};
use russh::{Channel, Disconnect};
use russh_keys::PublicKey;
use tokio::sync::mpsc;

use super::config::ClientConfig;
use super::hostkey::KnownHosts;
use crate::connection::ConnectionKind;
use crate::error::ClientError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const PORT_CANDIDATES: usize = 10;
const FORWARD_ADDRESS: &str = "0.0.0.0";

/// Random remote ports to try, all distinct.
pub fn candidate_ports(kind: ConnectionKind) -> Vec<u16> {
    let (low, high) = match kind {
        ConnectionKind::Http => (20000u16, 30000u16),
        ConnectionKind::Tcp => (30001u16, 40001u16),
    };
    let span = usize::from(high - low) + 1;
    sample(&mut rand::thread_rng(), span, PORT_CANDIDATES)
        .into_iter()
        .map(|offset| low + offset as u16)
        .collect()
}

/// russh client callbacks.
pub struct ClientHandler {
    host: String,
    known_hosts: Option<KnownHosts>,
    channels: mpsc::UnboundedSender<Channel<Msg>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = ClientError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.known_hosts {
            Some(known_hosts) => {
                known_hosts.verify(&self.host, server_public_key)?;
                Ok(true)
            }
            None => {
                debug!("Skipping host key verification for {}", self.host);
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded connection {}:{} -> {}:{}",
            originator_address, originator_port, connected_address, connected_port
        );
        if self.channels.send(channel).is_err() {
            debug!("Dropping forwarded channel, nobody is accepting");
        }
        Ok(())
    }
}

/// Channels the server opens for each inbound public connection.
pub type ForwardedChannels = mpsc::UnboundedReceiver<Channel<Msg>>;

/// An authenticated SSH session bound to one connection id.
pub struct SshSession {
    handle: Handle<ClientHandler>,
}

impl SshSession {
    /// Dial `config.ssh_url` and log in as `{connection_id}:{secret_key}` with an empty password.
    pub async fn connect(
        config: &ClientConfig,
        connection_id: &str,
        secret_key: &str,
    ) -> Result<(Self, ForwardedChannels), ClientError> {
        let ssh_config = client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = ClientHandler {
            host: config.ssh_url.clone(),
            known_hosts: (!config.insecure_skip_host_key)
                .then(|| KnownHosts::new(config.known_hosts_path())),
            channels: tx,
        };

        debug!("Connecting to SSH server at {}", config.ssh_url);
        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(Arc::new(ssh_config), config.ssh_url.as_str(), handler),
        )
        .await
        .map_err(|_| ClientError::Timeout("SSH connect"))??;

        let user = format!("{}:{}", connection_id, secret_key);
        if !handle.authenticate_password(user, "").await? {
            return Err(ClientError::AuthRejected);
        }
        debug!("SSH session established for connection {}", connection_id);

        Ok((Self { handle }, rx))
    }

    /// Ask the server to listen on the first candidate port it accepts.
    pub async fn listen(&mut self, candidates: &[u16]) -> Result<u16, ClientError> {
        for &port in candidates {
            match self.handle.tcpip_forward(FORWARD_ADDRESS, u32::from(port)).await {
                Ok(_) => {
                    info!("Remote port {} accepted", port);
                    return Ok(port);
                }
                Err(e) => debug!("Remote port {} refused: {}", port, e),
            }
            if self.handle.is_closed() {
                return Err(ClientError::Ssh(russh::Error::Disconnect));
            }
        }
        Err(ClientError::PortExhausted(candidates.len()))
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "client closing", "en")
            .await
        {
            debug!("Disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_candidate_ports_are_distinct_and_in_range() {
        for _ in 0..20 {
            let http = candidate_ports(ConnectionKind::Http);
            assert_eq!(http.len(), 10);
            assert_eq!(http.iter().collect::<HashSet<_>>().len(), 10);
            assert!(http.iter().all(|p| (20000..=30000).contains(p)));

            let tcp = candidate_ports(ConnectionKind::Tcp);
            assert!(tcp.iter().all(|p| (30001..=40001).contains(p)));
        }
    }
}
