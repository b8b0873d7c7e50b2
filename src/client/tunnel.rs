//! Tunnel lifecycle on the client: reserve, connect, listen, serve, and
//! keep the tunnel healthy until shutdown.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::api::ApiClient;
use super::bridge::{bridge_tcp, HttpBridge};
use super::config::{ClientConfig, TunnelSpec};
use super::health::{HealthChecker, RetryTracker};
use super::ssh::{candidate_ports, ForwardedChannels, SshSession};
use crate::connection::ConnectionKind;
use crate::error::ClientError;
use crate::request_log::{JsonLinesSink, RequestLogSink};

/// The first connection attempt must finish within this window.
const STARTUP_WINDOW: Duration = Duration::from_secs(15);

/// Right after a close the server may still hold the old reservation of the
/// subdomain, so a reconnect retries conflicts for a short while.
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(250);
const CONFLICT_RETRIES: u32 = 20;

/// A tunnel that is currently serving traffic.
pub struct ActiveTunnel {
    pub connection_id: String,
    pub remote_port: u16,
    /// `https://sub.domain` for http, `host:port` for tcp
    pub public_url: String,
    session: SshSession,
    accept_task: JoinHandle<()>,
}

impl ActiveTunnel {
    fn is_alive(&self) -> bool {
        !self.session.is_closed() && !self.accept_task.is_finished()
    }

    async fn close(&self) {
        self.session.close().await;
        self.accept_task.abort();
    }
}

pub struct TunnelClient {
    config: Arc<ClientConfig>,
    spec: TunnelSpec,
    api: ApiClient,
    checker: HealthChecker,
    sink: Option<Arc<dyn RequestLogSink>>,
}

impl TunnelClient {
    pub fn new(
        config: Arc<ClientConfig>,
        spec: TunnelSpec,
        sink: Option<Arc<dyn RequestLogSink>>,
    ) -> Result<Self, ClientError> {
        let checker = match (config.use_localhost, spec.kind, spec.subdomain.as_deref()) {
            (true, ConnectionKind::Http, Some(subdomain)) => {
                HealthChecker::with_loopback(&config.http_tunnel_host(subdomain))?
            }
            _ => HealthChecker::new()?,
        };
        Ok(Self {
            api: ApiClient::new(config.server_addr())?,
            checker,
            config,
            spec,
            sink,
        })
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Reserve a connection, open the SSH session, claim a remote port and
    /// start serving forwarded channels.
    pub async fn start(&self) -> Result<ActiveTunnel, ClientError> {
        let secret_key = self.config.require_secret_key()?;

        let connection_id = self
            .api
            .create_connection(self.spec.kind, self.spec.subdomain.as_deref(), secret_key)
            .await?;

        let (mut session, channels) = SshSession::connect(&self.config, &connection_id, secret_key).await?;
        let remote_port = match session.listen(&candidate_ports(self.spec.kind)).await {
            Ok(port) => port,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let public_url = match (self.spec.kind, self.spec.subdomain.as_deref()) {
            (ConnectionKind::Http, Some(subdomain)) => self.config.http_tunnel_url(subdomain),
            _ => self.config.tcp_tunnel_addr(remote_port),
        };

        let accept_task = tokio::spawn(accept_loop(channels, self.spec.clone(), self.sink.clone()));

        Ok(ActiveTunnel {
            connection_id,
            remote_port,
            public_url,
            session,
            accept_task,
        })
    }

    /// `start` again after a close, waiting out the server's release of the
    /// previous reservation.
    async fn reconnect(&self) -> Result<ActiveTunnel, ClientError> {
        let mut conflicts = 0;
        loop {
            match self.start().await {
                Err(ClientError::Api { status: 409, message }) if conflicts < CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!("Tunnel '{}' reservation still held ({}), retrying", self.spec.name, message);
                    tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }

    async fn is_healthy(&self, active: &ActiveTunnel) -> bool {
        if !active.is_alive() {
            return false;
        }
        match self.spec.kind {
            ConnectionKind::Http => self.checker.check(&active.public_url).await,
            ConnectionKind::Tcp => true,
        }
    }

    fn announce(&self, active: &ActiveTunnel) {
        info!(
            "Tunnel '{}' ready: {} -> {}",
            self.spec.name,
            active.public_url,
            self.spec.local_addr()
        );
    }

    /// Start the tunnel and keep it up until `shutdown` fires. Returns an
    /// error only for failures that must end the process.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut active = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            started = tokio::time::timeout(STARTUP_WINDOW, self.start()) => match started {
                Ok(result) => result?,
                Err(_) => return Err(ClientError::Timeout("tunnel startup")),
            },
        };
        self.announce(&active);

        let mut retries = RetryTracker::new(self.config.max_retries);
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    active.close().await;
                    info!("Tunnel '{}' closed", self.spec.name);
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if self.is_healthy(&active).await {
                retries.record_success();
                continue;
            }

            let failures = match retries.record_failure() {
                Ok(failures) => failures,
                Err(e) => {
                    active.close().await;
                    return Err(e);
                }
            };
            warn!(
                "Tunnel '{}' failed its health check ({}/{}), reconnecting",
                self.spec.name, failures, self.config.max_retries
            );

            active.close().await;
            match self.reconnect().await {
                Ok(next) => {
                    active = next;
                    self.announce(&active);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Reconnect of '{}' failed: {}", self.spec.name, e),
            }
        }
    }
}

async fn accept_loop(
    mut channels: ForwardedChannels,
    spec: TunnelSpec,
    sink: Option<Arc<dyn RequestLogSink>>,
) {
    let http = match spec.kind {
        ConnectionKind::Http => Some(Arc::new(HttpBridge::new(spec.clone(), sink))),
        ConnectionKind::Tcp => None,
    };

    while let Some(channel) = channels.recv().await {
        let stream = channel.into_stream();
        match &http {
            Some(bridge) => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    if let Err(e) = bridge.serve(stream).await {
                        warn!("HTTP bridge error: {}", e);
                    }
                });
            }
            None => {
                let local_addr = spec.local_addr();
                tokio::spawn(async move { bridge_tcp(stream, &local_addr).await });
            }
        }
    }
}

/// Run every tunnel in `specs` until `shutdown` fires or one of them fails
/// fatally, which stops the others.
pub async fn run_tunnels(
    config: Arc<ClientConfig>,
    specs: Vec<TunnelSpec>,
    shutdown: CancellationToken,
) -> Result<(), ClientError> {
    let sink: Option<Arc<dyn RequestLogSink>> = config
        .enable_request_logging
        .then(|| Arc::new(JsonLinesSink::new(config.request_log_path())) as Arc<dyn RequestLogSink>);

    let group = shutdown.child_token();
    let mut tunnels = JoinSet::new();
    for spec in specs {
        let client = TunnelClient::new(config.clone(), spec, sink.clone())?;
        tunnels.spawn(client.run(group.child_token()));
    }

    let mut first_error = None;
    while let Some(joined) = tunnels.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Tunnel task panicked: {}", e);
                Err(ClientError::Io(std::io::Error::other(e.to_string())))
            }
        };
        if let Err(e) = result {
            if first_error.is_none() {
                first_error = Some(e);
                group.cancel();
            } else {
                error!("{}", e);
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}
