//! Periodic maintenance: expire unclaimed reservations and ping active tunnels.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionKind};
use crate::pages::{ERROR_HEADER, PING_HEADER};
use crate::state::AppState;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Alive,
    Dead,
    /// Transport trouble on our side; the tunnel gets the benefit of the doubt
    Inconclusive,
}

#[derive(Clone)]
pub struct HealthMonitor {
    state: Arc<AppState>,
    http: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PING_TIMEOUT)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { state, http })
    }

    /// Delete reservations older than the grace window.
    pub async fn sweep(&self) -> usize {
        let grace = chrono::Duration::from_std(self.state.config.reservation_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let removed = self.state.registry.sweep_reserved(Utc::now() - grace).await;
        for connection in &removed {
            info!(
                "Expired unclaimed reservation {} (subdomain: {:?})",
                connection.id, connection.subdomain
            );
        }
        removed.len()
    }

    pub async fn ping(&self, connection: &Connection) -> PingOutcome {
        match connection.kind {
            ConnectionKind::Http => self.ping_http(connection).await,
            ConnectionKind::Tcp => self.ping_tcp(connection).await,
        }
    }

    async fn ping_http(&self, connection: &Connection) -> PingOutcome {
        let Some(subdomain) = connection.subdomain.as_deref() else {
            return PingOutcome::Dead;
        };
        let config = &self.state.config;

        let response = self
            .http
            .get(config.local_proxy_url())
            .header(reqwest::header::HOST, config.public_host(subdomain))
            .header(PING_HEADER, "true")
            .send()
            .await;

        match response {
            Ok(response) => {
                let flagged = response
                    .headers()
                    .get(ERROR_HEADER)
                    .and_then(|v| v.to_str().ok())
                    == Some("true");
                if response.status() == reqwest::StatusCode::NOT_FOUND && flagged {
                    PingOutcome::Dead
                } else {
                    PingOutcome::Alive
                }
            }
            Err(e) => {
                debug!("Ping for {} inconclusive: {}", connection.id, e);
                PingOutcome::Inconclusive
            }
        }
    }

    async fn ping_tcp(&self, connection: &Connection) -> PingOutcome {
        let Some(port) = connection.port else {
            return PingOutcome::Dead;
        };
        match tokio::time::timeout(PING_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_)) => PingOutcome::Alive,
            Ok(Err(e)) => {
                debug!("TCP ping to port {} failed: {}", port, e);
                PingOutcome::Dead
            }
            Err(_) => PingOutcome::Dead,
        }
    }

    /// Ping every active connection concurrently and close the dead ones.
    pub async fn ping_all(&self) -> usize {
        let mut pings = JoinSet::new();
        for connection in self.state.registry.list_active().await {
            let monitor = self.clone();
            pings.spawn(async move {
                let outcome = monitor.ping(&connection).await;
                (connection, outcome)
            });
        }

        let mut closed = 0;
        while let Some(joined) = pings.join_next().await {
            let Ok((connection, outcome)) = joined else {
                continue;
            };
            if outcome != PingOutcome::Dead {
                continue;
            }
            warn!("Connection {} failed its health check", connection.id);
            match self
                .state
                .terminate_connection(&connection.id, "Tunnel failed health check")
                .await
            {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to close connection {}: {}", connection.id, e),
            }
        }
        closed
    }

    /// Run the sweep and ping jobs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(self.state.config.sweep_interval);
        let mut ping = tokio::time::interval(self.state.config.ping_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Health monitor started (sweep every {:?}, ping every {:?})",
            self.state.config.sweep_interval, self.state.config.ping_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep().await;
                }
                _ = ping.tick() => {
                    let closed = self.ping_all().await;
                    if closed > 0 {
                        info!("Closed {} unhealthy connections", closed);
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::connection::{ConnectionStatus, TeamUser};
    use crate::proxy::serve_proxy;
    use crate::registry::StaticUsers;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn state_with_proxy() -> (Arc<AppState>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            proxy_port: listener.local_addr().unwrap().port(),
            reservation_grace: Duration::ZERO,
            ..ServerConfig::default()
        };
        let users = StaticUsers::new(vec![TeamUser {
            email: "amy@example.com".to_string(),
            team: "core".to_string(),
            secret_key: "sk-amy".to_string(),
        }]);
        let state = Arc::new(AppState::new(config, Arc::new(users)));
        let token = CancellationToken::new();
        tokio::spawn(serve_proxy(listener, state.clone(), token.clone()));
        (state, token)
    }

    #[tokio::test]
    async fn test_sweep_expires_reservations() {
        let (state, token) = state_with_proxy().await;
        let monitor = HealthMonitor::new(state.clone()).unwrap();

        let conn = state
            .registry
            .create_reserved(ConnectionKind::Http, Some("late"), "sk-amy")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(monitor.sweep().await, 1);
        assert!(state.registry.get_by_id(&conn.id).await.is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_http_ping_without_route_closes_connection() {
        let (state, token) = state_with_proxy().await;
        let monitor = HealthMonitor::new(state.clone()).unwrap();

        let conn = state
            .registry
            .create_reserved(ConnectionKind::Http, Some("gone"), "sk-amy")
            .await
            .unwrap();
        state.registry.mark_active(&conn.id, None, None).await.unwrap();

        let active = state.registry.get_by_id(&conn.id).await.unwrap();
        assert_eq!(monitor.ping(&active).await, PingOutcome::Dead);

        assert_eq!(monitor.ping_all().await, 1);
        assert_eq!(
            state.registry.get_by_id(&conn.id).await.unwrap().status,
            ConnectionStatus::Closed
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_http_ping_reaches_live_backend() {
        let (state, token) = state_with_proxy().await;
        let monitor = HealthMonitor::new(state.clone()).unwrap();

        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();
            assert!(request.contains("x-portr-ping-request: true"));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let conn = state
            .registry
            .create_reserved(ConnectionKind::Http, Some("live"), "sk-amy")
            .await
            .unwrap();
        state.router.add_backend("live", &backend_addr).await;
        state
            .registry
            .mark_active(&conn.id, None, Some(backend_addr.clone()))
            .await
            .unwrap();

        let active = state.registry.get_by_id(&conn.id).await.unwrap();
        assert_eq!(monitor.ping(&active).await, PingOutcome::Alive);
        token.cancel();
    }

    #[tokio::test]
    async fn test_tcp_ping() {
        let (state, token) = state_with_proxy().await;
        let monitor = HealthMonitor::new(state.clone()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let conn = state
            .registry
            .create_reserved(ConnectionKind::Tcp, None, "sk-amy")
            .await
            .unwrap();
        let active = state.registry.mark_active(&conn.id, Some(open_port), None).await.unwrap();
        assert_eq!(monitor.ping(&active).await, PingOutcome::Alive);

        drop(listener);
        assert_eq!(monitor.ping(&active).await, PingOutcome::Dead);
        token.cancel();
    }
}
