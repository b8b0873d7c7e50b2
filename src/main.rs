//! portr server
//!
//! Runs the SSH endpoint, the public HTTP proxy, the admin API and the
//! health monitor until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use portr::{
    load_or_generate_server_key, run_admin_api, run_http_proxy, AppState, HealthMonitor, ServerConfig,
    StaticUsers, TunnelServer,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

type Component = (&'static str, anyhow::Result<()>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Starting portr server...");

    let config = ServerConfig::from_env()?;
    let users = StaticUsers::from_file(&config.users_file)?;
    info!("✓ Loaded {} users from {}", users.len(), config.users_file.display());

    let key = load_or_generate_server_key(&config.server_key_path)?;
    let ssh_addr = config.ssh_addr();
    let proxy_addr = config.proxy_addr();
    let admin_addr = config.admin_addr();
    info!("✓ Public tunnel domain: {}", config.domain);

    let state = Arc::new(AppState::new(config, Arc::new(users)));
    let monitor = HealthMonitor::new(state.clone())?;
    let shutdown = CancellationToken::new();

    let mut components: JoinSet<Component> = JoinSet::new();
    {
        let server = TunnelServer::new(state.clone(), shutdown.clone());
        components.spawn(async move { ("ssh", server.run(key, &ssh_addr).await) });
    }
    {
        let (state, shutdown) = (state.clone(), shutdown.clone());
        components.spawn(async move { ("proxy", run_http_proxy(state, &proxy_addr, shutdown).await) });
    }
    {
        let (state, shutdown) = (state.clone(), shutdown.clone());
        components.spawn(async move { ("admin", run_admin_api(state, &admin_addr, shutdown).await) });
    }
    {
        let shutdown = shutdown.clone();
        components.spawn(async move {
            monitor.run(shutdown).await;
            ("monitor", Ok(()))
        });
    }

    let mut failure = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
        }
        Some(joined) = components.join_next() => {
            let (name, result) = joined?;
            match result {
                Ok(()) => warn!("{} stopped unexpectedly", name),
                Err(e) => {
                    error!("{} failed: {:#}", name, e);
                    failure = Some(e);
                }
            }
        }
    }

    shutdown.cancel();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(joined) = components.join_next().await {
            match joined {
                Ok((name, Err(e))) => warn!("{} ended with error: {:#}", name, e),
                Ok((name, Ok(()))) => info!("✓ {} stopped", name),
                Err(e) => warn!("Component task failed: {}", e),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Shutdown drain timed out after {:?}", DRAIN_TIMEOUT);
    }

    match failure {
        Some(e) => Err(e),
        None => {
            info!("Server stopped");
            Ok(())
        }
    }
}
