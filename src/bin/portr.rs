//! portr client CLI
//!
//! ```bash
//! portr auth set --token <secret-key> --remote portr.example.com
//! portr http 3000 --subdomain shop
//! portr start
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use portr::client::{edit_config, normalize_remote, run_tunnels, write_config, ApiClient, ClientConfig, TunnelSpec};
use portr::ClientError;

/// Expose local servers through a portr server
#[derive(Parser, Debug)]
#[command(name = "portr")]
#[command(about = "Expose local servers through self-hosted SSH tunnels", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding config.env, known_hosts and the request log
    #[arg(long, env = "PORTR_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start tunnels from the config file (all of them when no names are given)
    Start {
        names: Vec<String>,
    },
    /// Expose a local HTTP server
    Http {
        port: u16,
        #[arg(short, long)]
        subdomain: Option<String>,
        /// Host the local server listens on
        #[arg(long, default_value = "localhost")]
        host: String,
    },
    /// Expose a local TCP service
    Tcp {
        port: u16,
        #[arg(long, default_value = "localhost")]
        host: String,
    },
    /// Manage credentials
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Download a config for this secret key from the server
    Set {
        #[arg(short, long)]
        token: String,
        #[arg(short, long)]
        remote: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Open the config file in an editor
    Edit,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ClientError> {
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => ClientConfig::default_dir()?,
    };

    match cli.command {
        Command::Auth {
            command: AuthCommand::Set { token, remote },
        } => {
            let api = ApiClient::new(normalize_remote(&remote))?;
            let contents = api.download_config(&token).await?;
            let config = ClientConfig::from_lookup(|_| None, config_dir)?;
            write_config(&config.config_path(), &contents)
        }
        Command::Config {
            command: ConfigCommand::Edit,
        } => {
            let config = ClientConfig::from_lookup(|_| None, config_dir)?;
            edit_config(&config.config_path())
        }
        Command::Start { names } => {
            let config = ClientConfig::load(&config_dir)?;
            let specs = config.select_tunnels(&names)?;
            serve(config, specs).await
        }
        Command::Http { port, subdomain, host } => {
            let config = ClientConfig::load(&config_dir)?;
            let spec = TunnelSpec {
                host,
                ..TunnelSpec::http(port, subdomain)?
            };
            serve(config, vec![spec]).await
        }
        Command::Tcp { port, host } => {
            let config = ClientConfig::load(&config_dir)?;
            let spec = TunnelSpec {
                host,
                ..TunnelSpec::tcp(port)
            };
            serve(config, vec![spec]).await
        }
    }
}

/// Run tunnels until Ctrl-C or a fatal error.
async fn serve(config: ClientConfig, specs: Vec<TunnelSpec>) -> Result<(), ClientError> {
    config.require_secret_key()?;
    info!("🚀 Starting {} tunnel(s) via {}", specs.len(), config.server_addr());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down tunnels...");
                signal_token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    run_tunnels(Arc::new(config), specs, shutdown).await
}
