//! Self-hosted SSH reverse tunnels.
//!
//! The server side accepts tunnel reservations over a small admin API,
//! binds forwarded ports for authenticated SSH sessions and routes public
//! HTTP traffic to them by subdomain. The client side reserves a
//! connection, opens the SSH session and bridges forwarded channels to a
//! local service.

pub mod admin;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod key;
pub mod monitor;
pub mod pages;
pub mod proxy;
pub mod registry;
pub mod request_log;
pub mod ssh;
pub mod state;

pub use admin::run_admin_api;
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionKind, ConnectionStatus, TeamUser};
pub use error::{ClientError, TunnelError};
pub use key::load_or_generate_server_key;
pub use monitor::HealthMonitor;
pub use proxy::{run_http_proxy, ProxyRouter};
pub use registry::{ConnectionRegistry, SecretKeyLookup, StaticUsers};
pub use ssh::{SshHandler, TunnelServer};
pub use state::AppState;
