//! Tunnel client: exposes local services through a portr server.

mod api;
mod bridge;
mod config;
mod health;
mod hostkey;
mod ssh;
mod tunnel;

pub use api::{normalize_remote, ApiClient};
pub use bridge::{bridge_tcp, HttpBridge};
pub use config::{edit_config, write_config, ClientConfig, TunnelSpec};
pub use health::{HealthChecker, RetryTracker};
pub use hostkey::KnownHosts;
pub use ssh::{candidate_ports, SshSession};
pub use tunnel::{run_tunnels, ActiveTunnel, TunnelClient};
