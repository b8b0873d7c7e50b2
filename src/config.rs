//! Server configuration.
//!
//! Everything is read from environment variables (optionally seeded from a
//! `.env` file by the binary). Every variable has a default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

// ============================================================================
// Environment variable names
// ============================================================================

mod env {
    pub const SSH_PORT: &str = "SSH_PORT";
    pub const PROXY_PORT: &str = "PROXY_PORT";
    pub const ADMIN_PORT: &str = "ADMIN_PORT";
    pub const DOMAIN: &str = "DOMAIN";
    pub const SERVER_URL: &str = "SERVER_URL";
    pub const USE_LOCALHOST: &str = "USE_LOCALHOST";
    pub const SERVER_KEY_PATH: &str = "SERVER_KEY_PATH";
    pub const USERS_FILE: &str = "USERS_FILE";
    pub const RESERVATION_GRACE_SECS: &str = "RESERVATION_GRACE_SECS";
    pub const SWEEP_INTERVAL_SECS: &str = "SWEEP_INTERVAL_SECS";
    pub const PING_INTERVAL_SECS: &str = "PING_INTERVAL_SECS";
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ssh_port: u16,
    pub proxy_port: u16,
    pub admin_port: u16,
    /// Public base domain for tunnels, may carry a port (e.g. "localhost:8001")
    pub domain: String,
    /// Public address of the admin API, without scheme (e.g. "localhost:8000")
    pub server_url: String,
    /// Serve plain http URLs instead of https
    pub use_localhost: bool,
    pub server_key_path: PathBuf,
    pub users_file: PathBuf,
    pub reservation_grace: Duration,
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ssh_port: 2222,
            proxy_port: 8001,
            admin_port: 8000,
            domain: "localhost:8001".to_string(),
            server_url: "localhost:8000".to_string(),
            use_localhost: false,
            server_key_path: PathBuf::from("data/server_key.pem"),
            users_file: PathBuf::from("users.json"),
            reservation_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            ssh_port: parse_or(&lookup, env::SSH_PORT, defaults.ssh_port)?,
            proxy_port: parse_or(&lookup, env::PROXY_PORT, defaults.proxy_port)?,
            admin_port: parse_or(&lookup, env::ADMIN_PORT, defaults.admin_port)?,
            domain: lookup(env::DOMAIN)
                .filter(|d| !d.trim().is_empty())
                .unwrap_or(defaults.domain),
            server_url: lookup(env::SERVER_URL)
                .filter(|d| !d.trim().is_empty())
                .unwrap_or(defaults.server_url),
            use_localhost: lookup(env::USE_LOCALHOST)
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.use_localhost),
            server_key_path: lookup(env::SERVER_KEY_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.server_key_path),
            users_file: lookup(env::USERS_FILE)
                .map(PathBuf::from)
                .unwrap_or(defaults.users_file),
            reservation_grace: secs_or(&lookup, env::RESERVATION_GRACE_SECS, defaults.reservation_grace)?,
            sweep_interval: secs_or(&lookup, env::SWEEP_INTERVAL_SECS, defaults.sweep_interval)?,
            ping_interval: secs_or(&lookup, env::PING_INTERVAL_SECS, defaults.ping_interval)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval.is_zero() || self.ping_interval.is_zero() {
            bail!(
                "{} and {} must be greater than zero",
                env::SWEEP_INTERVAL_SECS,
                env::PING_INTERVAL_SECS
            );
        }
        if self.ssh_port == self.proxy_port
            || self.ssh_port == self.admin_port
            || self.proxy_port == self.admin_port
        {
            bail!("SSH, proxy and admin ports must all differ");
        }
        Ok(())
    }

    /// The domain without any port (e.g. "localhost:8000" -> "localhost").
    pub fn base_domain(&self) -> &str {
        self.domain.split(':').next().unwrap_or(&self.domain)
    }

    fn scheme(&self) -> &'static str {
        if self.use_localhost {
            "http"
        } else {
            "https"
        }
    }

    /// Host header value a public request for `subdomain` carries.
    pub fn public_host(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.domain)
    }

    pub fn http_tunnel_url(&self, subdomain: &str) -> String {
        format!("{}://{}", self.scheme(), self.public_host(subdomain))
    }

    pub fn tcp_tunnel_addr(&self, port: u16) -> String {
        format!("{}:{}", self.base_domain(), port)
    }

    /// URL of the admin API clients talk to.
    pub fn admin_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.server_url)
    }

    /// SSH endpoint advertised to clients: the admin host on the SSH port.
    pub fn ssh_url(&self) -> String {
        let host = self.server_url.split(':').next().unwrap_or(&self.server_url);
        format!("{}:{}", host, self.ssh_port)
    }

    pub fn ssh_addr(&self) -> String {
        format!("0.0.0.0:{}", self.ssh_port)
    }

    pub fn proxy_addr(&self) -> String {
        format!("0.0.0.0:{}", self.proxy_port)
    }

    pub fn admin_addr(&self) -> String {
        format!("0.0.0.0:{}", self.admin_port)
    }

    /// Local address the health monitor sends pings through.
    pub fn local_proxy_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.proxy_port)
    }
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, value)),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, name: &str, default: Duration) -> anyhow::Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, name, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.proxy_port, 8001);
        assert_eq!(config.admin_port, 8000);
        assert_eq!(config.domain, "localhost:8001");
        assert_eq!(config.admin_url(), "https://localhost:8000");
        assert_eq!(config.reservation_grace, Duration::from_secs(30));
        assert!(!config.use_localhost);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("SSH_PORT", "2200"),
            ("DOMAIN", "tunnel.example.com"),
            ("SERVER_URL", "portr.example.com"),
            ("USE_LOCALHOST", "true"),
            ("PING_INTERVAL_SECS", "3"),
        ])
        .unwrap();
        assert_eq!(config.ssh_port, 2200);
        assert_eq!(config.ping_interval, Duration::from_secs(3));
        assert_eq!(config.http_tunnel_url("app"), "http://app.tunnel.example.com");
        assert_eq!(config.ssh_url(), "portr.example.com:2200");
        assert_eq!(config.admin_url(), "http://portr.example.com");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(from_pairs(&[("SSH_PORT", "not-a-port")]).is_err());
        assert!(from_pairs(&[("SWEEP_INTERVAL_SECS", "0")]).is_err());
        assert!(from_pairs(&[("PROXY_PORT", "2222")]).is_err());
    }

    #[test]
    fn test_domain_helpers_strip_port() {
        let config = ServerConfig::default();
        assert_eq!(config.base_domain(), "localhost");
        assert_eq!(config.public_host("app"), "app.localhost:8001");
        assert_eq!(config.http_tunnel_url("app"), "https://app.localhost:8001");
        assert_eq!(config.tcp_tunnel_addr(30123), "localhost:30123");
        assert_eq!(config.local_proxy_url(), "http://127.0.0.1:8001");
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" 1 "));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
