//! Client configuration.
//!
//! Settings live in `~/.portr/config.env` as `KEY=value` lines (the same
//! format the server's config download endpoint renders). Process
//! environment variables override the file.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info};

use crate::config::parse_bool;
use crate::connection::{generate_subdomain, validate_subdomain, ConnectionKind, SubdomainValidation};
use crate::error::ClientError;

mod env {
    pub const SERVER_URL: &str = "PORTR_SERVER_URL";
    pub const SSH_URL: &str = "PORTR_SSH_URL";
    pub const TUNNEL_URL: &str = "PORTR_TUNNEL_URL";
    pub const SECRET_KEY: &str = "PORTR_SECRET_KEY";
    pub const USE_LOCALHOST: &str = "PORTR_USE_LOCALHOST";
    pub const TUNNELS: &str = "PORTR_TUNNELS";
    pub const HEALTH_CHECK_INTERVAL_SECS: &str = "PORTR_HEALTH_CHECK_INTERVAL_SECS";
    pub const MAX_RETRIES: &str = "PORTR_MAX_RETRIES";
    pub const INSECURE_SKIP_HOST_KEY: &str = "PORTR_INSECURE_SKIP_HOST_KEY";
    pub const ENABLE_REQUEST_LOGGING: &str = "PORTR_ENABLE_REQUEST_LOGGING";

    pub const ALL: &[&str] = &[
        SERVER_URL,
        SSH_URL,
        TUNNEL_URL,
        SECRET_KEY,
        USE_LOCALHOST,
        TUNNELS,
        HEALTH_CHECK_INTERVAL_SECS,
        MAX_RETRIES,
        INSECURE_SKIP_HOST_KEY,
        ENABLE_REQUEST_LOGGING,
    ];
}

const DEFAULT_SERVER_URL: &str = "localhost:8000";
const DEFAULT_SSH_PORT: u16 = 2222;
const CONFIG_DIR_NAME: &str = ".portr";
const CONFIG_FILE_NAME: &str = "config.env";

/// One tunnel to expose: a local service plus how it should be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub kind: ConnectionKind,
    pub host: String,
    pub port: u16,
    /// Always set for http once normalized; unused for tcp
    pub subdomain: Option<String>,
}

impl TunnelSpec {
    pub fn http(port: u16, subdomain: Option<String>) -> Result<Self, ClientError> {
        let spec = Self {
            name: format!("http-{}", port),
            kind: ConnectionKind::Http,
            host: "localhost".to_string(),
            port,
            subdomain: subdomain.map(|s| s.to_lowercase()),
        }
        .normalized();
        spec.check()?;
        Ok(spec)
    }

    pub fn tcp(port: u16) -> Self {
        Self {
            name: format!("tcp-{}", port),
            kind: ConnectionKind::Tcp,
            host: "localhost".to_string(),
            port,
            subdomain: None,
        }
    }

    /// HTTP tunnels without a subdomain get a random one; TCP tunnels never carry one.
    fn normalized(mut self) -> Self {
        match self.kind {
            ConnectionKind::Http if self.subdomain.is_none() => {
                self.subdomain = Some(generate_subdomain());
            }
            ConnectionKind::Tcp => self.subdomain = None,
            _ => {}
        }
        self
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn check(&self) -> Result<(), ClientError> {
        if let Some(subdomain) = &self.subdomain {
            let verdict = validate_subdomain(subdomain);
            if verdict != SubdomainValidation::Valid {
                return Err(ClientError::Config(format!(
                    "tunnel '{}': invalid subdomain '{}' ({:?})",
                    self.name, subdomain, verdict
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for TunnelSpec {
    type Err = ClientError;

    /// `name:type:port[:subdomain]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').map(str::trim).collect();
        if parts.len() < 3 || parts.len() > 4 || parts[0].is_empty() {
            return Err(ClientError::Config(format!(
                "tunnel '{}' must look like name:type:port[:subdomain]",
                s
            )));
        }

        let kind = parts[1]
            .parse::<ConnectionKind>()
            .map_err(|e| ClientError::Config(format!("tunnel '{}': {}", parts[0], e)))?;
        let port = parts[2].parse::<u16>().map_err(|_| {
            ClientError::Config(format!("tunnel '{}': invalid port '{}'", parts[0], parts[2]))
        })?;

        let spec = Self {
            name: parts[0].to_string(),
            kind,
            host: "localhost".to_string(),
            port,
            subdomain: parts
                .get(3)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase()),
        }
        .normalized();
        spec.check()?;
        Ok(spec)
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subdomain {
            Some(sub) => write!(f, "{}:{}:{}:{}", self.name, self.kind, self.port, sub),
            None => write!(f, "{}:{}:{}", self.name, self.kind, self.port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Admin API address, with or without scheme
    pub server_url: String,
    pub ssh_url: String,
    /// Public tunnel domain, may carry a port
    pub tunnel_url: String,
    pub secret_key: String,
    pub use_localhost: bool,
    pub tunnels: Vec<TunnelSpec>,
    pub health_check_interval: Duration,
    pub max_retries: u32,
    pub insecure_skip_host_key: bool,
    pub enable_request_logging: bool,
    pub config_dir: PathBuf,
}

impl ClientConfig {
    /// `~/.portr`
    pub fn default_dir() -> Result<PathBuf, ClientError> {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME))
            .ok_or_else(|| ClientError::Config("could not determine home directory".to_string()))
    }

    pub fn default_path() -> Result<PathBuf, ClientError> {
        Ok(Self::default_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Read `config_dir/config.env` (if present) and overlay the process environment.
    pub fn load(config_dir: &Path) -> Result<Self, ClientError> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        let mut vars = read_config_file(&path)?;
        for name in env::ALL {
            if let Ok(value) = std::env::var(name) {
                vars.insert(name.to_string(), value);
            }
        }
        Self::from_lookup(|name| vars.get(name).cloned(), config_dir.to_path_buf())
    }

    pub fn from_lookup<F>(lookup: F, config_dir: PathBuf) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let server_url = non_empty(env::SERVER_URL).unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let ssh_url = non_empty(env::SSH_URL)
            .unwrap_or_else(|| format!("{}:{}", host_of(&server_url), DEFAULT_SSH_PORT));
        let tunnel_url = non_empty(env::TUNNEL_URL)
            .unwrap_or_else(|| strip_scheme(&server_url).trim_end_matches('/').to_string());

        let tunnels = match non_empty(env::TUNNELS) {
            Some(list) => list
                .split(',')
                .filter(|entry| !entry.trim().is_empty())
                .map(str::parse)
                .collect::<Result<Vec<TunnelSpec>, _>>()?,
            None => Vec::new(),
        };

        let health_check_interval = match non_empty(env::HEALTH_CHECK_INTERVAL_SECS) {
            Some(v) => match v.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ClientError::Config(format!(
                        "{} must be a positive number of seconds",
                        env::HEALTH_CHECK_INTERVAL_SECS
                    )))
                }
            },
            None => Duration::from_secs(10),
        };

        let max_retries = match non_empty(env::MAX_RETRIES) {
            Some(v) => v.trim().parse::<u32>().map_err(|_| {
                ClientError::Config(format!("{} has an invalid value '{}'", env::MAX_RETRIES, v))
            })?,
            None => 5,
        };

        Ok(Self {
            server_url,
            ssh_url,
            tunnel_url,
            secret_key: non_empty(env::SECRET_KEY).unwrap_or_default(),
            use_localhost: non_empty(env::USE_LOCALHOST)
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            tunnels,
            health_check_interval,
            max_retries,
            insecure_skip_host_key: non_empty(env::INSECURE_SKIP_HOST_KEY)
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            enable_request_logging: non_empty(env::ENABLE_REQUEST_LOGGING)
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            config_dir,
        })
    }

    fn scheme(&self) -> &'static str {
        if self.use_localhost {
            "http"
        } else {
            "https"
        }
    }

    /// Admin API base URL, scheme included.
    pub fn server_addr(&self) -> String {
        if self.server_url.contains("://") {
            self.server_url.trim_end_matches('/').to_string()
        } else {
            format!("{}://{}", self.scheme(), self.server_url.trim_end_matches('/'))
        }
    }

    pub fn http_tunnel_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.scheme(), subdomain, strip_scheme(&self.tunnel_url))
    }

    /// Host name of an http tunnel, without scheme or port.
    pub fn http_tunnel_host(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, host_of(&self.tunnel_url))
    }

    pub fn tcp_tunnel_addr(&self, port: u16) -> String {
        format!("{}:{}", host_of(&self.tunnel_url), port)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.config_dir.join("known_hosts")
    }

    pub fn request_log_path(&self) -> PathBuf {
        self.config_dir.join("requests.jsonl")
    }

    pub fn require_secret_key(&self) -> Result<&str, ClientError> {
        if self.secret_key.is_empty() {
            return Err(ClientError::Config(
                "no secret key configured, run `portr auth set` first".to_string(),
            ));
        }
        Ok(&self.secret_key)
    }

    /// Pick configured tunnels by name; an empty list selects all of them.
    pub fn select_tunnels(&self, names: &[String]) -> Result<Vec<TunnelSpec>, ClientError> {
        if names.is_empty() {
            if self.tunnels.is_empty() {
                return Err(ClientError::Config(format!(
                    "no tunnels configured in {}",
                    self.config_path().display()
                )));
            }
            return Ok(self.tunnels.clone());
        }

        names
            .iter()
            .map(|name| {
                self.tunnels
                    .iter()
                    .find(|t| &t.name == name)
                    .cloned()
                    .ok_or_else(|| ClientError::Config(format!("tunnel '{}' is not configured", name)))
            })
            .collect()
    }
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
}

fn host_of(url: &str) -> &str {
    let rest = strip_scheme(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    authority.split(':').next().unwrap_or(authority)
}

fn read_config_file(path: &Path) -> Result<HashMap<String, String>, ClientError> {
    if !path.exists() {
        debug!("No client config at {}", path.display());
        return Ok(HashMap::new());
    }
    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| ClientError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    iter.map(|item| {
        item.map_err(|e| ClientError::Config(format!("failed to parse {}: {}", path.display(), e)))
    })
    .collect()
}

/// Replace the config file with `contents`, creating the directory as needed.
pub fn write_config(path: &Path, contents: &str) -> Result<(), ClientError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    info!("Config saved to {}", path.display());
    Ok(())
}

/// Open the config file in `$EDITOR`, falling back to the platform opener.
pub fn edit_config(path: &Path) -> Result<(), ClientError> {
    if !path.exists() {
        write_config(path, "")?;
    }

    let editor = std::env::var("EDITOR").ok().filter(|e| !e.trim().is_empty());
    let mut command = match editor {
        Some(editor) => std::process::Command::new(editor),
        None if cfg!(target_os = "macos") => std::process::Command::new("open"),
        None if cfg!(target_os = "windows") => {
            let mut cmd = std::process::Command::new("cmd");
            cmd.args(["/C", "start", ""]);
            cmd
        }
        None => std::process::Command::new("xdg-open"),
    };

    let status = command.arg(path).status()?;
    if !status.success() {
        return Err(ClientError::Config(format!("editor exited with {}", status)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::render_client_config;
    use crate::config::ServerConfig;
    use crate::connection::TeamUser;
    use tokio_test::assert_ok;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ClientConfig, ClientError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|name| vars.get(name).cloned(), PathBuf::from("/tmp/portr-test"))
    }

    #[test]
    fn test_tunnel_spec_parsing() {
        let spec: TunnelSpec = "web:http:3000:shop".parse().unwrap();
        assert_eq!(spec.name, "web");
        assert_eq!(spec.kind, ConnectionKind::Http);
        assert_eq!(spec.port, 3000);
        assert_eq!(spec.subdomain.as_deref(), Some("shop"));
        assert_eq!(spec.local_addr(), "localhost:3000");

        let spec: TunnelSpec = "db:tcp:5432".parse().unwrap();
        assert_eq!(spec.kind, ConnectionKind::Tcp);
        assert!(spec.subdomain.is_none());

        // Generated subdomain for http without one
        let spec: TunnelSpec = "api:HTTP:8080".parse().unwrap();
        assert_eq!(spec.subdomain.as_ref().map(|s| s.len()), Some(6));
    }

    #[test]
    fn test_tunnel_spec_rejects_garbage() {
        assert!("web:http".parse::<TunnelSpec>().is_err());
        assert!("web:ftp:21".parse::<TunnelSpec>().is_err());
        assert!("web:http:99999".parse::<TunnelSpec>().is_err());
        assert!("web:http:80:bad_sub!".parse::<TunnelSpec>().is_err());
        assert!(":http:80".parse::<TunnelSpec>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.server_url, "localhost:8000");
        assert_eq!(config.ssh_url, "localhost:2222");
        assert_eq!(config.tunnel_url, "localhost:8000");
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert_eq!(config.max_retries, 5);
        assert!(config.enable_request_logging);
        assert!(!config.insecure_skip_host_key);
        assert!(config.require_secret_key().is_err());
    }

    #[test]
    fn test_urls() {
        let config = from_pairs(&[
            ("PORTR_SERVER_URL", "portr.example.com"),
            ("PORTR_TUNNEL_URL", "tunnels.example.com"),
        ])
        .unwrap();
        assert_eq!(config.server_addr(), "https://portr.example.com");
        assert_eq!(config.http_tunnel_url("shop"), "https://shop.tunnels.example.com");
        assert_eq!(config.http_tunnel_host("shop"), "shop.tunnels.example.com");
        assert_eq!(config.tcp_tunnel_addr(30500), "tunnels.example.com:30500");
        assert_eq!(config.ssh_url, "portr.example.com:2222");

        let config = from_pairs(&[
            ("PORTR_SERVER_URL", "http://127.0.0.1:9000/"),
            ("PORTR_USE_LOCALHOST", "true"),
        ])
        .unwrap();
        assert_eq!(config.server_addr(), "http://127.0.0.1:9000");
        assert_eq!(config.http_tunnel_url("a"), "http://a.127.0.0.1:9000");
    }

    #[test]
    fn test_select_tunnels() {
        let config = from_pairs(&[("PORTR_TUNNELS", "web:http:3000:web, db:tcp:5432")]).unwrap();
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.select_tunnels(&[]).unwrap().len(), 2);

        let picked = config.select_tunnels(&["db".to_string()]).unwrap();
        assert_eq!(picked[0].kind, ConnectionKind::Tcp);
        assert!(config.select_tunnels(&["missing".to_string()]).is_err());
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(from_pairs(&[("PORTR_HEALTH_CHECK_INTERVAL_SECS", "0")]).is_err());
        assert!(from_pairs(&[("PORTR_MAX_RETRIES", "many")]).is_err());
    }

    #[test]
    fn test_loads_downloaded_config() {
        let server = ServerConfig {
            use_localhost: true,
            ..ServerConfig::default()
        };
        let user = TeamUser {
            email: "amy@example.com".to_string(),
            team: "core".to_string(),
            secret_key: "sk-amy".to_string(),
        };

        let dir = tempfile::tempdir().unwrap();
        assert_ok!(write_config(
            &dir.path().join(CONFIG_FILE_NAME),
            &render_client_config(&server, &user)
        ));

        let config = ClientConfig::load(dir.path()).unwrap();
        assert_eq!(config.require_secret_key().unwrap(), "sk-amy");
        assert_eq!(config.server_addr(), "http://localhost:8000");
        assert_eq!(config.ssh_url, "localhost:2222");
        assert_eq!(config.http_tunnel_url("portr"), "http://portr.localhost:8001");
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].port, 4321);
        assert_eq!(config.known_hosts_path(), dir.path().join("known_hosts"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = assert_ok!(ClientConfig::load(dir.path()));
        assert_eq!(config.config_dir, dir.path());
    }
}
