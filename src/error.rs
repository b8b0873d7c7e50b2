//! Error types for the tunnel server and client.

use crate::connection::ConnectionStatus;

/// Errors raised on the server side: registry, routing and SSH sessions.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Subdomain is required for HTTP connections")]
    SubdomainRequired,

    #[error("Invalid subdomain '{0}'")]
    InvalidSubdomain(String),

    #[error("Subdomain '{0}' is already in use")]
    SubdomainConflict(String),

    #[error("Connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("Connection '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    #[error("No route registered for subdomain '{0}'")]
    RouteNotFound(String),

    #[error("Backend '{addr}' not registered for subdomain '{subdomain}'")]
    BackendNotFound { subdomain: String, addr: String },

    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised by the tunnel client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(
        "host key verification failed for {host}\n\
         The server's host key has changed!\n\
         New key fingerprint: {fingerprint}\n\
         This could indicate a man-in-the-middle attack.\n\
         If you trust this key, remove the old entry from {path} and try again"
    )]
    HostKeyMismatch {
        host: String,
        fingerprint: String,
        path: String,
    },

    #[error("SSH authentication rejected by server")]
    AuthRejected,

    #[error("failed to listen on remote endpoint after trying {0} ports")]
    PortExhausted(usize),

    #[error("health check failed more than {0} times, giving up")]
    RetriesExhausted(u32),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Errors that must never be retried through the reconnect loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::HostKeyMismatch { .. }
                | ClientError::AuthRejected
                | ClientError::RetriesExhausted(_)
                | ClientError::Config(_)
        ) || matches!(self, ClientError::Api { status, .. } if *status == 401)
    }
}
