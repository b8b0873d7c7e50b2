//! SSH server module.

mod auth;
mod forward;
mod handler;
mod server;

pub use auth::{parse_ssh_user, Authenticator, SecretKeyAuthenticator};
pub use handler::SshHandler;
pub use server::{ssh_config, TunnelServer};
