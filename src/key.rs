//! SSH host key management.

use std::fs;
use std::path::Path;

use log::info;
use russh_keys::ssh_key::LineEnding;
use russh_keys::{Algorithm, HashAlg, PrivateKey};

/// Load the host key at `path`, or generate an Ed25519 key and persist it there.
pub fn load_or_generate_server_key(path: &Path) -> anyhow::Result<PrivateKey> {
    let key = if path.exists() {
        info!("Loading server key from {}...", path.display());
        let key_data = fs::read_to_string(path)?;
        PrivateKey::from_openssh(&key_data)?
    } else {
        info!("Generating new Ed25519 server key...");
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let key_data = key.to_openssh(LineEnding::LF)?;
        fs::write(path, key_data.as_bytes())?;
        info!("Server key saved to {}", path.display());
        key
    };

    info!(
        "Server key fingerprint: {}",
        key.public_key().fingerprint(HashAlg::Sha256)
    );
    Ok(key)
}
