//! Trust-on-first-use verification of the server's SSH host key.
//!
//! Entries live one per line as `host key-type base64`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};
use russh_keys::{HashAlg, PublicKey};

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a key already on file for `host`, record an unseen host,
    /// and refuse a key that differs from the recorded one.
    pub fn verify(&self, host: &str, key: &PublicKey) -> Result<(), ClientError> {
        let presented = openssh_line(key)?;

        match self.lookup(host)? {
            Some(known) if same_key(&known, &presented) => Ok(()),
            Some(_) => {
                let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
                warn!("Host key for {} changed, new fingerprint {}", host, fingerprint);
                Err(ClientError::HostKeyMismatch {
                    host: host.to_string(),
                    fingerprint,
                    path: self.path.display().to_string(),
                })
            }
            None => {
                self.append(host, &presented)?;
                info!(
                    "Permanently added {} ({}) to the list of known hosts",
                    host,
                    key.fingerprint(HashAlg::Sha256)
                );
                Ok(())
            }
        }
    }

    /// The `key-type base64` recorded for `host`, if any.
    fn lookup(&self, host: &str) -> Result<Option<String>, ClientError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(entry_host), Some(key_type), Some(blob)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if entry_host == host {
                return Ok(Some(format!("{} {}", key_type, blob)));
            }
        }
        Ok(None)
    }

    fn append(&self, host: &str, key_line: &str) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {}", host, key_line)?;
        Ok(())
    }
}

/// `key-type base64` without the trailing comment.
fn openssh_line(key: &PublicKey) -> Result<String, ClientError> {
    let encoded = key
        .to_openssh()
        .map_err(|e| ClientError::Config(format!("cannot encode host key: {}", e)))?;
    Ok(encoded.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
}

fn same_key(known: &str, presented: &str) -> bool {
    match (PublicKey::from_openssh(known), PublicKey::from_openssh(presented)) {
        (Ok(a), Ok(b)) => a.key_data() == b.key_data(),
        _ => known == presented,
    }
}
