//! Connection records and the identifiers shared by client and server.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Maximum length for a subdomain (DNS label limit)
pub const MAX_SUBDOMAIN_LENGTH: usize = 63;

/// Minimum length for a subdomain
pub const MIN_SUBDOMAIN_LENGTH: usize = 1;

/// Length of generated subdomains
const GENERATED_SUBDOMAIN_LENGTH: usize = 6;

/// Kind of traffic a tunnel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Http,
    Tcp,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Http => write!(f, "http"),
            ConnectionKind::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ConnectionKind::Http),
            "tcp" => Ok(ConnectionKind::Tcp),
            other => Err(format!("unknown connection type '{}'", other)),
        }
    }
}

/// Lifecycle state. Only ever moves forward: Reserved -> Active -> Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Reserved,
    Active,
    Closed,
}

impl ConnectionStatus {
    /// Whether `next` is the single legal successor of `self`.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        matches!(
            (self, next),
            (ConnectionStatus::Reserved, ConnectionStatus::Active)
                | (ConnectionStatus::Active, ConnectionStatus::Closed)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Reserved => write!(f, "reserved"),
            ConnectionStatus::Active => write!(f, "active"),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// The team member a connection was created by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamUser {
    pub email: String,
    pub team: String,
    pub secret_key: String,
}

/// A tunnel's identity and lifecycle record.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: String,
    pub kind: ConnectionKind,
    pub subdomain: Option<String>,
    /// Public port, set on activation of tcp connections
    pub port: Option<u16>,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub created_by: TeamUser,
    /// Proxy backend registered on activation of http connections
    #[serde(skip_serializing)]
    pub backend: Option<String>,
}

impl Connection {
    pub fn new(kind: ConnectionKind, subdomain: Option<String>, created_by: TeamUser) -> Self {
        Self {
            id: generate_connection_id(),
            kind,
            subdomain: match kind {
                ConnectionKind::Http => subdomain,
                ConnectionKind::Tcp => None,
            },
            port: None,
            status: ConnectionStatus::Reserved,
            created_at: Utc::now(),
            started_at: None,
            closed_at: None,
            created_by,
            backend: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// Whether this connection still claims its subdomain.
    pub fn holds_subdomain(&self, subdomain: &str) -> bool {
        self.status != ConnectionStatus::Closed && self.subdomain.as_deref() == Some(subdomain)
    }
}

/// Time-sortable unique identifier.
pub fn generate_connection_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// Random subdomain of lowercase letters, used when the client names none.
pub fn generate_subdomain() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..GENERATED_SUBDOMAIN_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Subdomain validation result
#[derive(Debug, Clone, PartialEq)]
pub enum SubdomainValidation {
    Valid,
    TooLong,
    TooShort,
    InvalidCharacters,
    StartsWithHyphen,
    EndsWithHyphen,
}

/// Validate a subdomain string.
///
/// Rules:
/// - Length: 1-63 characters (DNS label limit)
/// - Characters: lowercase letters, digits, hyphens only
/// - Cannot start or end with a hyphen
pub fn validate_subdomain(subdomain: &str) -> SubdomainValidation {
    if subdomain.len() > MAX_SUBDOMAIN_LENGTH {
        return SubdomainValidation::TooLong;
    }

    if subdomain.len() < MIN_SUBDOMAIN_LENGTH {
        return SubdomainValidation::TooShort;
    }

    if subdomain.starts_with('-') {
        return SubdomainValidation::StartsWithHyphen;
    }

    if subdomain.ends_with('-') {
        return SubdomainValidation::EndsWithHyphen;
    }

    if !subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return SubdomainValidation::InvalidCharacters;
    }

    SubdomainValidation::Valid
}

pub fn is_valid_subdomain(subdomain: &str) -> bool {
    validate_subdomain(subdomain) == SubdomainValidation::Valid
}
