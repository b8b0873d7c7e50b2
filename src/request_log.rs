//! Request log records written by the client for every bridged HTTP exchange.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A captured body. Text stays readable; anything else is hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum Body {
    Utf8(String),
    Hex(String),
}

impl Body {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Body::Utf8(text.to_string()),
            Err(_) => Body::Hex(hex::encode(bytes)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        match self {
            Body::Utf8(text) => Ok(text.as_bytes().to_vec()),
            Body::Hex(data) => hex::decode(data),
        }
    }
}

pub type Headers = BTreeMap<String, Vec<String>>;

/// Header name -> all values, in the order received.
pub fn headers_to_map(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub subdomain: String,
    pub local_port: u16,
    pub host: String,
    pub url: String,
    pub method: String,
    pub headers: Headers,
    pub body: Body,
    pub response_headers: Headers,
    pub response_body: Body,
    pub response_status_code: u16,
    pub logged_at: DateTime<Utc>,
    pub is_replayed: bool,
    pub parent_id: Option<String>,
}

/// Destination for request records. Implementations must not block the caller for long.
#[async_trait]
pub trait RequestLogSink: Send + Sync {
    async fn record(&self, record: RequestRecord) -> anyhow::Result<()>;
}

/// Appends one JSON document per line.
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, skipping lines that fail to parse.
    pub async fn read_all(&self) -> anyhow::Result<Vec<RequestRecord>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(data
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl RequestLogSink for JsonLinesSink {
    async fn record(&self, record: RequestRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<RequestRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<RequestRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RequestLogSink for MemorySink {
    async fn record(&self, record: RequestRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}
