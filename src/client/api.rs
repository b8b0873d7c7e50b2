//! HTTP client for the server's admin API.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionKind;
use crate::error::ClientError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct CreateConnectionRequest<'a> {
    connection_type: ConnectionKind,
    secret_key: &'a str,
    subdomain: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateConnectionResponse {
    connection_id: String,
}

#[derive(Debug, Serialize)]
struct ConfigDownloadRequest<'a> {
    secret_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: String,
}

/// Admin API client
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl ApiClient {
    /// `base_url` includes the scheme, e.g. "https://portr.example.com".
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .no_proxy()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Reserve a connection; returns its id.
    pub async fn create_connection(
        &self,
        kind: ConnectionKind,
        subdomain: Option<&str>,
        secret_key: &str,
    ) -> Result<String, ClientError> {
        let request = CreateConnectionRequest {
            connection_type: kind,
            secret_key,
            subdomain: match kind {
                ConnectionKind::Http => subdomain,
                ConnectionKind::Tcp => None,
            },
        };

        let url = format!("{}/api/v1/connections/", self.base_url);
        debug!("Reserving {} connection via {}", kind, url);

        let response = self.http_client.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;
        let created: CreateConnectionResponse = response.json().await?;
        Ok(created.connection_id)
    }

    /// Fetch a ready-made client config for `secret_key`.
    pub async fn download_config(&self, secret_key: &str) -> Result<String, ClientError> {
        let url = format!("{}/api/v1/config/download", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&ConfigDownloadRequest { secret_key })
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: MessageResponse = response.json().await?;
        Ok(body.message)
    }
}

/// Turn a non-2xx reply into `ClientError::Api`, surfacing the server's message.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<MessageResponse>(&body)
        .map(|m| m.message)
        .unwrap_or_else(|_| {
            if body.trim().is_empty() {
                format!("server replied {}", status)
            } else {
                body.trim().to_string()
            }
        });

    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Add a scheme to a bare remote address: plain http for `localhost:` remotes,
/// https for everything else.
pub fn normalize_remote(remote: &str) -> String {
    let remote = remote.trim().trim_end_matches('/');
    if remote.starts_with("http://") || remote.starts_with("https://") {
        remote.to_string()
    } else if remote.starts_with("localhost:") || remote == "localhost" {
        format!("http://{}", remote)
    } else {
        format!("https://{}", remote)
    }
}
