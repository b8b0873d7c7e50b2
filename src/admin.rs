//! Admin control API.
//!
//! The narrow HTTP surface the tunnel client talks to: reserve a connection,
//! fetch a ready-made client config, and list or terminate connections.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionKind, TeamUser};
use crate::error::TunnelError;
use crate::state::AppState;

const DEFAULT_RECENT_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct CreateConnectionRequest {
    pub secret_key: String,
    pub connection_type: ConnectionKind,
    #[serde(default)]
    pub subdomain: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateConnectionResponse {
    pub connection_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfigDownloadRequest {
    pub secret_key: String,
}

/// Every error and plain-text reply is a `{message}` object.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

/// JSON view of a single connection.
#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub subdomain: Option<String>,
    pub port: Option<u16>,
    pub status: String,
    pub url: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub closed_at: Option<String>,
}

impl ConnectionResponse {
    fn from_connection(connection: Connection, config: &ServerConfig) -> Self {
        let url = match connection.kind {
            ConnectionKind::Http => connection.subdomain.as_deref().map(|s| config.http_tunnel_url(s)),
            ConnectionKind::Tcp => connection.port.map(|p| config.tcp_tunnel_addr(p)),
        };
        Self {
            id: connection.id,
            kind: connection.kind,
            subdomain: connection.subdomain,
            port: connection.port,
            status: connection.status.to_string(),
            url,
            created_by: connection.created_by.email,
            created_at: connection.created_at.to_rfc3339(),
            started_at: connection.started_at.map(|t| t.to_rfc3339()),
            closed_at: connection.closed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConnectionsListResponse {
    pub count: usize,
    pub data: Vec<ConnectionResponse>,
}

type ApiError = (StatusCode, Json<MessageResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(MessageResponse {
            message: message.into(),
        }),
    )
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        let status = match &err {
            TunnelError::InvalidSecretKey => StatusCode::UNAUTHORIZED,
            TunnelError::SubdomainRequired | TunnelError::InvalidSubdomain(_) => StatusCode::BAD_REQUEST,
            TunnelError::SubdomainConflict(_) => StatusCode::CONFLICT,
            TunnelError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, err.to_string())
    }
}

/// Client configuration file handed out by the config download endpoint.
pub fn render_client_config(config: &ServerConfig, user: &TeamUser) -> String {
    format!(
        "PORTR_SERVER_URL={}\n\
         PORTR_SSH_URL={}\n\
         PORTR_TUNNEL_URL={}\n\
         PORTR_SECRET_KEY={}\n\
         PORTR_USE_LOCALHOST={}\n\
         PORTR_TUNNELS=portr:http:4321:portr\n",
        config.server_url,
        config.ssh_url(),
        config.domain,
        user.secret_key,
        config.use_localhost
    )
}

/// POST /api/v1/connections/ - Reserve a connection
async fn create_connection(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateConnectionRequest>,
) -> Result<Json<CreateConnectionResponse>, ApiError> {
    let connection = state
        .registry
        .create_reserved(
            request.connection_type,
            request.subdomain.as_deref(),
            &request.secret_key,
        )
        .await
        .map_err(|e| {
            warn!("Admin API: reservation rejected: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(CreateConnectionResponse {
        connection_id: connection.id,
    }))
}

/// GET /api/v1/connections?type=active|recent - List connections
async fn list_connections(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ConnectionsListResponse>, ApiError> {
    let connections = match query.kind.as_deref().unwrap_or("active") {
        "active" => state.registry.list_active().await,
        "recent" => {
            state
                .registry
                .list_recent(query.limit.unwrap_or(DEFAULT_RECENT_LIMIT))
                .await
        }
        other => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown connection listing '{}'", other),
            ))
        }
    };

    let data: Vec<ConnectionResponse> = connections
        .into_iter()
        .map(|c| ConnectionResponse::from_connection(c, &state.config))
        .collect();

    Ok(Json(ConnectionsListResponse {
        count: data.len(),
        data,
    }))
}

/// DELETE /api/v1/connections/{id} - Force disconnect a tunnel
async fn kick_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("Admin API: kick request for connection '{}'", id);

    let closed = state
        .terminate_connection(&id, "Tunnel terminated by administrator")
        .await
        .map_err(|e| match e {
            TunnelError::InvalidTransition { .. } => {
                api_error(StatusCode::CONFLICT, format!("Connection '{}' is not active", id))
            }
            other => ApiError::from(other),
        })?;

    let message = if closed {
        format!("Connection '{}' disconnected", id)
    } else {
        format!("Connection '{}' was already closed", id)
    };
    Ok(Json(MessageResponse { message }))
}

/// POST /api/v1/config/download - Render a client config for a secret key
async fn download_config(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConfigDownloadRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = state
        .registry
        .lookup_user(&request.secret_key)
        .ok_or_else(|| ApiError::from(TunnelError::InvalidSecretKey))?;

    Ok(Json(MessageResponse {
        message: render_client_config(&state.config, &user),
    }))
}

/// Create the admin API router
pub fn create_admin_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/v1/connections",
            get(list_connections).post(create_connection),
        )
        .route("/api/v1/connections/", post(create_connection))
        .route("/api/v1/connections/{id}", delete(kick_connection))
        .route("/api/v1/config/download", post(download_config))
        .layer(cors)
        .with_state(state)
}

/// Serve the admin API on `listener` until `shutdown` fires.
pub async fn serve_admin_api(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_admin_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Run the admin API server
pub async fn run_admin_api(state: Arc<AppState>, addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin API listening on {}", addr);
    serve_admin_api(listener, state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticUsers;
    use serde_json::{json, Value};

    async fn spawn_admin() -> (Arc<AppState>, String, CancellationToken) {
        let users = StaticUsers::new(vec![TeamUser {
            email: "amy@example.com".to_string(),
            team: "core".to_string(),
            secret_key: "sk-amy".to_string(),
        }]);
        let state = Arc::new(AppState::new(ServerConfig::default(), Arc::new(users)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let token = CancellationToken::new();
        tokio::spawn(serve_admin_api(listener, state.clone(), token.clone()));
        (state, url, token)
    }

    #[tokio::test]
    async fn test_create_connection_and_conflict() {
        let (state, url, token) = spawn_admin().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/v1/connections/", url))
            .json(&json!({"secret_key": "sk-amy", "connection_type": "http", "subdomain": "shop"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        let id = body["connection_id"].as_str().unwrap().to_string();
        assert!(state.registry.get_by_id(&id).await.is_ok());

        let response = client
            .post(format!("{}/api/v1/connections/", url))
            .json(&json!({"secret_key": "sk-amy", "connection_type": "http", "subdomain": "shop"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 409);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["message"], "Subdomain 'shop' is already in use");

        token.cancel();
    }

    #[tokio::test]
    async fn test_create_connection_rejections() {
        let (_state, url, token) = spawn_admin().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/v1/connections/", url))
            .json(&json!({"secret_key": "wrong", "connection_type": "tcp"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);

        let response = client
            .post(format!("{}/api/v1/connections/", url))
            .json(&json!({"secret_key": "sk-amy", "connection_type": "http"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        token.cancel();
    }

    #[tokio::test]
    async fn test_list_connections() {
        let (state, url, token) = spawn_admin().await;
        let conn = state
            .registry
            .create_reserved(ConnectionKind::Tcp, None, "sk-amy")
            .await
            .unwrap();
        state.registry.mark_active(&conn.id, Some(30444), None).await.unwrap();

        let body: Value = reqwest::get(format!("{}/api/v1/connections?type=active", url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["type"], "tcp");
        assert_eq!(body["data"][0]["url"], "localhost:30444");
        assert_eq!(body["data"][0]["status"], "active");

        let response = reqwest::get(format!("{}/api/v1/connections?type=bogus", url))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        token.cancel();
    }

    #[tokio::test]
    async fn test_kick_connection() {
        let (state, url, token) = spawn_admin().await;
        let conn = state
            .registry
            .create_reserved(ConnectionKind::Tcp, None, "sk-amy")
            .await
            .unwrap();
        state.registry.mark_active(&conn.id, Some(30445), None).await.unwrap();

        let client = reqwest::Client::new();
        let response = client
            .delete(format!("{}/api/v1/connections/{}", url, conn.id))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(!state.registry.get_by_id(&conn.id).await.unwrap().is_active());

        let response = client
            .delete(format!("{}/api/v1/connections/missing", url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        token.cancel();
    }

    #[tokio::test]
    async fn test_download_config() {
        let (_state, url, token) = spawn_admin().await;
        let client = reqwest::Client::new();

        let body: Value = client
            .post(format!("{}/api/v1/config/download", url))
            .json(&json!({"secret_key": "sk-amy"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let text = body["message"].as_str().unwrap();
        assert!(text.contains("PORTR_SECRET_KEY=sk-amy"));
        assert!(text.contains("PORTR_SSH_URL=localhost:2222"));

        let response = client
            .post(format!("{}/api/v1/config/download", url))
            .json(&json!({"secret_key": "nope"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);

        token.cancel();
    }
}
