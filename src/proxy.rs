//! HTTP proxy layer routing public traffic to tunnel backends.
//! Uses TCP passthrough with Host header peek for subdomain routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::connection::is_valid_subdomain;
use crate::error::TunnelError;
use crate::pages::{raw_error_response, raw_response, ErrorReason};
use crate::state::AppState;

/// Upper bound on backends tried for a single request
const MAX_ATTEMPTS: usize = 3;

const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for a client to send its request headers
const HEADER_PEEK_TIMEOUT: Duration = Duration::from_secs(10);

const PEEK_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Default)]
struct BackendPool {
    backends: Vec<String>,
    cursor: usize,
}

/// Subdomain -> backend pool, with round-robin selection.
#[derive(Debug, Default)]
pub struct ProxyRouter {
    routes: RwLock<HashMap<String, BackendPool>>,
}

impl ProxyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend to a subdomain's pool. Duplicates are ignored.
    pub async fn add_backend(&self, subdomain: &str, addr: &str) {
        let mut routes = self.routes.write().await;
        let pool = routes.entry(subdomain.to_string()).or_default();
        if pool.backends.iter().any(|b| b == addr) {
            debug!("Backend {} already registered for {}", addr, subdomain);
            return;
        }
        pool.backends.push(addr.to_string());
        info!(
            "Registered backend {} for {} (pool size {})",
            addr,
            subdomain,
            pool.backends.len()
        );
    }

    /// Remove a backend; the route disappears with its last backend.
    pub async fn remove_backend(&self, subdomain: &str, addr: &str) -> Result<(), TunnelError> {
        let mut routes = self.routes.write().await;
        let pool = routes
            .get_mut(subdomain)
            .ok_or_else(|| TunnelError::RouteNotFound(subdomain.to_string()))?;

        let index = pool
            .backends
            .iter()
            .position(|b| b == addr)
            .ok_or_else(|| TunnelError::BackendNotFound {
                subdomain: subdomain.to_string(),
                addr: addr.to_string(),
            })?;
        pool.backends.remove(index);

        if pool.backends.is_empty() {
            routes.remove(subdomain);
            info!("Removed route for {}", subdomain);
        } else {
            if index < pool.cursor {
                pool.cursor -= 1;
            }
            if pool.cursor >= pool.backends.len() {
                pool.cursor = 0;
            }
            info!("Removed backend {} from {}", addr, subdomain);
        }
        Ok(())
    }

    /// Next backend for `subdomain` in round-robin order.
    pub async fn get_next_backend(&self, subdomain: &str) -> Result<String, TunnelError> {
        let mut routes = self.routes.write().await;
        let pool = routes
            .get_mut(subdomain)
            .filter(|p| !p.backends.is_empty())
            .ok_or_else(|| TunnelError::RouteNotFound(subdomain.to_string()))?;

        let target = pool.backends[pool.cursor].clone();
        pool.cursor = (pool.cursor + 1) % pool.backends.len();
        Ok(target)
    }

    pub async fn backend_count(&self, subdomain: &str) -> usize {
        let routes = self.routes.read().await;
        routes.get(subdomain).map(|p| p.backends.len()).unwrap_or(0)
    }

    pub async fn subdomains(&self) -> Vec<String> {
        let routes = self.routes.read().await;
        let mut subdomains: Vec<String> = routes.keys().cloned().collect();
        subdomains.sort();
        subdomains
    }
}

/// Extract subdomain from Host header based on a given base domain.
/// e.g., base_domain="localhost", host="test.localhost:8080" -> "test"
/// e.g., base_domain="example.com", host="test.example.com" -> "test"
pub fn extract_subdomain_with_base(host: &str, base_domain: &str) -> Option<String> {
    let host_without_port = host.split(':').next().unwrap_or(host).to_lowercase();

    let suffix = format!(".{}", base_domain.to_lowercase());
    let subdomain = host_without_port.strip_suffix(&suffix)?;

    // Single-level subdomains only
    if subdomain.contains('.') {
        return None;
    }

    if !is_valid_subdomain(subdomain) {
        warn!("Rejecting malformed subdomain in Host header: {}", subdomain);
        return None;
    }

    Some(subdomain.to_string())
}

/// Extract Host header value from raw HTTP request bytes.
pub fn extract_host_from_raw(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);

    // Skip the request line
    for line in text.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn help_response(domain: &str) -> Vec<u8> {
    let body = format!(
        "portr tunnel proxy\n\nRequests are routed by subdomain, e.g.\n  curl -H \"Host: SUBDOMAIN.{}\" <address>\n\nStart a tunnel with: portr http <port> --subdomain SUBDOMAIN\n",
        domain
    );
    raw_response(400, "text/plain; charset=utf-8", &[], &body)
}

/// Peek until the request headers are complete, the buffer is full, or the
/// client stops sending.
async fn peek_headers(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut last = 0;
    loop {
        let n = stream.peek(buf).await?;
        if n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(n);
        }
        if n == last {
            // Nothing new yet; give the client a moment
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        last = n;
    }
}

/// Write a complete response and close our side cleanly.
async fn reply(stream: &mut TcpStream, response: &[u8]) {
    if let Err(e) = stream.write_all(response).await {
        debug!("Failed to write response: {:?}", e);
        return;
    }
    let _ = stream.shutdown().await;
}

enum FirstReply {
    /// The backend answered with this many bytes.
    Bytes(usize),
    /// The backend closed or failed before answering. The request can go to
    /// another backend unless client bytes past the head were already sent.
    BackendLost { replayable: bool },
    ClientGone,
}

/// Send the request head to `backend` and wait for its first reply bytes,
/// relaying further client bytes (request bodies) in the meantime.
async fn first_reply(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    head: &[u8],
    buf: &mut [u8],
) -> FirstReply {
    if let Err(e) = backend.write_all(head).await {
        debug!("Backend write failed: {:?}", e);
        return FirstReply::BackendLost { replayable: true };
    }

    let mut client_buf = [0u8; PEEK_BUFFER_SIZE];
    let mut client_open = true;
    let mut sent_body = false;
    loop {
        tokio::select! {
            read = backend.read(buf) => {
                return match read {
                    Ok(0) => FirstReply::BackendLost { replayable: !sent_body },
                    Ok(n) => FirstReply::Bytes(n),
                    Err(e) => {
                        debug!("Backend read failed: {:?}", e);
                        FirstReply::BackendLost { replayable: !sent_body }
                    }
                };
            }
            read = client.read(&mut client_buf), if client_open => match read {
                Ok(0) => client_open = false,
                Ok(n) => {
                    sent_body = true;
                    if backend.write_all(&client_buf[..n]).await.is_err() {
                        return FirstReply::BackendLost { replayable: false };
                    }
                }
                Err(_) => return FirstReply::ClientGone,
            },
        }
    }
}

/// Handle a single public connection with peek-based routing.
async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let mut peek_buf = [0u8; PEEK_BUFFER_SIZE];
    let n = match tokio::time::timeout(HEADER_PEEK_TIMEOUT, peek_headers(&stream, &mut peek_buf)).await {
        Ok(Ok(0)) => {
            debug!("Connection closed before data received");
            return;
        }
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            error!("Failed to peek data: {:?}", e);
            return;
        }
        Err(_) => {
            debug!("Timed out waiting for request headers");
            return;
        }
    };

    // Consume what was peeked; unread data on close turns into a reset
    let head = &mut peek_buf[..n];
    if let Err(e) = stream.read_exact(head).await {
        debug!("Failed to read request head: {:?}", e);
        return;
    }
    let head = &peek_buf[..n];

    let domain = state.config.domain.clone();

    let subdomain = match extract_host_from_raw(head)
        .and_then(|host| extract_subdomain_with_base(&host, state.config.base_domain()))
    {
        Some(s) => s,
        None => {
            warn!("Request without a routable Host header");
            reply(&mut stream, &help_response(&domain)).await;
            return;
        }
    };

    let pool_size = state.router.backend_count(&subdomain).await;
    if pool_size == 0 {
        info!("No route for subdomain: {}", subdomain);
        reply(&mut stream, &raw_error_response(ErrorReason::UnregisteredSubdomain, &subdomain)).await;
        return;
    }

    let mut reply_buf = vec![0u8; PEEK_BUFFER_SIZE];
    let attempts = pool_size.min(MAX_ATTEMPTS);
    for attempt in 1..=attempts {
        let backend = match state.router.get_next_backend(&subdomain).await {
            Ok(b) => b,
            // Pool drained by a concurrent removal
            Err(_) => break,
        };

        let dial = tokio::time::timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(&backend)).await;
        let mut backend_stream = match dial {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                warn!(
                    "[{}] Backend {} unreachable (attempt {}/{}): {}",
                    subdomain, backend, attempt, attempts, e
                );
                let _ = state.router.remove_backend(&subdomain, &backend).await;
                continue;
            }
            Err(_) => {
                warn!(
                    "[{}] Backend {} timed out (attempt {}/{})",
                    subdomain, backend, attempt, attempts
                );
                let _ = state.router.remove_backend(&subdomain, &backend).await;
                continue;
            }
        };

        debug!("[{}] Forwarding to {}", subdomain, backend);
        match first_reply(&mut stream, &mut backend_stream, head, &mut reply_buf).await {
            FirstReply::Bytes(len) => {
                if stream.write_all(&reply_buf[..len]).await.is_err() {
                    debug!("[{}] Client went away", subdomain);
                    return;
                }
            }
            FirstReply::BackendLost { replayable } => {
                warn!(
                    "[{}] Backend {} closed without a response (attempt {}/{})",
                    subdomain, backend, attempt, attempts
                );
                let _ = state.router.remove_backend(&subdomain, &backend).await;
                if replayable {
                    continue;
                }
                break;
            }
            FirstReply::ClientGone => {
                debug!("[{}] Client went away", subdomain);
                return;
            }
        }

        match copy_bidirectional(&mut stream, &mut backend_stream).await {
            Ok((to_backend, to_client)) => {
                debug!(
                    "[{}] Connection completed: {} bytes to backend, {} bytes to client",
                    subdomain,
                    head.len() as u64 + to_backend,
                    to_client
                );
            }
            Err(e) => {
                debug!("[{}] Copy error (may be normal on close): {:?}", subdomain, e);
            }
        }
        return;
    }

    error!("[{}] All backends failed", subdomain);
    reply(&mut stream, &raw_error_response(ErrorReason::ConnectionLost, &subdomain)).await;
}

/// Accept public connections on `listener` until `shutdown` fires.
pub async fn serve_proxy(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("HTTP proxy shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        let state = state.clone();

        tokio::spawn(async move {
            debug!("HTTP connection from {}", remote_addr);
            handle_connection(stream, state).await;
        });
    }
}

/// Run the HTTP proxy server.
pub async fn run_http_proxy(
    state: Arc<AppState>,
    addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP proxy listening on {}", addr);
    serve_proxy(listener, state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::StaticUsers;
    use tokio::io::AsyncReadExt;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_round_robin_order() {
        let router = ProxyRouter::new();
        router.add_backend("app", "A").await;
        router.add_backend("app", "B").await;
        router.add_backend("app", "C").await;
        router.add_backend("app", "B").await;
        assert_eq!(router.backend_count("app").await, 3);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(router.get_next_backend("app").await.unwrap());
        }
        assert_eq!(order, vec!["A", "B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_removing_all_backends_drops_route() {
        let router = ProxyRouter::new();
        router.add_backend("app", "A").await;
        router.add_backend("app", "B").await;

        assert_ok!(router.remove_backend("app", "A").await);
        assert_ok!(router.remove_backend("app", "B").await);

        assert!(matches!(
            router.get_next_backend("app").await,
            Err(TunnelError::RouteNotFound(_))
        ));
        assert!(router.subdomains().await.is_empty());
        assert!(matches!(
            router.remove_backend("app", "A").await,
            Err(TunnelError::RouteNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_unknown_backend() {
        let router = ProxyRouter::new();
        router.add_backend("app", "A").await;
        assert!(matches!(
            router.remove_backend("app", "Z").await,
            Err(TunnelError::BackendNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_removal_keeps_rotation_in_bounds() {
        let router = ProxyRouter::new();
        for b in ["A", "B", "C"] {
            router.add_backend("app", b).await;
        }
        // Cursor now points at C
        router.get_next_backend("app").await.unwrap();
        router.get_next_backend("app").await.unwrap();

        router.remove_backend("app", "C").await.unwrap();
        assert_eq!(router.get_next_backend("app").await.unwrap(), "A");

        // Removing an earlier entry keeps the next pick stable
        router.remove_backend("app", "A").await.unwrap();
        assert_eq!(router.get_next_backend("app").await.unwrap(), "B");
        assert_eq!(router.get_next_backend("app").await.unwrap(), "B");
    }

    #[test]
    fn test_extract_subdomain_with_localhost() {
        assert_eq!(
            extract_subdomain_with_base("test.localhost:8080", "localhost"),
            Some("test".to_string())
        );
        assert_eq!(
            extract_subdomain_with_base("MyApp.localhost", "localhost"),
            Some("myapp".to_string())
        );
        assert_eq!(extract_subdomain_with_base("localhost:8080", "localhost"), None);
        assert_eq!(extract_subdomain_with_base("localhost", "localhost"), None);
    }

    #[test]
    fn test_extract_subdomain_with_domain() {
        assert_eq!(
            extract_subdomain_with_base("myapp.tunnel.example.com:8080", "tunnel.example.com"),
            Some("myapp".to_string())
        );
        assert_eq!(extract_subdomain_with_base("example.com", "example.com"), None);
        assert_eq!(extract_subdomain_with_base("test.other.com", "example.com"), None);
        assert_eq!(extract_subdomain_with_base("a.b.example.com", "example.com"), None);
        assert_eq!(extract_subdomain_with_base("-bad.example.com", "example.com"), None);
    }

    #[test]
    fn test_extract_host_from_raw() {
        let request = b"GET / HTTP/1.1\r\nHost: shop.localhost:8000\r\nUser-Agent: curl\r\n\r\n";
        assert_eq!(
            extract_host_from_raw(request),
            Some("shop.localhost:8000".to_string())
        );

        let request_lower = b"GET / HTTP/1.1\r\nhost:  shop.example.com \r\n\r\n";
        assert_eq!(
            extract_host_from_raw(request_lower),
            Some("shop.example.com".to_string())
        );

        let no_host = b"GET / HTTP/1.1\r\nUser-Agent: curl\r\n\r\n";
        assert_eq!(extract_host_from_raw(no_host), None);
    }

    async fn spawn_proxy() -> (Arc<AppState>, String, CancellationToken) {
        let state = Arc::new(AppState::new(
            ServerConfig::default(),
            Arc::new(StaticUsers::default()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let token = CancellationToken::new();
        tokio::spawn(serve_proxy(listener, state.clone(), token.clone()));
        (state, addr, token)
    }

    async fn send(addr: &str, host: Option<&str>) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = match host {
            Some(host) => format!("GET /hello HTTP/1.1\r\nHost: {}\r\n\r\n", host),
            None => "GET /hello HTTP/1.1\r\n\r\n".to_string(),
        };
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_unknown_subdomain_gets_404() {
        let (_state, addr, token) = spawn_proxy().await;

        let response = send(&addr, Some("ghost.localhost:8000")).await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains("X-Portr-Error: true"));
        assert!(response.contains("X-Portr-Error-Reason: unregistered-subdomain"));

        let response = send(&addr, None).await;
        assert!(response.starts_with("HTTP/1.1 400"));

        token.cancel();
    }

    #[tokio::test]
    async fn test_dead_backends_are_removed_and_503_returned() {
        let (state, addr, token) = spawn_proxy().await;

        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        state.router.add_backend("shop", &dead_addr).await;

        let response = send(&addr, Some("shop.localhost:8000")).await;
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("X-Portr-Error-Reason: connection-lost"));
        assert_eq!(state.router.backend_count("shop").await, 0);

        token.cancel();
    }

    /// A backend that accepts and hangs up without answering.
    async fn spawn_silent_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_backend_closing_without_reply_is_removed() {
        let (state, addr, token) = spawn_proxy().await;

        let silent = spawn_silent_backend().await;
        state.router.add_backend("shop", &silent).await;

        let response = send(&addr, Some("shop.localhost:8000")).await;
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("X-Portr-Error-Reason: connection-lost"));
        assert_eq!(state.router.backend_count("shop").await, 0);

        token.cancel();
    }

    #[tokio::test]
    async fn test_error_page_survives_request_body() {
        let (_state, addr, token) = spawn_proxy().await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let body = "x".repeat(512);
        let request = format!(
            "POST /upload HTTP/1.1\r\nHost: ghost.localhost:8000\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        assert_ok!(stream.read_to_string(&mut response).await);
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains("X-Portr-Error-Reason: unregistered-subdomain"));

        token.cancel();
    }

    #[tokio::test]
    async fn test_bytes_pass_through_to_live_backend() {
        let (state, addr, token) = spawn_proxy().await;

        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = if request.starts_with("GET /hello") { "hi" } else { "??" };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        // Dead and silent backends ahead of the live one are skipped
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        let silent = spawn_silent_backend().await;
        state.router.add_backend("shop", &dead_addr).await;
        state.router.add_backend("shop", &silent).await;
        state.router.add_backend("shop", &backend_addr).await;

        let response = send(&addr, Some("shop.localhost:8000")).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("hi"));
        assert_eq!(state.router.backend_count("shop").await, 1);

        token.cancel();
    }
}
