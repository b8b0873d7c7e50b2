//! Forwarded listeners: one per accepted `tcpip-forward` request.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use russh::server::Handle;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::pages::{raw_error_response, ErrorReason};
use crate::state::AppState;

fn is_unspecified(address: &str) -> bool {
    matches!(address, "" | "0.0.0.0" | "::" | "[::]")
}

/// Address the forwarded listener binds to.
pub(crate) fn bind_host(address: &str) -> &str {
    match address {
        "" => "0.0.0.0",
        "[::]" => "::",
        other => other,
    }
}

/// Address the proxy dials to reach a forwarded listener.
pub(crate) fn backend_addr(address: &str, port: u16) -> String {
    if is_unspecified(address) || address.eq_ignore_ascii_case("localhost") {
        format!("127.0.0.1:{}", port)
    } else if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

/// How long a closing socket keeps draining the peer's request.
const LINGER: Duration = Duration::from_secs(1);

/// Answer with `response`, then drain whatever the peer already sent so the
/// close is a FIN rather than a reset that would discard the page.
async fn reply_and_close(mut socket: TcpStream, response: &[u8]) {
    if socket.write_all(response).await.is_err() {
        return;
    }
    let _ = socket.shutdown().await;
    let mut discard = [0u8; 1024];
    let _ = tokio::time::timeout(LINGER, async {
        while matches!(socket.read(&mut discard).await, Ok(n) if n > 0) {}
    })
    .await;
}

pub(crate) async fn bind_forward(address: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((bind_host(address), port)).await
}

/// Accept inbound sockets and tunnel each one through a `forwarded-tcpip`
/// channel until `token` is cancelled.
///
/// HTTP forwards pass their subdomain so a socket whose channel cannot be
/// opened still gets the connection-lost page. A channel refused because the
/// session is gone cancels `token`, which closes the connection.
pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    handle: Handle,
    address: String,
    port: u32,
    subdomain: Option<String>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let (mut socket, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed on forwarded port {}: {}", port, e);
                        continue;
                    }
                },
            };

            let handle = handle.clone();
            let address = address.clone();
            let subdomain = subdomain.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let channel = match handle
                    .channel_open_forwarded_tcpip(
                        address.as_str(),
                        port,
                        peer.ip().to_string(),
                        peer.port() as u32,
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!("Failed to open forwarded channel for {}: {:?}", peer, e);
                        if matches!(e, russh::Error::SendError | russh::Error::Disconnect) {
                            info!("Session behind port {} is gone", port);
                            token.cancel();
                        }
                        if let Some(subdomain) = subdomain {
                            let page = raw_error_response(ErrorReason::ConnectionLost, &subdomain);
                            reply_and_close(socket, &page).await;
                        }
                        return;
                    }
                };

                let mut channel_stream = channel.into_stream();
                match copy_bidirectional(&mut socket, &mut channel_stream).await {
                    Ok((to_ssh, to_tcp)) => debug!(
                        "Forwarded connection from {} done: {} bytes to SSH, {} bytes to TCP",
                        peer, to_ssh, to_tcp
                    ),
                    Err(e) => debug!("Copy error (may be normal on close): {:?}", e),
                }
            });
        }
        info!("Forwarded listener on port {} stopped", port);
    });
}

/// Close the connection once its forward token fires (session end, cancel
/// request, or server shutdown).
pub(crate) fn spawn_lifecycle_watcher(state: Arc<AppState>, connection_id: String, token: CancellationToken) {
    tokio::spawn(async move {
        token.cancelled().await;
        match state.close_connection(&connection_id).await {
            Ok(true) => info!("Connection {} closed with its session", connection_id),
            Ok(false) => debug!("Connection {} was already closed", connection_id),
            Err(e) => warn!("Failed to close connection {}: {}", connection_id, e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_addr_maps_unspecified_to_loopback() {
        assert_eq!(backend_addr("0.0.0.0", 20001), "127.0.0.1:20001");
        assert_eq!(backend_addr("", 20001), "127.0.0.1:20001");
        assert_eq!(backend_addr("::", 20001), "127.0.0.1:20001");
        assert_eq!(backend_addr("localhost", 20001), "127.0.0.1:20001");
        assert_eq!(backend_addr("10.0.0.5", 20001), "10.0.0.5:20001");
        assert_eq!(backend_addr("fe80::1", 20001), "[fe80::1]:20001");
    }

    #[tokio::test]
    async fn test_reply_and_close_delivers_page_despite_unread_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Let the request arrive unread
            tokio::time::sleep(Duration::from_millis(50)).await;
            let page = raw_error_response(ErrorReason::ConnectionLost, "shop");
            reply_and_close(socket, &page).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: shop.localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("X-Portr-Error-Reason: connection-lost"));
    }

    #[tokio::test]
    async fn test_bind_forward_reports_conflicts() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        assert!(bind_forward("127.0.0.1", port).await.is_err());
        drop(taken);
        assert!(bind_forward("127.0.0.1", port).await.is_ok());
    }
}
