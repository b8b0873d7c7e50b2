//! Bridges a forwarded channel to the local service.
//!
//! TCP tunnels copy bytes. HTTP tunnels serve exactly one request per
//! channel with hyper, relay it to the local server with bodies buffered,
//! and record the exchange. A `101 Switching Protocols` reply turns the
//! channel into a raw byte pipe.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::config::TunnelSpec;
use crate::pages::{
    local_server_not_online_page, ErrorReason, ERROR_HEADER, ERROR_REASON_HEADER, PING_HEADER,
};
use crate::request_log::{headers_to_map, Body, RequestLogSink, RequestRecord};

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

async fn dial_local(addr: &str) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connecting to {} timed out", addr),
        )),
    }
}

/// Copy bytes between `stream` and the local service. A failed local dial
/// just drops `stream`, which closes the channel.
pub async fn bridge_tcp<S>(mut stream: S, local_addr: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut local = match dial_local(local_addr).await {
        Ok(local) => local,
        Err(e) => {
            warn!("Local service {} unreachable: {}", local_addr, e);
            return;
        }
    };

    match copy_bidirectional(&mut stream, &mut local).await {
        Ok((up, down)) => debug!("TCP bridge to {} done ({} up, {} down)", local_addr, up, down),
        Err(e) => debug!("TCP bridge to {} ended: {}", local_addr, e),
    }
}

/// Per-tunnel HTTP bridge, shared by every channel of that tunnel.
pub struct HttpBridge {
    spec: TunnelSpec,
    sink: Option<Arc<dyn RequestLogSink>>,
}

impl HttpBridge {
    pub fn new(spec: TunnelSpec, sink: Option<Arc<dyn RequestLogSink>>) -> Self {
        Self { spec, sink }
    }

    /// Serve one request arriving on `stream`.
    pub async fn serve<S>(self: Arc<Self>, stream: S) -> Result<(), hyper::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let bridge = self.clone();
        let service = service_fn(move |req| {
            let bridge = bridge.clone();
            async move { Ok::<_, Infallible>(bridge.handle(req).await) }
        });

        hyper::server::conn::http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
    }

    async fn handle(&self, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
        if is_ping(&req) {
            return text_response(StatusCode::OK, "pong");
        }

        let local_addr = self.spec.local_addr();
        let local = match dial_local(&local_addr).await {
            Ok(local) => local,
            Err(e) => {
                warn!("Local server {} is not online: {}", local_addr, e);
                return local_down_response(&local_addr);
            }
        };

        let inbound_upgrade = hyper::upgrade::on(&mut req);
        let (mut parts, body) = req.into_parts();
        let request_body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("Failed to read request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        // Bodies are buffered; let hyper frame them with a content-length.
        parts.headers.remove(TRANSFER_ENCODING);
        let mut record = self.start_record(&parts, &request_body);

        let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(local)).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("HTTP handshake with {} failed: {}", local_addr, e);
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Local connection closed: {}", e);
            }
        });

        let outbound = Request::from_parts(parts, Full::new(request_body));
        let mut response = match sender.send_request(outbound).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request to {} failed: {}", local_addr, e);
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let outbound_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                match tokio::try_join!(inbound_upgrade, outbound_upgrade) {
                    Ok((inbound, outbound)) => {
                        let mut inbound = TokioIo::new(inbound);
                        let mut outbound = TokioIo::new(outbound);
                        if let Err(e) = copy_bidirectional(&mut inbound, &mut outbound).await {
                            debug!("Upgraded stream ended: {}", e);
                        }
                    }
                    Err(e) => warn!("Upgrade failed: {}", e),
                }
            });

            record.response_status_code = response.status().as_u16();
            record.response_headers = headers_to_map(response.headers());
            self.submit(record);

            let (parts, _) = response.into_parts();
            return Response::from_parts(parts, Full::new(Bytes::new()));
        }

        let (mut parts, body) = response.into_parts();
        let response_body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read response from {}: {}", local_addr, e);
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };
        parts.headers.remove(TRANSFER_ENCODING);
        parts.headers.remove(CONTENT_LENGTH);

        record.response_status_code = parts.status.as_u16();
        record.response_headers = headers_to_map(&parts.headers);
        record.response_body = Body::from_bytes(&response_body);
        info!(
            "{} {} -> {}",
            record.method, record.url, record.response_status_code
        );
        self.submit(record);

        Response::from_parts(parts, Full::new(response_body))
    }

    fn start_record(&self, parts: &hyper::http::request::Parts, body: &Bytes) -> RequestRecord {
        RequestRecord {
            id: uuid::Uuid::now_v7().simple().to_string(),
            subdomain: self.spec.subdomain.clone().unwrap_or_default(),
            local_port: self.spec.port,
            host: parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            url: parts.uri.to_string(),
            method: parts.method.to_string(),
            headers: headers_to_map(&parts.headers),
            body: Body::from_bytes(body),
            response_headers: Default::default(),
            response_body: Body::Utf8(String::new()),
            response_status_code: 0,
            logged_at: Utc::now(),
            is_replayed: false,
            parent_id: None,
        }
    }

    /// Hand the record to the sink without holding up the response.
    fn submit(&self, record: RequestRecord) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        tokio::spawn(async move {
            let id = record.id.clone();
            if let Err(e) = sink.record(record).await {
                warn!("Failed to log request {}: {}", id, e);
            }
        });
    }
}

fn is_ping<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(PING_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn local_down_response(endpoint: &str) -> Response<Full<Bytes>> {
    let reason = ErrorReason::LocalServerNotOnline;
    let mut response = Response::new(Full::new(Bytes::from(local_server_not_online_page(endpoint))));
    *response.status_mut() =
        StatusCode::from_u16(reason.status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(ERROR_HEADER, HeaderValue::from_static("true"));
    headers.insert(ERROR_REASON_HEADER, HeaderValue::from_static(reason.as_str()));
    response
}
