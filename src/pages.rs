//! Data-plane markers and the error pages served in place of a tunnel.

/// Set on health-check requests so the client answers without touching the local server.
pub const PING_HEADER: &str = "X-Portr-Ping-Request";
pub const ERROR_HEADER: &str = "X-Portr-Error";
pub const ERROR_REASON_HEADER: &str = "X-Portr-Error-Reason";

/// Why a response came from the tunnel rather than the user's service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    UnregisteredSubdomain,
    ConnectionLost,
    LocalServerNotOnline,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::UnregisteredSubdomain => "unregistered-subdomain",
            ErrorReason::ConnectionLost => "connection-lost",
            ErrorReason::LocalServerNotOnline => "local-server-not-online",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ErrorReason::UnregisteredSubdomain => 404,
            ErrorReason::ConnectionLost | ErrorReason::LocalServerNotOnline => 503,
        }
    }

    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "unregistered-subdomain" => Some(ErrorReason::UnregisteredSubdomain),
            "connection-lost" => Some(ErrorReason::ConnectionLost),
            "local-server-not-online" => Some(ErrorReason::LocalServerNotOnline),
            _ => None,
        }
    }
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html lang=\"en\">\n\
         <head><meta charset=\"utf-8\"><title>{title}</title>\n\
         <style>body{{font-family:system-ui,sans-serif;max-width:40rem;margin:4rem auto;color:#222}}\
         code{{background:#f3f3f3;padding:0 .25rem}}</style></head>\n\
         <body><h1>{title}</h1><p>{message}</p><p><small>portr</small></p></body>\n\
         </html>\n"
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn unregistered_subdomain_page(subdomain: &str) -> String {
    page(
        "Unregistered subdomain",
        &format!(
            "There is no tunnel running for <code>{}</code>. Start one with <code>portr http &lt;port&gt; --subdomain {}</code>.",
            escape_html(subdomain),
            escape_html(subdomain)
        ),
    )
}

pub fn connection_lost_page() -> String {
    page(
        "Connection lost",
        "The tunnel for this address dropped its connection. It may come back shortly once the client reconnects.",
    )
}

pub fn local_server_not_online_page(endpoint: &str) -> String {
    page(
        "Local server not online",
        &format!(
            "The tunnel is up but nothing is listening on <code>{}</code>. Start your local server and retry.",
            escape_html(endpoint)
        ),
    )
}

/// Body for an error reason.
pub fn error_page(reason: ErrorReason, subject: &str) -> String {
    match reason {
        ErrorReason::UnregisteredSubdomain => unregistered_subdomain_page(subject),
        ErrorReason::ConnectionLost => connection_lost_page(),
        ErrorReason::LocalServerNotOnline => local_server_not_online_page(subject),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Serialize a complete HTTP/1.1 response, written straight onto a socket.
pub fn raw_response(status: u16, content_type: &str, extra_headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        status_text(status),
        content_type,
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Raw error response carrying the tunnel error markers.
pub fn raw_error_response(reason: ErrorReason, subject: &str) -> Vec<u8> {
    raw_response(
        reason.status(),
        "text/html; charset=utf-8",
        &[(ERROR_HEADER, "true"), (ERROR_REASON_HEADER, reason.as_str())],
        &error_page(reason, subject),
    )
}
