//! Client-side tunnel health: public URL pings and the retry budget.

use std::net::SocketAddr;
use std::time::Duration;

use log::debug;

use crate::error::ClientError;
use crate::pages::{ERROR_HEADER, PING_HEADER};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts consecutive failed health checks.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    failures: u32,
}

impl RetryTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) {
        if self.failures > 0 {
            debug!("Health restored after {} failures", self.failures);
        }
        self.failures = 0;
    }

    /// Count one failure; going past `max_retries` is fatal.
    pub fn record_failure(&mut self) -> Result<u32, ClientError> {
        self.failures += 1;
        if self.failures > self.max_retries {
            return Err(ClientError::RetriesExhausted(self.max_retries));
        }
        Ok(self.failures)
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    http: reqwest::Client,
}

impl HealthChecker {
    pub fn new() -> Result<Self, ClientError> {
        Self::build(None)
    }

    /// A checker that sends requests for `host` to the loopback interface,
    /// for `*.localhost` tunnel hosts that system resolvers may not know.
    pub fn with_loopback(host: &str) -> Result<Self, ClientError> {
        Self::build(Some(host))
    }

    fn build(loopback_host: Option<&str>) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .timeout(PING_TIMEOUT)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none());
        if let Some(host) = loopback_host {
            // Port 0 keeps the port from the URL
            builder = builder.resolve(host, SocketAddr::from(([127, 0, 0, 1], 0)));
        }
        Ok(Self { http: builder.build()? })
    }

    /// GET the public URL with the ping marker. Healthy unless the request
    /// fails outright or the server flags the reply as one of its error pages.
    pub async fn check(&self, public_url: &str) -> bool {
        match self.http.get(public_url).header(PING_HEADER, "true").send().await {
            Ok(response) => {
                let flagged = response
                    .headers()
                    .get(ERROR_HEADER)
                    .and_then(|v| v.to_str().ok())
                    == Some("true");
                if flagged {
                    debug!("Health check for {} hit an error page ({})", public_url, response.status());
                }
                !flagged
            }
            Err(e) => {
                debug!("Health check for {} failed: {}", public_url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_retry_tracker_resets_on_success() {
        let mut tracker = RetryTracker::new(2);
        assert_eq!(tracker.record_failure().unwrap(), 1);
        assert_eq!(tracker.record_failure().unwrap(), 2);
        tracker.record_success();
        assert_eq!(tracker.failures(), 0);
        assert_eq!(tracker.record_failure().unwrap(), 1);
    }

    #[test]
    fn test_retry_tracker_gives_up() {
        let mut tracker = RetryTracker::new(1);
        tracker.record_failure().unwrap();
        let err = tracker.record_failure().unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted(1)));
        assert!(err.is_fatal());
    }

    async fn reply_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(response).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_check() {
        let checker = HealthChecker::new().unwrap();

        let url = reply_once(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\npong").await;
        assert!(checker.check(&url).await);

        let url = reply_once(
            b"HTTP/1.1 404 Not Found\r\nX-Portr-Error: true\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(!checker.check(&url).await);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        assert!(!checker.check(&closed).await);
    }

    #[tokio::test]
    async fn test_loopback_checker_reaches_named_host() {
        let url = reply_once(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\npong").await;
        let port = url.rsplit(':').next().unwrap();

        let checker = HealthChecker::with_loopback("shop.portr.invalid").unwrap();
        assert!(checker.check(&format!("http://shop.portr.invalid:{}", port)).await);
    }
}
