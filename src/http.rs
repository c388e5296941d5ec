//! HTTP transport and API client (feature `http`)
//!
//! `HttpTransport` maps the two delivery paths onto reqwest. A beacon becomes a
//! detached request whose outcome nobody observes; the only feedback is whether
//! it was accepted for sending. The keepalive path is an awaited POST.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::delivery::{BeaconTransport, KeepaliveTransport};
use crate::error::{TrackerError, TransportError};
use crate::types::SessionState;

/// Largest body a beacon will accept
pub const BEACON_BODY_LIMIT: usize = 64 * 1024;

/// Default cap on detached beacon requests
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn network_error(err: reqwest::Error) -> TransportError {
    match err.status() {
        Some(status) => TransportError::Status(status.as_u16()),
        None => TransportError::Network(err.to_string()),
    }
}

fn build_client() -> Result<reqwest::Client, TrackerError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| TrackerError::Transport(TransportError::Network(e.to_string())))
}

/// reqwest-backed delivery transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TrackerError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        })
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Detached beacon requests not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn try_reserve(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .is_ok()
    }
}

impl BeaconTransport for HttpTransport {
    fn send_beacon(&self, path: &str, body: &str) -> bool {
        if body.len() > BEACON_BODY_LIMIT {
            warn!(
                "beacon body of {} bytes exceeds {BEACON_BODY_LIMIT}",
                body.len()
            );
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("beacon refused: no async runtime");
            return false;
        };
        if !self.try_reserve() {
            warn!("beacon refused: {} requests in flight", self.max_in_flight);
            return false;
        }

        let request = self
            .client
            .post(join_url(&self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        let in_flight = Arc::clone(&self.in_flight);
        runtime.spawn(async move {
            match request.send().await {
                Ok(resp) => debug!("beacon finished with {}", resp.status()),
                Err(err) => debug!("beacon lost: {err}"),
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }
}

#[async_trait]
impl KeepaliveTransport for HttpTransport {
    async fn post_keepalive(&self, path: &str, body: String) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(join_url(&self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(network_error)?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}

/// Client for the session and article endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    session_path: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TrackerError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into(),
            session_path: "/session".to_string(),
        })
    }

    pub fn with_session_path(mut self, path: impl Into<String>) -> Self {
        self.session_path = path.into();
        self
    }

    pub async fn fetch_session_state(&self) -> Result<SessionState, TrackerError> {
        let resp = self
            .client
            .get(join_url(&self.base_url, &self.session_path))
            .send()
            .await
            .map_err(network_error)?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()).into());
        }
        resp.json::<SessionState>()
            .await
            .map_err(|e| TrackerError::ParseError(format!("session response: {e}")))
    }

    /// Fetch an article document; its content is opaque to the tracker
    pub async fn fetch_article(&self, news_id: &str) -> Result<serde_json::Value, TrackerError> {
        let resp = self
            .client
            .get(join_url(&self.base_url, &format!("/article/{news_id}")))
            .send()
            .await
            .map_err(network_error)?;
        match resp.status().as_u16() {
            404 => Err(TrackerError::MissingArticle),
            code if !resp.status().is_success() => Err(TransportError::Status(code).into()),
            _ => resp
                .json::<serde_json::Value>()
                .await
                .map_err(|e| TrackerError::ParseError(format!("article response: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serves one canned response and hands back the request line it answered
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + body_len {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;

            let request_line = String::from_utf8_lossy(&request)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            let _ = tx.send(request_line);
        });

        (format!("http://{addr}"), rx)
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://localhost:8000/", "/log/behavior"),
            "http://localhost:8000/log/behavior"
        );
        assert_eq!(join_url("http://h", "session"), "http://h/session");
    }

    #[test]
    fn test_beacon_refused_without_runtime() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        assert!(!transport.send_beacon("/log/behavior", "{}"));
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_beacon_refuses_oversized_body() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        let body = "x".repeat(BEACON_BODY_LIMIT + 1);
        assert!(!transport.send_beacon("/log/behavior", &body));
    }

    #[tokio::test]
    async fn test_beacon_respects_in_flight_limit() {
        let transport = HttpTransport::new("http://127.0.0.1:9")
            .unwrap()
            .with_max_in_flight(0);
        assert!(!transport.send_beacon("/log/behavior", "{}"));
    }

    #[tokio::test]
    async fn test_keepalive_accepted() {
        let (base, request) = serve_once("200 OK", "{}").await;
        let transport = HttpTransport::new(base).unwrap();

        let result = transport.post_keepalive("/log/behavior", "{}".to_string()).await;
        assert_eq!(result, Ok(()));
        assert_eq!(request.await.unwrap(), "POST /log/behavior HTTP/1.1");
    }

    #[tokio::test]
    async fn test_keepalive_non_success_is_status_error() {
        let (base, _request) = serve_once("503 Service Unavailable", "").await;
        let transport = HttpTransport::new(base).unwrap();

        let result = transport.post_keepalive("/log/behavior", "{}".to_string()).await;
        assert_eq!(result, Err(TransportError::Status(503)));
    }

    #[tokio::test]
    async fn test_keepalive_connection_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(format!("http://{addr}")).unwrap();
        let result = transport.post_keepalive("/log/behavior", "{}".to_string()).await;
        assert!(matches!(result, Err(TransportError::Network(_))));
    }

    #[tokio::test]
    async fn test_fetch_session_state() {
        let (base, request) = serve_once(
            "200 OK",
            r#"{"isLoggedIn":true,"hasNPTI":true,"user_id":"u1"}"#,
        )
        .await;
        let client = ApiClient::new(base).unwrap();

        let state = client.fetch_session_state().await.unwrap();
        assert!(state.is_logged_in);
        assert!(state.has_npti);
        assert_eq!(state.user_id.as_deref(), Some("u1"));
        assert_eq!(request.await.unwrap(), "GET /session HTTP/1.1");
    }

    #[tokio::test]
    async fn test_fetch_missing_article() {
        let (base, request) = serve_once("404 Not Found", "").await;
        let client = ApiClient::new(base).unwrap();

        let result = client.fetch_article("news-42").await;
        assert!(matches!(result, Err(TrackerError::MissingArticle)));
        assert_eq!(request.await.unwrap(), "GET /article/news-42 HTTP/1.1");
    }
}
