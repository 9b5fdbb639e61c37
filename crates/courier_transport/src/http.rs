//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so any library (reqwest,
//! hyper, a platform client) can back the scheduler.

use crate::error::TransportError;
use crate::request::{Payload, Priority, Request};
use crate::response::Response;
use crate::token::AccessToken;
use crate::transport::{BackgroundTicket, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// A request as handed to an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method name.
    pub method: &'static str,
    /// Absolute URL.
    pub url: String,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Option<Bytes>,
    /// Priority hint.
    pub priority: Priority,
}

impl HttpRequest {
    /// Returns the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the path part of the URL.
    pub fn path(&self) -> &str {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        without_scheme
            .find('/')
            .map(|i| &without_scheme[i..])
            .unwrap_or("/")
    }
}

/// A response as returned by an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a response with no headers.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Creates a JSON response.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP exchange.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Performs one exchange. `Err` means no HTTP response was received.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Transport that speaks HTTP through an [`HttpClient`].
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the backend (e.g., "https://api.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Set when the last exchange failed below HTTP.
    degraded: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            degraded: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the last exchange failed below HTTP.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
        self.degraded.store(true, Ordering::SeqCst);
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
        self.degraded.store(false, Ordering::SeqCst);
    }

    fn build(&self, request: &Request, token: Option<&AccessToken>) -> HttpRequest {
        let mut headers = Vec::new();
        if let Some(token) = token {
            headers.push(("Authorization".to_string(), token.authorization()));
        }
        if let Some(body) = request.body() {
            headers.push(("Content-Type".to_string(), body.content_type().to_string()));
        }
        headers.push(("Accept".to_string(), "application/json".to_string()));

        HttpRequest {
            method: request.method().as_str(),
            url: format!("{}{}", self.base_url, request.path()),
            headers,
            body: request.body().map(Payload::to_bytes),
            priority: request.priority(),
        }
    }
}

fn decode_body(response: &HttpResponse) -> Option<Payload> {
    if response.body.is_empty() {
        return None;
    }
    let content_type = response
        .header("Content-Type")
        .unwrap_or("application/octet-stream");
    if content_type.starts_with("application/json") {
        if let Ok(value) = serde_json::from_slice(&response.body) {
            return Some(Payload::Json(value));
        }
    }
    Some(Payload::Binary {
        content_type: content_type.to_string(),
        data: response.body.clone(),
    })
}

fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("Retry-After")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn send(
        &self,
        request: &Request,
        token: Option<&AccessToken>,
        background: Option<&BackgroundTicket>,
    ) -> Response {
        if !self.client.is_healthy() {
            return Response::failed(request.id(), TransportError::network("HTTP client unhealthy"));
        }
        if let Some(ticket) = background {
            // Plain HTTP clients cannot hand exchanges to the OS; the
            // recovery log still covers the request.
            trace!(task_id = %ticket.task_id, "background ticket ignored by HTTP transport");
        }

        let http_request = self.build(request, token);
        trace!(method = http_request.method, url = %http_request.url, "sending");
        match self.client.execute(http_request).await {
            Ok(http_response) => {
                self.clear_error();
                Response::from_http(
                    request.id(),
                    http_response.status,
                    decode_body(&http_response),
                    retry_after(&http_response),
                )
            }
            Err(e) => {
                debug!(path = request.path(), error = %e, "HTTP exchange failed");
                self.set_error(&e);
                Response::failed(request.id(), TransportError::network(e))
            }
        }
    }
}

/// Handles requests routed through a [`LoopbackClient`].
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles one request.
    async fn handle(&self, request: HttpRequest) -> HttpResponse;
}

/// An HTTP client that routes requests directly to an in-process server.
///
/// Useful for testing and simulation without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        Ok(self.server.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use serde_json::json;

    struct TestClient {
        response: RwLock<Option<HttpResponse>>,
        seen: RwLock<Vec<HttpRequest>>,
        healthy: AtomicBool,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: RwLock::new(None),
                seen: RwLock::new(Vec::new()),
                healthy: AtomicBool::new(true),
            }
        }

        fn set_response(&self, resp: HttpResponse) {
            *self.response.write() = Some(resp);
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.seen.write().push(request);
            self.response
                .read()
                .clone()
                .ok_or_else(|| "connection refused".to_string())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn request_path_from_url() {
        let request = HttpRequest {
            method: "GET",
            url: "https://api.example.com/conversations?size=10".into(),
            headers: Vec::new(),
            body: None,
            priority: Priority::Normal,
        };
        assert_eq!(request.path(), "/conversations?size=10");
    }

    #[tokio::test]
    async fn attaches_token_and_body() {
        let client = TestClient::new();
        client.set_response(HttpResponse::json(201, &json!({"id": "m1"})));
        let transport = HttpTransport::new("https://api.example.com/", client);

        let request = Request::builder(Method::Post, "/conversations/c1/messages")
            .json(json!({"text": "hi"}))
            .build();
        let token = AccessToken::bearer("abc", Duration::from_secs(60));
        let response = transport.send(&request, Some(&token), None).await;

        assert_eq!(response.status(), Some(201));
        assert_eq!(response.json().unwrap()["id"], "m1");

        let seen = transport.client().seen.read();
        assert_eq!(seen[0].url, "https://api.example.com/conversations/c1/messages");
        assert_eq!(seen[0].header("authorization"), Some("Bearer abc"));
        assert_eq!(seen[0].header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn retry_after_header_is_parsed() {
        let client = TestClient::new();
        client.set_response(HttpResponse::new(429, "").with_header("Retry-After", "12"));
        let transport = HttpTransport::new("https://api.example.com", client);

        let response = transport.send(&Request::get("/self"), None, None).await;
        assert!(response.is_rate_limited());
        assert_eq!(response.retry_after(), Some(Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn client_error_is_network_failure() {
        let transport = HttpTransport::new("https://api.example.com", TestClient::new());

        let response = transport.send(&Request::get("/self"), None, None).await;
        assert!(response.error().unwrap().is_retryable());
        assert!(transport.is_degraded());
        assert_eq!(transport.last_error().as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn unhealthy_client_fails_fast() {
        let client = TestClient::new();
        client.healthy.store(false, Ordering::SeqCst);
        let transport = HttpTransport::new("https://api.example.com", client);

        let response = transport.send(&Request::get("/self"), None, None).await;
        assert!(response.status().is_none());
        assert!(transport.client().seen.read().is_empty());
    }
}
