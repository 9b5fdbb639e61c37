//! In-process backend used by `courier simulate`.
//!
//! Speaks the JSON shapes of `courier_sync::transcoders`, injects latency
//! and faults, and publishes push events through a loopback connector.

use async_trait::async_trait;
use courier_transport::{HttpRequest, HttpResponse, LoopbackPushConnector, LoopbackServer, PushFrame};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Fault and latency settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Probability of answering 503.
    pub failure_rate: f64,
    /// Probability of answering 429.
    pub rate_limit_rate: f64,
    /// Mean latency per exchange.
    pub latency: Duration,
    /// Listing page size ceiling.
    pub page_size: usize,
}

impl BackendConfig {
    /// Creates a configuration without faults.
    pub fn new() -> Self {
        Self {
            failure_rate: 0.0,
            rate_limit_rate: 0.0,
            latency: Duration::ZERO,
            page_size: 100,
        }
    }

    /// Sets the 5xx rate; a quarter of it is added as 429s.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self.rate_limit_rate = (rate / 4.0).clamp(0.0, 1.0);
        self
    }

    /// Sets the mean latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What the backend saw.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    /// Exchanges handled, faults included.
    pub requests: u64,
    /// 503s injected.
    pub injected_failures: u64,
    /// 429s injected.
    pub injected_rate_limits: u64,
    /// Access tokens issued.
    pub tokens_issued: u64,
    /// Conversations created.
    pub conversations: usize,
    /// Messages stored.
    pub messages: usize,
    /// Push frames published.
    pub push_frames: u64,
}

#[derive(Default)]
struct World {
    next_id: u64,
    client: Option<String>,
    conversations: BTreeMap<String, Value>,
    messages: BTreeMap<String, Value>,
    stats: BackendStats,
}

impl World {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:05}", self.next_id)
    }
}

/// A simulated messaging backend. Clones share state.
#[derive(Clone)]
pub struct SimulatedBackend {
    config: BackendConfig,
    world: Arc<Mutex<World>>,
    push: Arc<LoopbackPushConnector>,
}

enum Fault {
    Unavailable,
    RateLimited,
}

impl SimulatedBackend {
    /// Creates a backend publishing push events to `push`.
    pub fn new(config: BackendConfig, push: Arc<LoopbackPushConnector>) -> Self {
        Self {
            config,
            world: Arc::new(Mutex::new(World::default())),
            push,
        }
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> BackendStats {
        let world = self.world.lock();
        let mut stats = world.stats.clone();
        stats.conversations = world.conversations.len();
        stats.messages = world.messages.len();
        stats
    }

    fn draw(&self, path: &str) -> (Duration, Option<Fault>) {
        let mut rng = rand::thread_rng();
        let latency = if self.config.latency.is_zero() {
            Duration::ZERO
        } else {
            let mean = self.config.latency.as_millis() as u64;
            Duration::from_millis(rng.gen_range(0..=mean * 2))
        };
        // Token refreshes are never faulted so a run cannot lock itself out.
        if path == "/access" {
            return (latency, None);
        }
        let roll: f64 = rng.gen();
        let fault = if roll < self.config.failure_rate {
            Some(Fault::Unavailable)
        } else if roll < self.config.failure_rate + self.config.rate_limit_rate {
            Some(Fault::RateLimited)
        } else {
            None
        };
        (latency, fault)
    }

    fn publish(&self, world: &mut World, events: Vec<Value>) {
        world.stats.push_frames += 1;
        self.push.publish(PushFrame::new(events));
    }

    fn route(&self, method: &str, path: &str, query: &str, body: Option<Value>) -> HttpResponse {
        let mut world = self.world.lock();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            ("POST", ["access"]) => {
                world.stats.tokens_issued += 1;
                let token = format!("token-{}", world.stats.tokens_issued);
                HttpResponse::json(
                    200,
                    &json!({"access_token": token, "token_type": "Bearer", "expires_in": 900}),
                )
            }
            ("POST", ["clients"]) => {
                let id = world.allocate("client-");
                world.client = Some(id.clone());
                HttpResponse::json(201, &json!({"id": id}))
            }
            ("PUT", ["clients", id]) => {
                if world.client.as_deref() == Some(*id) {
                    HttpResponse::new(200, "")
                } else {
                    HttpResponse::new(404, "")
                }
            }
            ("DELETE", ["clients", id]) if world.client.as_deref() == Some(*id) => {
                world.client = None;
                HttpResponse::new(204, "")
            }
            ("PUT", ["self"]) => HttpResponse::new(200, ""),
            ("GET", ["connections"]) => {
                HttpResponse::json(200, &json!({"connections": [], "has_more": false}))
            }
            ("GET", ["conversations"]) => {
                let start = query_param(query, "start");
                let page: Vec<Value> = world
                    .conversations
                    .iter()
                    .filter(|(id, _)| start.map_or(true, |s| id.as_str() > s))
                    .take(self.config.page_size + 1)
                    .map(|(_, c)| c.clone())
                    .collect();
                let has_more = page.len() > self.config.page_size;
                let page: Vec<Value> = page.into_iter().take(self.config.page_size).collect();
                HttpResponse::json(200, &json!({"conversations": page, "has_more": has_more}))
            }
            ("POST", ["conversations"]) => {
                let id = world.allocate("c");
                let member = world.allocate("u");
                let mut conversation = object_or_empty(body);
                conversation["id"] = json!(id);
                conversation["members"] = json!([member]);
                world.conversations.insert(id.clone(), conversation.clone());
                self.publish(
                    &mut world,
                    vec![json!({
                        "type": "conversation.member-join",
                        "conversation": id,
                        "data": {"user_ids": [member]},
                    })],
                );
                HttpResponse::json(201, &conversation)
            }
            ("GET", ["conversations", id]) => match world.conversations.get(*id) {
                Some(conversation) => HttpResponse::json(200, conversation),
                None => HttpResponse::new(404, ""),
            },
            ("PUT", ["conversations", id]) => match world.conversations.get_mut(*id) {
                Some(conversation) => {
                    if let (Some(target), Some(Value::Object(fields))) =
                        (conversation.as_object_mut(), body)
                    {
                        target.extend(fields);
                    }
                    HttpResponse::json(200, conversation)
                }
                None => HttpResponse::new(404, ""),
            },
            ("DELETE", ["conversations", id]) => match world.conversations.remove(*id) {
                Some(_) => HttpResponse::new(204, ""),
                None => HttpResponse::new(404, ""),
            },
            ("POST", ["conversations", conversation, "messages"]) => {
                if !world.conversations.contains_key(*conversation) {
                    return HttpResponse::new(404, "");
                }
                let conversation = conversation.to_string();
                let id = world.allocate("m");
                let mut message = object_or_empty(body);
                message["id"] = json!(id);
                world.messages.insert(id.clone(), message.clone());
                // Echoed back like any other member would see it.
                self.publish(
                    &mut world,
                    vec![json!({
                        "type": "conversation.message-add",
                        "conversation": conversation,
                        "data": message,
                    })],
                );
                HttpResponse::json(201, &json!({"id": id}))
            }
            ("PUT", ["conversations", _, "messages", _]) => HttpResponse::new(200, ""),
            ("DELETE", ["conversations", _, "messages", id]) => {
                world.messages.remove(*id);
                HttpResponse::new(204, "")
            }
            ("GET", ["users", id]) => {
                HttpResponse::json(200, &json!({"id": id, "name": format!("User {id}")}))
            }
            _ => HttpResponse::new(404, ""),
        }
    }
}

#[async_trait]
impl LoopbackServer for SimulatedBackend {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let (path, query) = match request.path().split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (request.path().to_string(), String::new()),
        };
        let (latency, fault) = self.draw(&path);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.world.lock().stats.requests += 1;
        match fault {
            Some(Fault::Unavailable) => {
                self.world.lock().stats.injected_failures += 1;
                trace!(%path, "injecting 503");
                return HttpResponse::new(503, "");
            }
            Some(Fault::RateLimited) => {
                self.world.lock().stats.injected_rate_limits += 1;
                trace!(%path, "injecting 429");
                return HttpResponse::new(429, "");
            }
            None => {}
        }

        let body = request
            .body
            .as_ref()
            .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok());
        self.route(request.method, &path, &query, body)
    }
}

fn object_or_empty(body: Option<Value>) -> Value {
    match body {
        Some(Value::Object(fields)) => Value::Object(fields),
        _ => json!({}),
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_transport::Priority;

    fn request(method: &'static str, path: &str, body: Option<Value>) -> HttpRequest {
        HttpRequest {
            method,
            url: format!("https://backend.test{path}"),
            headers: Vec::new(),
            body: body.map(|b| b.to_string().into()),
            priority: Priority::Normal,
        }
    }

    fn body(response: &HttpResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn created_conversations_are_listed_in_pages() {
        let mut config = BackendConfig::new();
        config.page_size = 2;
        let backend = SimulatedBackend::new(config, Arc::new(LoopbackPushConnector::new()));
        for _ in 0..3 {
            let created = backend.handle(request("POST", "/conversations", None)).await;
            assert_eq!(created.status, 201);
        }

        let first = body(&backend.handle(request("GET", "/conversations?size=2", None)).await);
        assert_eq!(first["conversations"].as_array().unwrap().len(), 2);
        assert_eq!(first["has_more"], json!(true));

        let last_id = first["conversations"][1]["id"].as_str().unwrap().to_string();
        let path = format!("/conversations?size=2&start={last_id}");
        let second = body(&backend.handle(request("GET", &path, None)).await);
        assert_eq!(second["conversations"].as_array().unwrap().len(), 1);
        assert_eq!(second["has_more"], json!(false));
    }

    #[tokio::test]
    async fn message_upload_is_echoed_as_push_event() {
        let push = Arc::new(LoopbackPushConnector::new());
        let backend = SimulatedBackend::new(BackendConfig::new(), push);
        let created = body(&backend.handle(request("POST", "/conversations", None)).await);
        let path = format!("/conversations/{}/messages", created["id"].as_str().unwrap());

        let response = backend
            .handle(request("POST", &path, Some(json!({"text": "hi", "nonce": "n1"}))))
            .await;
        assert_eq!(response.status, 201);

        let stats = backend.stats();
        assert_eq!(stats.messages, 1);
        // One member-join and one message echo.
        assert_eq!(stats.push_frames, 2);
    }

    #[tokio::test]
    async fn certain_failure_rate_faults_everything_but_access() {
        let backend = SimulatedBackend::new(
            BackendConfig::new().with_failure_rate(1.0),
            Arc::new(LoopbackPushConnector::new()),
        );
        let faulted = backend.handle(request("GET", "/users/u1", None)).await;
        assert_eq!(faulted.status, 503);
        let token = backend.handle(request("POST", "/access", None)).await;
        assert_eq!(token.status, 200);
        assert_eq!(backend.stats().injected_failures, 1);
    }

    #[test]
    fn query_parameters_are_found_by_name() {
        assert_eq!(query_param("size=100&start=c7", "start"), Some("c7"));
        assert_eq!(query_param("size=100", "start"), None);
    }
}
