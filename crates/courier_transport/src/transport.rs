//! Transport abstraction.
//!
//! A transport performs exactly one network exchange per call. It does not
//! queue, retry, or authenticate on its own; the scheduler does that.

use crate::error::TransportError;
use crate::request::{Method, Payload, Priority, Request, RequestId};
use crate::response::Response;
use crate::token::AccessToken;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Identifies a request sent through a background-capable session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackgroundTicket {
    /// Background session identifier.
    pub session: String,
    /// Task identifier within the session.
    pub task_id: String,
}

/// State of a background task as reported by the transport.
#[derive(Debug, Clone)]
pub enum BackgroundTaskState {
    /// Still running.
    Running,
    /// Finished while the process was away.
    Completed(Response),
}

/// A task owned by a background session.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    /// Task identifier within the session.
    pub task_id: String,
    /// Current state.
    pub state: BackgroundTaskState,
}

/// Performs network exchanges.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request`, attaching `token` if given.
    ///
    /// `background` is set when the exchange must outlive the process.
    async fn send(
        &self,
        request: &Request,
        token: Option<&AccessToken>,
        background: Option<&BackgroundTicket>,
    ) -> Response;

    /// Lists the tasks a background session still knows about.
    async fn background_tasks(&self, _session: &str) -> Vec<BackgroundTask> {
        Vec::new()
    }

    /// Waits for a running background task. `None` means the task is gone.
    async fn wait_for_background_task(&self, _session: &str, _task_id: &str) -> Option<Response> {
        None
    }
}

/// A scripted reply for [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockReply {
    status: u16,
    body: Option<serde_json::Value>,
    retry_after: Option<Duration>,
    delay: Duration,
    error: Option<TransportError>,
}

impl MockReply {
    /// Replies with `status` and no body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: None,
            retry_after: None,
            delay: Duration::ZERO,
            error: None,
        }
    }

    /// Replies 200 with a JSON body.
    pub fn ok(body: serde_json::Value) -> Self {
        Self::status(200).json(body)
    }

    /// Fails without an HTTP status.
    pub fn error(error: TransportError) -> Self {
        Self {
            error: Some(error),
            ..Self::status(0)
        }
    }

    /// Sets a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets a `Retry-After` delay.
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Delays the reply.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn into_response(self, request_id: RequestId) -> Response {
        match self.error {
            Some(err) => Response::failed(request_id, err),
            None => Response::from_http(
                request_id,
                self.status,
                self.body.map(Payload::Json),
                self.retry_after,
            ),
        }
    }
}

/// A request as recorded by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct SentRequest {
    /// Request id.
    pub id: RequestId,
    /// Method.
    pub method: Method,
    /// Path.
    pub path: String,
    /// Body, if any.
    pub body: Option<Payload>,
    /// Priority hint.
    pub priority: Priority,
    /// Token value attached, if any.
    pub token: Option<String>,
    /// Background ticket, if any.
    pub background: Option<BackgroundTicket>,
    /// Caller label.
    pub tag: Option<String>,
}

type ReplyHandler = Box<dyn Fn(&Request, Option<&AccessToken>) -> Option<MockReply> + Send + Sync>;

struct MockState {
    scripted: Vec<(String, VecDeque<MockReply>)>,
    default_reply: MockReply,
    handler: Option<ReplyHandler>,
    sent: Vec<SentRequest>,
    background: HashMap<String, Vec<BackgroundTask>>,
}

/// A scriptable transport for tests.
///
/// Replies are looked up by path prefix, consumed in order, then fall back to
/// a handler and finally to the default reply (200, no body).
pub struct MockTransport {
    state: Mutex<MockState>,
    gate: watch::Sender<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    background_changed: Notify,
}

impl MockTransport {
    /// Creates a mock that answers 200 to everything.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(MockState {
                scripted: Vec::new(),
                default_reply: MockReply::status(200),
                handler: None,
                sent: Vec::new(),
                background: HashMap::new(),
            }),
            gate,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            background_changed: Notify::new(),
        }
    }

    /// Queues a one-shot reply for paths starting with `prefix`.
    pub fn push_reply(&self, prefix: impl Into<String>, reply: MockReply) {
        let prefix = prefix.into();
        let mut state = self.state.lock();
        match state.scripted.iter_mut().find(|(p, _)| *p == prefix) {
            Some((_, queue)) => queue.push_back(reply),
            None => state.scripted.push((prefix, VecDeque::from([reply]))),
        }
    }

    /// Sets the reply used when nothing else matches.
    pub fn set_default_reply(&self, reply: MockReply) {
        self.state.lock().default_reply = reply;
    }

    /// Installs a handler consulted after scripted replies.
    pub fn respond_with<F>(&self, handler: F)
    where
        F: Fn(&Request, Option<&AccessToken>) -> Option<MockReply> + Send + Sync + 'static,
    {
        self.state.lock().handler = Some(Box::new(handler));
    }

    /// Holds every exchange until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    /// Releases held exchanges.
    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Returns all requests sent so far.
    pub fn sent(&self) -> Vec<SentRequest> {
        self.state.lock().sent.clone()
    }

    /// Returns the paths of all requests sent so far.
    pub fn sent_paths(&self) -> Vec<String> {
        self.state.lock().sent.iter().map(|r| r.path.clone()).collect()
    }

    /// Returns the number of requests sent so far.
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Returns the number of exchanges in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the highest number of simultaneous exchanges observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Registers a task in a background session.
    pub fn add_background_task(&self, session: impl Into<String>, task: BackgroundTask) {
        self.state
            .lock()
            .background
            .entry(session.into())
            .or_default()
            .push(task);
        self.background_changed.notify_waiters();
    }

    /// Marks a running background task as completed.
    pub fn complete_background_task(&self, session: &str, task_id: &str, response: Response) {
        {
            let mut state = self.state.lock();
            if let Some(task) = state
                .background
                .get_mut(session)
                .and_then(|tasks| tasks.iter_mut().find(|t| t.task_id == task_id))
            {
                task.state = BackgroundTaskState::Completed(response);
            }
        }
        self.background_changed.notify_waiters();
    }

    fn reply_for(&self, request: &Request, token: Option<&AccessToken>) -> MockReply {
        let mut state = self.state.lock();
        let scripted = state
            .scripted
            .iter_mut()
            .filter(|(prefix, queue)| request.path().starts_with(prefix.as_str()) && !queue.is_empty())
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(_, queue)| queue.pop_front());
        if let Some(reply) = scripted {
            return reply;
        }
        if let Some(reply) = state.handler.as_ref().and_then(|h| h(request, token)) {
            return reply;
        }
        state.default_reply.clone()
    }

    async fn wait_for_gate(&self) {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &Request,
        token: Option<&AccessToken>,
        background: Option<&BackgroundTicket>,
    ) -> Response {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        self.state.lock().sent.push(SentRequest {
            id: request.id(),
            method: request.method(),
            path: request.path().to_string(),
            body: request.body().cloned(),
            priority: request.priority(),
            token: token.map(|t| t.value().to_string()),
            background: background.cloned(),
            tag: request.tag().map(str::to_string),
        });

        let reply = self.reply_for(request, token);
        self.wait_for_gate().await;
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.into_response(request.id())
    }

    async fn background_tasks(&self, session: &str) -> Vec<BackgroundTask> {
        self.state
            .lock()
            .background
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    async fn wait_for_background_task(&self, session: &str, task_id: &str) -> Option<Response> {
        loop {
            let notified = self.background_changed.notified();
            {
                let state = self.state.lock();
                let task = state
                    .background
                    .get(session)
                    .and_then(|tasks| tasks.iter().find(|t| t.task_id == task_id))?;
                if let BackgroundTaskState::Completed(response) = &task.state {
                    return Some(response.clone());
                }
            }
            notified.await;
        }
    }
}

/// Shares one transport between owners.
#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(
        &self,
        request: &Request,
        token: Option<&AccessToken>,
        background: Option<&BackgroundTicket>,
    ) -> Response {
        (**self).send(request, token, background).await
    }

    async fn background_tasks(&self, session: &str) -> Vec<BackgroundTask> {
        (**self).background_tasks(session).await
    }

    async fn wait_for_background_task(&self, session: &str, task_id: &str) -> Option<Response> {
        (**self).wait_for_background_task(session, task_id).await
    }
}
