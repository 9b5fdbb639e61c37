//! Request descriptors and their completion handles.

use crate::error::TransportError;
use crate::response::Response;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// Unique identifier of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a new random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP-style method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// HEAD
    Head,
}

impl Method {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a request or response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured JSON body.
    Json(serde_json::Value),
    /// Opaque binary body.
    Binary {
        /// MIME type of the body.
        content_type: String,
        /// Body bytes.
        data: Bytes,
    },
}

impl Payload {
    /// Returns the JSON value, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary { .. } => None,
        }
    }

    /// Returns the MIME type of the payload.
    pub fn content_type(&self) -> &str {
        match self {
            Payload::Json(_) => "application/json",
            Payload::Binary { content_type, .. } => content_type,
        }
    }

    /// Encodes the payload to bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Json(value) => Bytes::from(value.to_string()),
            Payload::Binary { data, .. } => data.clone(),
        }
    }
}

/// Whether and how a request needs an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenPolicy {
    /// Sent without credentials.
    None,
    /// Needs a token; a 401 resolves the request as failed.
    Required,
    /// Needs a token; a 401 refreshes the token and resends once.
    RequiredWithRetry,
}

impl TokenPolicy {
    /// Returns true if the request needs a token.
    pub fn needs_token(&self) -> bool {
        !matches!(self, TokenPolicy::None)
    }
}

/// Priority hint passed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Bulk work.
    Low,
    /// Default.
    Normal,
    /// Session-critical work.
    High,
}

/// Shared cancellation and consumption state of one request.
#[derive(Clone, Default)]
pub(crate) struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    consumed: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub(crate) fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        first
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Marks the request as consumed. Returns false if it already was.
    pub(crate) fn consume(&self) -> bool {
        !self.inner.consumed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.inner.consumed.load(Ordering::SeqCst)
    }

    /// Resolves once the request is cancelled.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Delivery side of a request's completion.
#[derive(Clone)]
pub(crate) struct Completion {
    flag: CancelFlag,
    sender: Arc<Mutex<Option<oneshot::Sender<Response>>>>,
}

impl Completion {
    fn new() -> Self {
        Self {
            flag: CancelFlag::default(),
            sender: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn flag(&self) -> &CancelFlag {
        &self.flag
    }

    /// Delivers the response at most once. A cancelled request always
    /// resolves as cancelled, whatever the network produced.
    ///
    /// Returns true if this call performed the delivery.
    pub(crate) fn deliver(&self, response: Response) -> bool {
        if !self.flag.consume() {
            return false;
        }
        let response = if self.flag.is_cancelled() && !response.is_cancelled() {
            Response::failed(response.request_id(), TransportError::Cancelled)
        } else {
            response
        };
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(response);
        }
        true
    }
}

/// Receives the response of one request and can cancel it.
#[derive(Debug)]
pub struct ResponseHandle {
    request_id: RequestId,
    receiver: oneshot::Receiver<Response>,
    flag: CancelFlag,
}

impl ResponseHandle {
    /// Returns the id of the request this handle belongs to.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Cancels the request. The handle will resolve as cancelled unless the
    /// response was already delivered.
    pub fn cancel(&self) {
        self.flag.cancel();
    }

    /// Returns a cheap canceller that outlives the handle.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            flag: self.flag.clone(),
        }
    }

    /// Waits for the response.
    pub async fn response(self) -> Response {
        match self.receiver.await {
            Ok(response) => response,
            // The request was dropped without being resolved.
            Err(_) => Response::failed(self.request_id, TransportError::Cancelled),
        }
    }
}

impl fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.is_cancelled())
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Cancels a request without owning its handle.
#[derive(Debug, Clone)]
pub struct Canceller {
    flag: CancelFlag,
}

impl Canceller {
    /// Cancels the request.
    pub fn cancel(&self) {
        self.flag.cancel();
    }
}

/// Immutable description of one network operation.
#[derive(Clone)]
pub struct Request {
    id: RequestId,
    method: Method,
    path: String,
    body: Option<Payload>,
    token_policy: TokenPolicy,
    expires_in: Option<Duration>,
    priority: Priority,
    background: bool,
    tag: Option<String>,
    completion: Completion,
}

impl Request {
    /// Starts building a request.
    pub fn builder(method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, path)
    }

    /// Shorthand for a GET request that requires a token.
    pub fn get(path: impl Into<String>) -> Self {
        Self::builder(Method::Get, path).build()
    }

    /// Returns the request id.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns the method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Returns the path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the body.
    pub fn body(&self) -> Option<&Payload> {
        self.body.as_ref()
    }

    /// Returns the token policy.
    pub fn token_policy(&self) -> TokenPolicy {
        self.token_policy
    }

    /// Returns the request's own expiration, if any.
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in
    }

    /// Returns the priority hint.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns true if the request must survive process suspension.
    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Returns the caller label.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Creates the handle through which the response is received.
    ///
    /// Only one handle can exist per request; a second call replaces the
    /// first, whose receiver then resolves as cancelled.
    pub fn response_handle(&mut self) -> ResponseHandle {
        let (sender, receiver) = oneshot::channel();
        *self.completion.sender.lock() = Some(sender);
        ResponseHandle {
            request_id: self.id,
            receiver,
            flag: self.completion.flag.clone(),
        }
    }

    /// Returns true if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.completion.flag.is_cancelled()
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("token_policy", &self.token_policy)
            .field("priority", &self.priority)
            .field("background", &self.background)
            .field("tag", &self.tag)
            .finish()
    }
}

/// Builder for [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    path: String,
    body: Option<Payload>,
    token_policy: TokenPolicy,
    expires_in: Option<Duration>,
    priority: Priority,
    background: bool,
    tag: Option<String>,
}

impl RequestBuilder {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            token_policy: TokenPolicy::RequiredWithRetry,
            expires_in: None,
            priority: Priority::Normal,
            background: false,
            tag: None,
        }
    }

    /// Sets a JSON body.
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(Payload::Json(value));
        self
    }

    /// Sets a binary body.
    pub fn binary(mut self, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.body = Some(Payload::Binary {
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }

    /// Sets the token policy.
    pub fn token_policy(mut self, policy: TokenPolicy) -> Self {
        self.token_policy = policy;
        self
    }

    /// Sets the expiration, counted from admission.
    pub fn expires_in(mut self, expiration: Duration) -> Self {
        self.expires_in = Some(expiration);
        self
    }

    /// Sets the priority hint.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the request as one that must survive process suspension.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Attaches a caller label.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Builds the request.
    pub fn build(self) -> Request {
        Request {
            id: RequestId::new(),
            method: self.method,
            path: self.path,
            body: self.body,
            token_policy: self.token_policy,
            expires_in: self.expires_in,
            priority: self.priority,
            background: self.background,
            tag: self.tag,
            completion: Completion::new(),
        }
    }
}
