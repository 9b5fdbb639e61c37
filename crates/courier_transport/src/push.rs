//! Push channel.
//!
//! A long-lived connection that streams remote events to a consumer. The
//! channel reconnects on its own with exponential backoff, waits for the
//! network instead of dialling while offline, and resumes from the last
//! delivered notification. Frames seen recently are dropped, so a backend that
//! redelivers after a reconnect does not produce duplicates.

use crate::config::PushChannelConfig;
use crate::error::{TransportError, TransportResult};
use crate::reachability::Reachability;
use crate::token::{AccessToken, AccessTokenManager};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// One remote event.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// Id of the notification that carried the event.
    pub notification_id: Uuid,
    /// Event type, taken from the payload's `type` field.
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

/// One notification as sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    /// Notification id.
    pub id: Uuid,
    /// Event payloads, in order.
    #[serde(default)]
    pub payload: Vec<serde_json::Value>,
}

impl PushFrame {
    /// Creates a frame with a fresh id.
    pub fn new(payload: Vec<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
        }
    }

    /// Splits the frame into events.
    pub fn events(&self) -> Vec<PushEvent> {
        self.payload
            .iter()
            .map(|payload| PushEvent {
                notification_id: self.id,
                event_type: payload
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                payload: payload.clone(),
            })
            .collect()
    }
}

/// Receives push channel callbacks on a [`DeliveryQueue`].
pub trait PushChannelConsumer: Send + Sync {
    /// Events arrived, in order.
    fn did_receive(&self, events: Vec<PushEvent>);

    /// The connection opened.
    fn did_open(&self) {}

    /// The connection closed.
    fn did_close(&self) {}
}

type Job = Box<dyn FnOnce() + Send>;

/// A serial executor. Jobs run one at a time, in submission order.
#[derive(Clone)]
pub struct DeliveryQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl DeliveryQueue {
    /// Spawns the queue's worker task.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job();
            }
        });
        Self { sender }
    }

    /// Submits a job. Returns false if the worker is gone.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Box::new(job)).is_ok()
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// An open push connection.
#[async_trait]
pub trait PushConnection: Send {
    /// Waits for the next frame. `None` means the connection closed.
    async fn next_frame(&mut self) -> Option<TransportResult<PushFrame>>;

    /// Closes the connection.
    async fn close(&mut self);
}

/// Opens push connections.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Connects, resuming after notification `since` if given.
    async fn connect(
        &self,
        token: Option<&AccessToken>,
        since: Option<Uuid>,
    ) -> TransportResult<Box<dyn PushConnection>>;
}

/// Connection status of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Not connected; a reconnect is scheduled.
    Disconnected,
    /// Offline; waiting for the network to return.
    WaitingForNetwork,
    /// Dialling.
    Connecting,
    /// Connected.
    Connected,
    /// Shut down.
    Closed,
}

enum Command {
    Configure {
        consumer: Arc<dyn PushChannelConsumer>,
        queue: DeliveryQueue,
    },
    Close,
}

/// Handle to a running push channel.
pub struct PushChannel {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PushStatus>,
}

impl PushChannel {
    /// Starts the channel. It connects right away; events are buffered until
    /// a consumer is configured.
    pub fn spawn(
        config: PushChannelConfig,
        connector: Arc<dyn PushConnector>,
        tokens: Option<AccessTokenManager>,
        reachability: Arc<dyn Reachability>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PushStatus::Disconnected);
        let context = ChannelContext {
            config,
            connector,
            tokens,
            reachability,
        };
        tokio::spawn(run_channel(context, command_rx, status_tx));
        Self { commands, status }
    }

    /// Sets the consumer and the queue its callbacks run on. Buffered events
    /// are delivered first.
    pub fn configure(&self, consumer: Arc<dyn PushChannelConsumer>, queue: DeliveryQueue) {
        let _ = self.commands.send(Command::Configure { consumer, queue });
    }

    /// Shuts the channel down.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Returns the current status.
    pub fn status(&self) -> PushStatus {
        *self.status.borrow()
    }

    /// Subscribes to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<PushStatus> {
        self.status.clone()
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

struct ChannelContext {
    config: PushChannelConfig,
    connector: Arc<dyn PushConnector>,
    tokens: Option<AccessTokenManager>,
    reachability: Arc<dyn Reachability>,
}

/// Consumer-side state: de-duplication, buffering, resume point.
struct Delivery {
    consumer: Option<(Arc<dyn PushChannelConsumer>, DeliveryQueue)>,
    buffer: VecDeque<PushEvent>,
    buffer_capacity: usize,
    recent: VecDeque<Uuid>,
    recent_set: HashSet<Uuid>,
    dedup_window: usize,
    last_id: Option<Uuid>,
    connected: bool,
}

impl Delivery {
    fn new(config: &PushChannelConfig) -> Self {
        Self {
            consumer: None,
            buffer: VecDeque::new(),
            buffer_capacity: config.buffer_capacity.max(1),
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
            dedup_window: config.dedup_window.max(1),
            last_id: None,
            connected: false,
        }
    }

    /// Applies a command. Returns false when the channel must stop.
    fn handle(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Configure { consumer, queue }) => {
                let buffered: Vec<PushEvent> = self.buffer.drain(..).collect();
                if !buffered.is_empty() {
                    debug!(events = buffered.len(), "flushing buffered push events");
                    let target = Arc::clone(&consumer);
                    queue.execute(move || target.did_receive(buffered));
                }
                if self.connected {
                    let target = Arc::clone(&consumer);
                    queue.execute(move || target.did_open());
                }
                self.consumer = Some((consumer, queue));
                true
            }
            Some(Command::Close) | None => false,
        }
    }

    fn deliver(&mut self, frame: PushFrame) {
        if self.recent_set.contains(&frame.id) {
            trace!(id = %frame.id, "dropping redelivered notification");
            return;
        }
        self.recent.push_back(frame.id);
        self.recent_set.insert(frame.id);
        while self.recent.len() > self.dedup_window {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
        self.last_id = Some(frame.id);

        let events = frame.events();
        if events.is_empty() {
            return;
        }
        match &self.consumer {
            Some((consumer, queue)) => {
                let consumer = Arc::clone(consumer);
                queue.execute(move || consumer.did_receive(events));
            }
            None => {
                self.buffer.extend(events);
                let overflow = self.buffer.len().saturating_sub(self.buffer_capacity);
                if overflow > 0 {
                    self.buffer.drain(..overflow);
                    warn!(dropped = overflow, "push buffer full, dropped oldest events");
                }
            }
        }
    }

    fn opened(&mut self) {
        self.connected = true;
        if let Some((consumer, queue)) = &self.consumer {
            let consumer = Arc::clone(consumer);
            queue.execute(move || consumer.did_open());
        }
    }

    fn closed(&mut self) {
        self.connected = false;
        if let Some((consumer, queue)) = &self.consumer {
            let consumer = Arc::clone(consumer);
            queue.execute(move || consumer.did_close());
        }
    }
}

async fn connect(
    context: &ChannelContext,
    since: Option<Uuid>,
) -> TransportResult<Box<dyn PushConnection>> {
    let token = match (&context.tokens, context.config.requires_token) {
        (Some(tokens), true) => Some(tokens.acquire().await?),
        _ => None,
    };
    let result = context.connector.connect(token.as_ref(), since).await;
    if let (Err(TransportError::AuthenticationFailed(_)), Some(tokens), Some(token)) =
        (&result, &context.tokens, &token)
    {
        tokens.invalidate(token);
    }
    result
}

async fn run_channel(
    context: ChannelContext,
    mut commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<PushStatus>,
) {
    let mut delivery = Delivery::new(&context.config);
    let mut online = context.reachability.subscribe();
    let mut watching = true;
    let mut attempt: u32 = 0;

    loop {
        while watching && !context.reachability.is_online() {
            status.send_replace(PushStatus::WaitingForNetwork);
            tokio::select! {
                changed = online.changed() => watching = changed.is_ok(),
                command = commands.recv() => if !delivery.handle(command) {
                    status.send_replace(PushStatus::Closed);
                    return;
                },
            }
        }

        status.send_replace(PushStatus::Connecting);
        let connecting = connect(&context, delivery.last_id);
        tokio::pin!(connecting);
        let connected = loop {
            tokio::select! {
                result = &mut connecting => break result,
                command = commands.recv() => if !delivery.handle(command) {
                    status.send_replace(PushStatus::Closed);
                    return;
                },
            }
        };

        match connected {
            Ok(mut connection) => {
                attempt = 0;
                status.send_replace(PushStatus::Connected);
                info!(since = ?delivery.last_id, "push channel connected");
                delivery.opened();

                let stop = loop {
                    tokio::select! {
                        frame = connection.next_frame() => match frame {
                            Some(Ok(frame)) => delivery.deliver(frame),
                            Some(Err(e)) => {
                                warn!(error = %e, "push channel failed");
                                break false;
                            }
                            None => {
                                debug!("push channel closed by remote");
                                break false;
                            }
                        },
                        command = commands.recv() => if !delivery.handle(command) {
                            connection.close().await;
                            break true;
                        },
                        changed = online.changed(), if watching => {
                            watching = changed.is_ok();
                            if !context.reachability.is_online() {
                                debug!("network lost, dropping push connection");
                                connection.close().await;
                                break false;
                            }
                        },
                    }
                };

                delivery.closed();
                if stop {
                    status.send_replace(PushStatus::Closed);
                    info!("push channel shut down");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, attempt, "push channel connect failed");
            }
        }

        status.send_replace(PushStatus::Disconnected);
        attempt = attempt.saturating_add(1);
        let delay = context.config.reconnect.delay_for_attempt(attempt);
        debug!(delay_ms = delay.as_millis() as u64, "push channel reconnecting");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => if !delivery.handle(command) {
                    status.send_replace(PushStatus::Closed);
                    return;
                },
            }
        }
    }
}

/// Connects to a WebSocket endpoint that sends JSON [`PushFrame`]s.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Creates a connector for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn url_for(&self, since: Option<Uuid>) -> String {
        match since {
            Some(id) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}since={}", self.url, separator, id)
            }
            None => self.url.clone(),
        }
    }
}

fn websocket_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
            TransportError::AuthenticationFailed("push endpoint rejected credentials".into())
        }
        tungstenite::Error::Http(response) if response.status().as_u16() == 429 => {
            TransportError::TryAgainLater { retry_after: None }
        }
        tungstenite::Error::Url(e) => TransportError::fatal(e.to_string()),
        other => TransportError::network(other.to_string()),
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(
        &self,
        token: Option<&AccessToken>,
        since: Option<Uuid>,
    ) -> TransportResult<Box<dyn PushConnection>> {
        let mut request = self
            .url_for(since)
            .into_client_request()
            .map_err(websocket_error)?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&token.authorization())
                .map_err(|e| TransportError::fatal(format!("invalid token header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _) = connect_async(request).await.map_err(websocket_error)?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WebSocketConnection {
    async fn next_frame(&mut self) -> Option<TransportResult<PushFrame>> {
        loop {
            let parsed = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => serde_json::from_str::<PushFrame>(&text),
                Some(Ok(Message::Binary(data))) => serde_json::from_slice::<PushFrame>(&data),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(TransportError::network(e.to_string()))),
            };
            match parsed {
                Ok(frame) => return Some(Ok(frame)),
                Err(e) => warn!(error = %e, "skipping malformed push frame"),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

struct LoopbackState {
    history: Vec<PushFrame>,
    live: Option<mpsc::UnboundedSender<PushFrame>>,
    connects: Vec<Option<Uuid>>,
    failures: usize,
}

/// An in-process push backend.
///
/// Keeps every published frame. A connection replays history starting at the
/// `since` notification inclusive, like a backend that redelivers the last
/// acknowledged frame, then streams new frames live.
pub struct LoopbackPushConnector {
    state: Mutex<LoopbackState>,
}

impl LoopbackPushConnector {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                history: Vec::new(),
                live: None,
                connects: Vec::new(),
                failures: 0,
            }),
        }
    }

    /// Publishes a frame to history and to the live connection.
    pub fn publish(&self, frame: PushFrame) {
        let mut state = self.state.lock();
        if let Some(live) = &state.live {
            if live.send(frame.clone()).is_err() {
                state.live = None;
            }
        }
        state.history.push(frame);
    }

    /// Drops the live connection.
    pub fn disconnect(&self) {
        self.state.lock().live = None;
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().failures = count;
    }

    /// Returns the `since` value of every successful connection.
    pub fn connects(&self) -> Vec<Option<Uuid>> {
        self.state.lock().connects.clone()
    }

    /// Returns true while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().live.as_ref().is_some_and(|l| !l.is_closed())
    }
}

impl Default for LoopbackPushConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushConnector for LoopbackPushConnector {
    async fn connect(
        &self,
        _token: Option<&AccessToken>,
        since: Option<Uuid>,
    ) -> TransportResult<Box<dyn PushConnection>> {
        let mut state = self.state.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(TransportError::network("loopback push refused"));
        }

        let start = since
            .and_then(|id| state.history.iter().position(|f| f.id == id))
            .unwrap_or(0);
        let replay: VecDeque<PushFrame> = state.history[start..].iter().cloned().collect();
        let (sender, receiver) = mpsc::unbounded_channel();
        state.live = Some(sender);
        state.connects.push(since);
        Ok(Box::new(LoopbackConnection { replay, receiver }))
    }
}

struct LoopbackConnection {
    replay: VecDeque<PushFrame>,
    receiver: mpsc::UnboundedReceiver<PushFrame>,
}

#[async_trait]
impl PushConnection for LoopbackConnection {
    async fn next_frame(&mut self) -> Option<TransportResult<PushFrame>> {
        if let Some(frame) = self.replay.pop_front() {
            return Some(Ok(frame));
        }
        self.receiver.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::reachability::{NetworkState, ReachabilityMonitor};
    use serde_json::json;
    use std::time::Duration;

    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PushChannelConsumer for Recorder {
        fn did_receive(&self, events: Vec<PushEvent>) {
            self.events
                .lock()
                .extend(events.into_iter().map(|e| e.event_type));
        }
    }

    fn fast_config() -> PushChannelConfig {
        PushChannelConfig::new()
            .with_requires_token(false)
            .with_reconnect(
                RetryConfig::new(u32::MAX)
                    .with_initial_delay(Duration::from_millis(5))
                    .with_max_delay(Duration::from_millis(20))
                    .with_jitter(false),
            )
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn frame_events_take_type_field() {
        let frame = PushFrame::new(vec![json!({"type": "conversation.create"}), json!({})]);
        let events = frame.events();
        assert_eq!(events[0].event_type, "conversation.create");
        assert_eq!(events[1].event_type, "unknown");
        assert!(events.iter().all(|e| e.notification_id == frame.id));
    }

    #[test]
    fn frame_parses_from_json() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"id":"{id}","payload":[{{"type":"user.update"}}]}}"#);
        let frame: PushFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.id, id);
        assert_eq!(frame.payload.len(), 1);
    }

    #[test]
    fn websocket_url_carries_resume_point() {
        let connector = WebSocketConnector::new("ws://localhost/await?client=abc");
        let id = Uuid::new_v4();
        assert_eq!(
            connector.url_for(Some(id)),
            format!("ws://localhost/await?client=abc&since={id}")
        );
        assert_eq!(connector.url_for(None), "ws://localhost/await?client=abc");
    }

    #[tokio::test]
    async fn buffers_until_configured() {
        let backend = Arc::new(LoopbackPushConnector::new());
        backend.publish(PushFrame::new(vec![json!({"type": "a"})]));
        let channel = PushChannel::spawn(
            fast_config(),
            backend.clone(),
            None,
            Arc::new(ReachabilityMonitor::online()),
        );
        eventually(|| channel.status() == PushStatus::Connected).await;

        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        channel.configure(recorder.clone(), DeliveryQueue::new());
        eventually(|| recorder.events.lock().len() == 1).await;

        channel.close();
        eventually(|| channel.status() == PushStatus::Closed).await;
    }

    #[tokio::test]
    async fn buffer_drops_oldest_when_full() {
        let backend = Arc::new(LoopbackPushConnector::new());
        for name in ["a", "b", "c"] {
            backend.publish(PushFrame::new(vec![json!({ "type": name })]));
        }
        let channel = PushChannel::spawn(
            fast_config().with_buffer_capacity(2),
            backend.clone(),
            None,
            Arc::new(ReachabilityMonitor::online()),
        );
        eventually(|| channel.status() == PushStatus::Connected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        channel.configure(recorder.clone(), DeliveryQueue::new());
        eventually(|| recorder.events.lock().len() == 2).await;
        assert_eq!(*recorder.events.lock(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn waits_for_network_before_dialling() {
        let backend = Arc::new(LoopbackPushConnector::new());
        let reachability = Arc::new(ReachabilityMonitor::new(NetworkState::Offline));
        let channel = PushChannel::spawn(fast_config(), backend.clone(), None, reachability.clone());

        eventually(|| channel.status() == PushStatus::WaitingForNetwork).await;
        assert!(backend.connects().is_empty());

        reachability.set_state(NetworkState::Online);
        eventually(|| channel.status() == PushStatus::Connected).await;
        assert_eq!(backend.connects(), vec![None]);
    }

    #[tokio::test]
    async fn reconnects_after_refused_connects() {
        let backend = Arc::new(LoopbackPushConnector::new());
        backend.fail_next_connects(2);
        let channel = PushChannel::spawn(
            fast_config(),
            backend.clone(),
            None,
            Arc::new(ReachabilityMonitor::online()),
        );

        eventually(|| channel.status() == PushStatus::Connected).await;
        assert_eq!(backend.connects().len(), 1);
    }
}
