//! Request scheduler.
//!
//! The scheduler admits requests under a concurrency ceiling, attaches access
//! tokens, enforces deadlines and cancellation, and turns every admitted
//! request into exactly one [`Response`]. It never retries on its own except
//! for the single resend of a [`TokenPolicy::RequiredWithRetry`] request after
//! a token refresh.
//!
//! ## Admission
//!
//! Callers that produce work lazily use [`RequestScheduler::attempt_to_enqueue`]
//! with a generator. The generator is only invoked when a slot is free, and at
//! most once per call. Callers with a single request use
//! [`RequestScheduler::enqueue_one_time`], which waits for a slot.
//!
//! ## Rate limiting
//!
//! A "try again later" answer stops admission for a hold-off window. After
//! the window one request at a time is allowed until a completion arrives that
//! is not rate limited.

use crate::config::{LoopDetectionConfig, TransportConfig};
use crate::error::{RecoveryLogError, TransportError};
use crate::reachability::{NetworkState, NetworkStateDelegate, Reachability};
use crate::recovery::{RecoveredResponse, RecoveryEntry, RecoveryLog, RecoveryResult};
use crate::request::{CancelFlag, Request, RequestId, TokenPolicy};
use crate::response::{EnqueueResult, Response};
use crate::token::AccessTokenManager;
use crate::transport::{BackgroundTaskState, BackgroundTicket, Transport};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Admission phase of the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitState {
    /// Normal operation.
    Normal,
    /// No admission until the hold-off window ends.
    HoldingOff,
    /// One request at a time until a non-rate-limited completion.
    Retrying,
}

#[derive(Debug)]
struct RateLimiter {
    state: RateLimitState,
    until: Option<Instant>,
    consecutive: u32,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            state: RateLimitState::Normal,
            until: None,
            consecutive: 0,
        }
    }
}

type Fingerprint = [u8; 32];

/// Counts identical requests inside a sliding window.
#[derive(Debug)]
struct LoopDetector {
    config: LoopDetectionConfig,
    seen: HashMap<Fingerprint, VecDeque<Instant>>,
    reported: HashMap<Fingerprint, Instant>,
}

impl LoopDetector {
    fn new(config: LoopDetectionConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
            reported: HashMap::new(),
        }
    }

    fn fingerprint(request: &Request) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(request.method().as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(request.path().as_bytes());
        hasher.update([0u8]);
        if let Some(body) = request.body() {
            hasher.update(body.content_type().as_bytes());
            hasher.update(body.to_bytes());
        }
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&hasher.finalize());
        fingerprint
    }

    /// Records an admission. Returns true when the loop callback should fire.
    fn record(&mut self, request: &Request, now: Instant) -> bool {
        let window = self.config.window;
        if self.seen.len() > 1024 {
            self.seen
                .retain(|_, stamps| stamps.back().is_some_and(|t| now.duration_since(*t) < window));
            self.reported.retain(|_, t| now.duration_since(*t) < window);
        }

        let key = Self::fingerprint(request);
        let stamps = self.seen.entry(key).or_default();
        while stamps.front().is_some_and(|t| now.duration_since(*t) >= window) {
            stamps.pop_front();
        }
        stamps.push_back(now);
        if stamps.len() <= self.config.threshold {
            return false;
        }

        match self.reported.get(&key) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                self.reported.insert(key, now);
                true
            }
        }
    }
}

struct SchedulerState {
    rate_limit: RateLimiter,
    cancellers: HashMap<RequestId, CancelFlag>,
    loop_detector: Option<LoopDetector>,
    suspended: bool,
    background_pending: HashMap<String, usize>,
    completion_handlers: HashMap<String, Vec<Box<dyn FnOnce() + Send>>>,
}

type LoopCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Inner {
    config: TransportConfig,
    transport: Arc<dyn Transport>,
    tokens: AccessTokenManager,
    reachability: Arc<dyn Reachability>,
    slots: Arc<Semaphore>,
    state: Mutex<SchedulerState>,
    new_requests: broadcast::Sender<()>,
    delegate: Mutex<Option<Arc<dyn NetworkStateDelegate>>>,
    loop_callback: Mutex<Option<LoopCallback>>,
    recovery: Option<RecoveryLog>,
}

/// Admits, authenticates and dispatches requests.
///
/// Cloning yields another handle to the same scheduler. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

impl RequestScheduler {
    /// Creates a scheduler.
    ///
    /// Opens the recovery log if the configuration names one.
    pub fn new(
        config: TransportConfig,
        transport: Arc<dyn Transport>,
        tokens: AccessTokenManager,
        reachability: Arc<dyn Reachability>,
    ) -> RecoveryResult<Self> {
        let recovery = match &config.recovery_log_path {
            Some(path) => Some(RecoveryLog::open(path.clone())?),
            None => None,
        };
        let (new_requests, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            slots: Arc::new(Semaphore::new(config.maximum_concurrent_requests)),
            state: Mutex::new(SchedulerState {
                rate_limit: RateLimiter::new(),
                cancellers: HashMap::new(),
                loop_detector: config.loop_detection.clone().map(LoopDetector::new),
                suspended: false,
                background_pending: HashMap::new(),
                completion_handlers: HashMap::new(),
            }),
            config,
            transport,
            tokens,
            reachability,
            new_requests,
            delegate: Mutex::new(None),
            loop_callback: Mutex::new(None),
            recovery,
        });

        Self::watch_reachability(&inner);
        Ok(Self { inner })
    }

    fn watch_reachability(inner: &Arc<Inner>) {
        let mut changes = inner.reachability.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(inner);
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                if state == NetworkState::Online {
                    debug!("network back online");
                    inner.notify_new_requests_available();
                }
            }
        });
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Returns the access token manager.
    pub fn tokens(&self) -> &AccessTokenManager {
        &self.inner.tokens
    }

    /// Returns the configured concurrency ceiling.
    pub fn maximum_concurrent_requests(&self) -> usize {
        self.inner.config.maximum_concurrent_requests
    }

    /// Returns the number of admitted requests that have not completed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// Returns the rate limiter's phase.
    pub fn rate_limit_state(&self) -> RateLimitState {
        self.inner.state.lock().rate_limit.state
    }

    /// Returns true if admission is currently possible at all.
    pub fn can_send(&self) -> bool {
        self.inner.can_send()
    }

    /// Installs the network state delegate.
    pub fn set_network_state_delegate(&self, delegate: Arc<dyn NetworkStateDelegate>) {
        *self.inner.delegate.lock() = Some(delegate);
    }

    /// Installs the callback fired when a request loop is detected. It
    /// receives the looping path.
    pub fn set_request_loop_detection_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.inner.loop_callback.lock() = Some(Arc::new(callback));
    }

    /// Subscribes to "a new request may be available" notifications.
    pub fn subscribe_new_requests(&self) -> broadcast::Receiver<()> {
        self.inner.new_requests.subscribe()
    }

    /// Tells subscribers that polling for work may now succeed.
    pub fn notify_new_requests_available(&self) {
        self.inner.notify_new_requests_available();
    }

    /// Offers the scheduler a chance to admit one request.
    ///
    /// The generator is invoked at most once, and only when a slot is free.
    pub fn attempt_to_enqueue<F>(&self, generator: F) -> EnqueueResult
    where
        F: FnOnce() -> Option<Request>,
    {
        let inner = &self.inner;
        if !inner.can_send() || inner.in_flight() >= inner.effective_limit() {
            return EnqueueResult::default();
        }
        let permit = match Arc::clone(&inner.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return EnqueueResult::default(),
        };

        let Some(request) = generator() else {
            drop(permit);
            return EnqueueResult {
                has_capacity: true,
                generated: false,
            };
        };

        let deadline = inner.deadline_for(&request);
        Inner::admit(inner, request, permit, deadline);

        EnqueueResult {
            has_capacity: inner.can_send() && inner.in_flight() < inner.effective_limit(),
            generated: true,
        }
    }

    /// Enqueues a request outside the generator protocol.
    ///
    /// The request waits until the scheduler can send (online and not
    /// holding off), then for a free slot in arrival order. Its deadline and
    /// cancellation apply while it waits.
    pub fn enqueue_one_time(&self, request: Request) {
        let inner = Arc::clone(&self.inner);
        let deadline = inner.deadline_for(&request);
        let flag = request.completion().flag().clone();
        inner.state.lock().cancellers.insert(request.id(), flag.clone());

        tokio::spawn(async move {
            let slots = Arc::clone(&inner.slots);
            let permit = tokio::select! {
                _ = flag.cancelled() => Err(TransportError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(TransportError::Expired),
                permit = async {
                    inner.wait_until_sendable().await;
                    slots.acquire_owned().await
                } => permit.map_err(|_| TransportError::fatal("scheduler shut down")),
            };
            match permit {
                Ok(permit) => Inner::admit(&inner, request, permit, deadline),
                Err(err) => {
                    debug!(request_id = %request.id(), error = %err, "one-time request never dispatched");
                    inner.state.lock().cancellers.remove(&request.id());
                    request
                        .completion()
                        .deliver(Response::failed(request.id(), err));
                }
            }
        });
    }

    /// Cancels an admitted request. Returns false if it is unknown or done.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let flag = self.inner.state.lock().cancellers.get(&request_id).cloned();
        match flag {
            Some(flag) if !flag.is_consumed() => {
                debug!(%request_id, "cancelling request");
                flag.cancel();
                true
            }
            _ => false,
        }
    }

    /// Routes every request admitted from now on through the background
    /// session, until [`resume`](Self::resume).
    pub fn prepare_for_suspension(&self) {
        info!("preparing for suspension");
        self.inner.state.lock().suspended = true;
    }

    /// Leaves suspension mode.
    pub fn resume(&self) {
        self.inner.state.lock().suspended = false;
        self.inner.notify_new_requests_available();
    }

    /// Returns true between [`prepare_for_suspension`](Self::prepare_for_suspension)
    /// and [`resume`](Self::resume).
    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// Returns the recovery log, if background continuation is enabled.
    pub fn recovery_log(&self) -> Option<&RecoveryLog> {
        self.inner.recovery.as_ref()
    }

    /// Registers a handler that runs once every reattached task of
    /// `session` has been delivered. Runs right away if none are pending.
    pub fn add_completion_handler_for_background_session<F>(&self, session: &str, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.background_pending.get(session).copied().unwrap_or(0) == 0 {
            drop(state);
            handler();
            return;
        }
        state
            .completion_handlers
            .entry(session.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Re-delivers the responses of background requests admitted before the
    /// process was suspended.
    ///
    /// Finished tasks are sent on the returned channel right away, running
    /// tasks when they finish, and tasks the transport no longer knows about
    /// as a "lost" transport failure.
    pub async fn reattach_background_tasks(
        &self,
    ) -> RecoveryResult<mpsc::UnboundedReceiver<RecoveredResponse>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let Some(log) = self.inner.recovery.as_ref() else {
            return Ok(receiver);
        };

        let entries = log.entries();
        let mut by_session: HashMap<String, Vec<RecoveryEntry>> = HashMap::new();
        for entry in entries {
            by_session.entry(entry.session.clone()).or_default().push(entry);
        }

        for (session, entries) in by_session {
            let tasks = self.inner.transport.background_tasks(&session).await;
            info!(
                %session,
                logged = entries.len(),
                known = tasks.len(),
                "reattaching background tasks"
            );
            *self
                .inner
                .state
                .lock()
                .background_pending
                .entry(session.clone())
                .or_default() += entries.len();

            for entry in entries {
                match tasks.iter().find(|t| t.task_id == entry.task_id) {
                    Some(task) => match &task.state {
                        BackgroundTaskState::Completed(response) => {
                            let response = response.clone();
                            if let Err(e) = self.inner.deliver_recovered(&sender, entry, response) {
                                warn!(error = %e, "failed to update recovery log");
                            }
                        }
                        BackgroundTaskState::Running => {
                            let inner = Arc::clone(&self.inner);
                            let sender = sender.clone();
                            tokio::spawn(async move {
                                let response = inner
                                    .transport
                                    .wait_for_background_task(&entry.session, &entry.task_id)
                                    .await
                                    .unwrap_or_else(|| lost(entry.request_id));
                                if let Err(e) = inner.deliver_recovered(&sender, entry, response) {
                                    warn!(error = %e, "failed to update recovery log");
                                }
                            });
                        }
                    },
                    None => {
                        let response = lost(entry.request_id);
                        if let Err(e) = self.inner.deliver_recovered(&sender, entry, response) {
                            warn!(error = %e, "failed to update recovery log");
                        }
                    }
                }
            }
        }
        Ok(receiver)
    }
}

fn lost(request_id: RequestId) -> Response {
    Response::failed(
        request_id,
        TransportError::network("background task lost"),
    )
}

impl Inner {
    fn in_flight(&self) -> usize {
        self.config
            .maximum_concurrent_requests
            .saturating_sub(self.slots.available_permits())
    }

    fn effective_limit(&self) -> usize {
        match self.state.lock().rate_limit.state {
            RateLimitState::Retrying => 1,
            _ => self.config.maximum_concurrent_requests,
        }
    }

    fn can_send(&self) -> bool {
        self.reachability.is_online()
            && self.state.lock().rate_limit.state != RateLimitState::HoldingOff
    }

    /// Resolves once reachability and the rate limiter allow sending.
    async fn wait_until_sendable(&self) {
        let mut wakeups = self.new_requests.subscribe();
        while !self.can_send() {
            if let Err(broadcast::error::RecvError::Closed) = wakeups.recv().await {
                return;
            }
        }
    }

    fn deadline_for(&self, request: &Request) -> Instant {
        let expiration = request
            .expires_in()
            .unwrap_or(self.config.default_request_expiration);
        Instant::now() + expiration
    }

    fn notify_new_requests_available(&self) {
        let _ = self.new_requests.send(());
    }

    fn admit(this: &Arc<Self>, request: Request, permit: OwnedSemaphorePermit, deadline: Instant) {
        let id = request.id();
        let (fire_loop, background) = {
            let mut state = this.state.lock();
            state
                .cancellers
                .insert(id, request.completion().flag().clone());
            let fire_loop = state
                .loop_detector
                .as_mut()
                .is_some_and(|detector| detector.record(&request, Instant::now()));
            (fire_loop, request.is_background() || state.suspended)
        };

        if fire_loop {
            warn!(path = request.path(), "request loop detected");
            let callback = this.loop_callback.lock().clone();
            if let Some(callback) = callback {
                callback(request.path());
            }
        }

        let ticket = if background {
            this.record_background(&request)
        } else {
            None
        };

        trace!(
            request_id = %id,
            method = %request.method(),
            path = request.path(),
            background = ticket.is_some(),
            "request admitted"
        );

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.run(request, permit, deadline, ticket).await;
        });
    }

    fn record_background(&self, request: &Request) -> Option<BackgroundTicket> {
        let log = self.recovery.as_ref()?;
        let ticket = BackgroundTicket {
            session: self.config.background_session_identifier.clone(),
            task_id: request.id().to_string(),
        };
        let entry = RecoveryEntry::new(
            request.id(),
            request.tag().map(str::to_string),
            request.method(),
            request.path(),
            ticket.session.clone(),
            ticket.task_id.clone(),
        );
        match log.record(entry) {
            Ok(()) => Some(ticket),
            Err(e) => {
                warn!(request_id = %request.id(), error = %e, "could not record background request, sending in foreground");
                None
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        request: Request,
        permit: OwnedSemaphorePermit,
        deadline: Instant,
        ticket: Option<BackgroundTicket>,
    ) {
        let id = request.id();
        let flag = request.completion().flag().clone();
        let response = tokio::select! {
            biased;
            _ = flag.cancelled() => Response::failed(id, TransportError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Response::failed(id, TransportError::Expired),
            response = self.execute(&request, ticket.as_ref()) => response,
        };
        drop(permit);
        self.finish(&request, response, ticket);
    }

    async fn execute(&self, request: &Request, ticket: Option<&BackgroundTicket>) -> Response {
        let id = request.id();
        let policy = request.token_policy();
        if !policy.needs_token() {
            return self.transport.send(request, None, ticket).await;
        }

        let token = match self.tokens.acquire().await {
            Ok(token) => token,
            Err(err) => return Response::failed(id, err),
        };
        let response = self.transport.send(request, Some(&token), ticket).await;
        if !matches!(response.error(), Some(TransportError::AuthenticationFailed(_))) {
            return response;
        }

        self.tokens.invalidate(&token);
        if policy != TokenPolicy::RequiredWithRetry {
            return response;
        }
        debug!(request_id = %id, "resending after token refresh");
        match self.tokens.acquire().await {
            Ok(token) => self.transport.send(request, Some(&token), ticket).await,
            Err(err) => Response::failed(id, err),
        }
    }

    fn finish(self: &Arc<Self>, request: &Request, response: Response, ticket: Option<BackgroundTicket>) {
        let id = request.id();
        self.state.lock().cancellers.remove(&id);
        self.update_rate_limit(&response);
        self.report_network_state(&response);

        if ticket.is_some() {
            if let Some(log) = &self.recovery {
                if let Err(e) = log.remove(id) {
                    warn!(request_id = %id, error = %e, "failed to update recovery log");
                }
            }
        }

        match response.error() {
            Some(err) => debug!(request_id = %id, path = request.path(), error = err.label(), "request failed"),
            None => trace!(request_id = %id, status = ?response.status(), "request completed"),
        }
        request.completion().deliver(response);
        self.notify_new_requests_available();
    }

    fn update_rate_limit(self: &Arc<Self>, response: &Response) {
        if response.is_cancelled() {
            return;
        }
        let mut state = self.state.lock();
        let limiter = &mut state.rate_limit;

        if !response.is_rate_limited() {
            if limiter.state == RateLimitState::Retrying {
                info!("rate limit lifted");
                limiter.state = RateLimitState::Normal;
                limiter.consecutive = 0;
            }
            return;
        }

        limiter.consecutive = limiter.consecutive.saturating_add(1);
        let backoff = self
            .config
            .rate_limit_backoff
            .delay_for_attempt(limiter.consecutive);
        let hold_off = response.retry_after().unwrap_or(Duration::ZERO).max(backoff);
        let until = Instant::now() + hold_off;
        if limiter.until.is_some_and(|current| current >= until)
            && limiter.state == RateLimitState::HoldingOff
        {
            return;
        }
        limiter.state = RateLimitState::HoldingOff;
        limiter.until = Some(until);
        warn!(
            hold_off_ms = hold_off.as_millis() as u64,
            consecutive = limiter.consecutive,
            "backend asked to back off"
        );
        drop(state);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.lock();
            if state.rate_limit.state == RateLimitState::HoldingOff
                && state.rate_limit.until == Some(until)
            {
                state.rate_limit.state = RateLimitState::Retrying;
                state.rate_limit.until = None;
                drop(state);
                debug!("hold-off window over, retrying one request at a time");
                inner.notify_new_requests_available();
            }
        });
    }

    fn report_network_state(&self, response: &Response) {
        let delegate = self.delegate.lock().clone();
        let Some(delegate) = delegate else { return };
        if response.status().is_some() {
            delegate.did_receive_data();
        } else if matches!(
            response.error(),
            Some(TransportError::TransportFailure { .. })
        ) {
            delegate.did_go_offline();
        }
    }

    fn deliver_recovered(
        &self,
        sender: &mpsc::UnboundedSender<RecoveredResponse>,
        entry: RecoveryEntry,
        response: Response,
    ) -> Result<(), RecoveryLogError> {
        // The response is delivered and the session settled even when the
        // log cannot be rewritten.
        let removed = match &self.recovery {
            Some(log) => log.remove(entry.request_id).map(|_| ()),
            None => Ok(()),
        };
        let session = entry.session.clone();
        let _ = sender.send(RecoveredResponse {
            request_id: entry.request_id,
            tag: entry.tag,
            method: entry.method,
            path: entry.path,
            response: response.readdressed(entry.request_id),
        });

        let handlers = {
            let mut state = self.state.lock();
            let remaining = state.background_pending.entry(session.clone()).or_default();
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.background_pending.remove(&session);
                state.completion_handlers.remove(&session).unwrap_or_default()
            } else {
                Vec::new()
            }
        };
        if !handlers.is_empty() {
            debug!(%session, "background session drained");
        }
        for handler in handlers {
            handler();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reachability::ReachabilityMonitor;
    use crate::request::Method;
    use crate::token::{AccessToken, TokenRefresher};
    use crate::transport::{MockReply, MockTransport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticRefresher;

    #[async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(&self, _previous: Option<AccessToken>) -> crate::TransportResult<AccessToken> {
            Ok(AccessToken::bearer("fresh", Duration::from_secs(3600)))
        }
    }

    fn scheduler(max: usize, transport: Arc<MockTransport>) -> RequestScheduler {
        let tokens = AccessTokenManager::new(Arc::new(StaticRefresher));
        RequestScheduler::new(
            TransportConfig::new(max),
            transport,
            tokens,
            Arc::new(ReachabilityMonitor::online()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn generator_not_called_when_full() {
        let transport = Arc::new(MockTransport::new());
        transport.pause();
        let scheduler = scheduler(1, transport.clone());

        let first = scheduler.attempt_to_enqueue(|| Some(Request::get("/a")));
        assert_eq!(
            first,
            EnqueueResult {
                has_capacity: false,
                generated: true
            }
        );

        let called = AtomicUsize::new(0);
        let second = scheduler.attempt_to_enqueue(|| {
            called.fetch_add(1, Ordering::SeqCst);
            Some(Request::get("/b"))
        });
        assert_eq!(second, EnqueueResult::default());
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn declined_generator_releases_slot() {
        let transport = Arc::new(MockTransport::new());
        let scheduler = scheduler(1, transport);

        let result = scheduler.attempt_to_enqueue(|| None);
        assert_eq!(
            result,
            EnqueueResult {
                has_capacity: true,
                generated: false
            }
        );
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn offline_blocks_admission() {
        let transport = Arc::new(MockTransport::new());
        let reachability = Arc::new(ReachabilityMonitor::new(NetworkState::Offline));
        let scheduler = RequestScheduler::new(
            TransportConfig::new(2),
            transport,
            AccessTokenManager::new(Arc::new(StaticRefresher)),
            reachability.clone(),
        )
        .unwrap();
        let mut wakeups = scheduler.subscribe_new_requests();

        assert!(!scheduler.attempt_to_enqueue(|| Some(Request::get("/a"))).generated);

        reachability.set_state(NetworkState::Online);
        tokio::time::timeout(Duration::from_secs(1), wakeups.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(scheduler.attempt_to_enqueue(|| Some(Request::get("/a"))).generated);
    }

    #[tokio::test]
    async fn token_attached_to_required_requests() {
        let transport = Arc::new(MockTransport::new());
        let scheduler = scheduler(2, transport.clone());

        let mut request = Request::builder(Method::Get, "/self")
            .token_policy(TokenPolicy::Required)
            .build();
        let handle = request.response_handle();
        scheduler.attempt_to_enqueue(move || Some(request));
        assert!(handle.response().await.is_success());

        let mut anonymous = Request::builder(Method::Get, "/status")
            .token_policy(TokenPolicy::None)
            .build();
        let handle = anonymous.response_handle();
        scheduler.attempt_to_enqueue(move || Some(anonymous));
        handle.response().await;

        let sent = transport.sent();
        assert_eq!(sent[0].token.as_deref(), Some("fresh"));
        assert_eq!(sent[1].token, None);
    }

    #[tokio::test]
    async fn unauthorized_resend_once() {
        let transport = Arc::new(MockTransport::new());
        transport.push_reply("/self", MockReply::status(401));
        let scheduler = scheduler(2, transport.clone());
        scheduler
            .tokens()
            .set_token(AccessToken::bearer("stale", Duration::from_secs(3600)));

        let mut request = Request::get("/self");
        let handle = request.response_handle();
        scheduler.attempt_to_enqueue(move || Some(request));

        assert!(handle.response().await.is_success());
        let tokens: Vec<_> = transport.sent().into_iter().map(|r| r.token).collect();
        assert_eq!(tokens, vec![Some("stale".into()), Some("fresh".into())]);
    }

    #[tokio::test]
    async fn request_expires_without_network_answer() {
        let transport = Arc::new(MockTransport::new());
        transport.pause();
        let scheduler = scheduler(1, transport);

        let mut request = Request::builder(Method::Get, "/slow")
            .expires_in(Duration::from_millis(30))
            .build();
        let handle = request.response_handle();
        scheduler.attempt_to_enqueue(move || Some(request));

        let response = handle.response().await;
        assert_eq!(response.error(), Some(&TransportError::Expired));
        tokio::task::yield_now().await;
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_by_id() {
        let transport = Arc::new(MockTransport::new());
        transport.pause();
        let scheduler = scheduler(1, transport);

        let mut request = Request::get("/slow");
        let id = request.id();
        let handle = request.response_handle();
        scheduler.attempt_to_enqueue(move || Some(request));

        assert!(scheduler.cancel(id));
        assert!(handle.response().await.is_cancelled());
        assert!(!scheduler.cancel(id));
    }

    #[tokio::test]
    async fn one_time_request_waits_for_slot() {
        let transport = Arc::new(MockTransport::new());
        transport.pause();
        let scheduler = scheduler(1, transport.clone());

        scheduler.attempt_to_enqueue(|| Some(Request::get("/first")));
        let mut second = Request::get("/second");
        let handle = second.response_handle();
        scheduler.enqueue_one_time(second);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.sent_count(), 1);

        transport.resume();
        assert!(handle.response().await.is_success());
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn rate_limit_holds_off_then_retries_singly() {
        let transport = Arc::new(MockTransport::new());
        transport.push_reply(
            "/busy",
            MockReply::status(429).retry_after(Duration::from_millis(50)),
        );
        let tokens = AccessTokenManager::new(Arc::new(StaticRefresher));
        let config = TransportConfig::new(4).with_rate_limit_backoff(
            crate::config::RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        );
        let scheduler = RequestScheduler::new(
            config,
            transport.clone(),
            tokens,
            Arc::new(ReachabilityMonitor::online()),
        )
        .unwrap();

        let mut request = Request::get("/busy");
        let handle = request.response_handle();
        scheduler.attempt_to_enqueue(move || Some(request));
        assert!(handle.response().await.is_rate_limited());

        assert_eq!(scheduler.rate_limit_state(), RateLimitState::HoldingOff);
        assert!(!scheduler.attempt_to_enqueue(|| Some(Request::get("/a"))).generated);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.rate_limit_state(), RateLimitState::Retrying);

        transport.pause();
        let result = scheduler.attempt_to_enqueue(|| Some(Request::get("/a")));
        assert!(result.generated);
        assert!(!result.has_capacity);
        transport.resume();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.rate_limit_state(), RateLimitState::Normal);
    }

    #[tokio::test]
    async fn loop_detection_fires_once_per_window() {
        let transport = Arc::new(MockTransport::new());
        let tokens = AccessTokenManager::new(Arc::new(StaticRefresher));
        let config = TransportConfig::new(8).with_loop_detection(Some(LoopDetectionConfig {
            threshold: 3,
            window: Duration::from_secs(60),
        }));
        let scheduler = RequestScheduler::new(
            config,
            transport,
            tokens,
            Arc::new(ReachabilityMonitor::online()),
        )
        .unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        scheduler.set_request_loop_detection_callback(move |path| sink.lock().push(path.to_string()));

        for _ in 0..6 {
            let mut request = Request::get("/notifications");
            let handle = request.response_handle();
            scheduler.attempt_to_enqueue(move || Some(request));
            handle.response().await;
        }

        assert_eq!(*fired.lock(), vec!["/notifications".to_string()]);
    }
}
