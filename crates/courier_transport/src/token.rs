//! Access token ownership and refresh coordination.
//!
//! The [`AccessTokenManager`] is the only place the current token lives. Any
//! number of callers may ask for a token at once; while none is valid they are
//! parked in submission order and a single refresh runs on their behalf.

use crate::error::{TransportError, TransportResult};
use crate::request::{Method, Request, TokenPolicy};
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// A bearer credential with an expiry.
#[derive(Clone)]
pub struct AccessToken {
    value: Zeroizing<String>,
    token_type: String,
    expires_at: Instant,
}

impl AccessToken {
    /// Creates a token that expires `expires_in` from now.
    pub fn new(value: impl Into<String>, token_type: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            token_type: token_type.into(),
            expires_at: Instant::now() + expires_in,
        }
    }

    /// Creates a bearer token.
    pub fn bearer(value: impl Into<String>, expires_in: Duration) -> Self {
        Self::new(value, "Bearer", expires_in)
    }

    /// Returns the secret value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the token type, usually `Bearer`.
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Returns when the token stops being valid.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Returns true if the token expires within `leeway`.
    pub fn expires_within(&self, leeway: Duration) -> bool {
        Instant::now() + leeway >= self.expires_at
    }

    /// Returns the value for an `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.value.as_str())
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.value.as_str() == other.value.as_str() && self.token_type == other.token_type
    }
}

impl Eq for AccessToken {}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Obtains a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Fetches a new token. `previous` is the token being replaced, if any.
    async fn refresh(&self, previous: Option<AccessToken>) -> TransportResult<AccessToken>;
}

type SuccessHandler = Box<dyn Fn(&AccessToken) + Send + Sync>;
type FailureHandler = Box<dyn Fn(&TransportError) + Send + Sync>;
type Waiter = oneshot::Sender<TransportResult<AccessToken>>;

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Refreshing,
    Failed(TransportError),
}

struct TokenState {
    current: Option<AccessToken>,
    phase: Phase,
    waiters: VecDeque<Waiter>,
    // Bumped whenever the token is set from outside, so stale refreshes are ignored.
    generation: u64,
}

struct Inner {
    refresher: Arc<dyn TokenRefresher>,
    refresh_leeway: Duration,
    state: Mutex<TokenState>,
    on_success: Mutex<Vec<SuccessHandler>>,
    on_failure: Mutex<Vec<FailureHandler>>,
}

/// Owns the current access token and coordinates refreshes.
///
/// Cloning the manager yields another handle to the same token.
#[derive(Clone)]
pub struct AccessTokenManager {
    inner: Arc<Inner>,
}

impl AccessTokenManager {
    /// Creates a manager with no token.
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::with_refresh_leeway(refresher, Duration::from_secs(30))
    }

    /// Creates a manager that treats tokens expiring within `leeway` as absent.
    pub fn with_refresh_leeway(refresher: Arc<dyn TokenRefresher>, leeway: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                refresh_leeway: leeway,
                state: Mutex::new(TokenState {
                    current: None,
                    phase: Phase::Idle,
                    waiters: VecDeque::new(),
                    generation: 0,
                }),
                on_success: Mutex::new(Vec::new()),
                on_failure: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the refresh leeway.
    pub fn refresh_leeway(&self) -> Duration {
        self.inner.refresh_leeway
    }

    /// Registers a handler called after every successful refresh.
    pub fn on_refresh_success<F>(&self, handler: F)
    where
        F: Fn(&AccessToken) + Send + Sync + 'static,
    {
        self.inner.on_success.lock().push(Box::new(handler));
    }

    /// Registers a handler called once per failed refresh.
    pub fn on_refresh_failure<F>(&self, handler: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.inner.on_failure.lock().push(Box::new(handler));
    }

    /// Returns the current token if it is valid.
    pub fn current_token(&self) -> Option<AccessToken> {
        let state = self.inner.state.lock();
        self.valid(&state).cloned()
    }

    /// Returns true while a refresh is running.
    pub fn is_refreshing(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Refreshing)
    }

    /// Returns true if the last refresh failed and no token was set since.
    pub fn has_failed(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Failed(_))
    }

    /// Returns a valid token, waiting for a refresh if needed.
    ///
    /// Fails immediately after a failed refresh, until [`set_token`] supplies
    /// a new token.
    ///
    /// [`set_token`]: AccessTokenManager::set_token
    pub async fn acquire(&self) -> TransportResult<AccessToken> {
        let receiver = {
            let mut state = self.inner.state.lock();
            if let Some(token) = self.valid(&state) {
                return Ok(token.clone());
            }
            if let Phase::Failed(err) = &state.phase {
                return Err(err.clone());
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            if matches!(state.phase, Phase::Idle) {
                self.start_refresh(&mut state);
            }
            receiver
        };
        Self::wait(receiver).await
    }

    /// Forces a refresh and waits for its result. Joins a running refresh
    /// instead of starting a second one.
    pub async fn refresh(&self) -> TransportResult<AccessToken> {
        let receiver = {
            let mut state = self.inner.state.lock();
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            if !matches!(state.phase, Phase::Refreshing) {
                self.start_refresh(&mut state);
            }
            receiver
        };
        Self::wait(receiver).await
    }

    /// Marks `token` as rejected by the backend and starts a refresh.
    ///
    /// Does nothing if the token was already replaced, so concurrent
    /// rejections of the same token cause one refresh.
    pub fn invalidate(&self, token: &AccessToken) {
        let mut state = self.inner.state.lock();
        if state.current.as_ref() != Some(token) {
            return;
        }
        debug!("access token rejected, refreshing");
        state.current = None;
        if matches!(state.phase, Phase::Idle) {
            self.start_refresh(&mut state);
        }
    }

    /// Installs a token supplied from outside, releasing parked callers.
    pub fn set_token(&self, token: AccessToken) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.current = Some(token.clone());
            state.phase = Phase::Idle;
            std::mem::take(&mut state.waiters)
        };
        info!(parked = waiters.len(), "access token set");
        for waiter in waiters {
            let _ = waiter.send(Ok(token.clone()));
        }
    }

    /// Drops the current token and fails parked callers.
    pub fn clear(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.current = None;
            state.phase = Phase::Idle;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::AuthenticationFailed(
                "access token cleared".into(),
            )));
        }
    }

    fn valid<'a>(&self, state: &'a TokenState) -> Option<&'a AccessToken> {
        state
            .current
            .as_ref()
            .filter(|token| !token.expires_within(self.inner.refresh_leeway))
    }

    fn start_refresh(&self, state: &mut TokenState) {
        state.phase = Phase::Refreshing;
        let generation = state.generation;
        let previous = state.current.clone();
        let inner = Arc::clone(&self.inner);
        debug!(parked = state.waiters.len(), "starting access token refresh");
        tokio::spawn(async move {
            let result = inner.refresher.refresh(previous).await;
            inner.finish_refresh(generation, result);
        });
    }

    async fn wait(
        receiver: oneshot::Receiver<TransportResult<AccessToken>>,
    ) -> TransportResult<AccessToken> {
        receiver.await.unwrap_or_else(|_| {
            Err(TransportError::AuthenticationFailed(
                "token refresh abandoned".into(),
            ))
        })
    }
}

impl Inner {
    fn finish_refresh(&self, generation: u64, result: TransportResult<AccessToken>) {
        let result = result.map_err(|err| match err {
            TransportError::AuthenticationFailed(_) => err,
            other => TransportError::AuthenticationFailed(other.to_string()),
        });

        let waiters = {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!("discarding stale token refresh result");
                return;
            }
            match &result {
                Ok(token) => {
                    state.current = Some(token.clone());
                    state.phase = Phase::Idle;
                }
                Err(err) => {
                    state.current = None;
                    state.phase = Phase::Failed(err.clone());
                }
            }
            std::mem::take(&mut state.waiters)
        };

        match &result {
            Ok(token) => {
                info!(released = waiters.len(), "access token refreshed");
                for waiter in waiters {
                    let _ = waiter.send(Ok(token.clone()));
                }
                for handler in self.on_success.lock().iter() {
                    handler(token);
                }
            }
            Err(err) => {
                warn!(error = %err, failed = waiters.len(), "access token refresh failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                for handler in self.on_failure.lock().iter() {
                    handler(err);
                }
            }
        }
    }
}

impl fmt::Debug for AccessTokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AccessTokenManager")
            .field("has_token", &state.current.is_some())
            .field("phase", &state.phase)
            .field("parked", &state.waiters.len())
            .finish()
    }
}

#[derive(Deserialize)]
struct AccessEndpointBody {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".into()
}

/// Refreshes tokens by posting to an access endpoint.
///
/// The endpoint answers `{"access_token": .., "token_type": .., "expires_in": ..}`.
pub struct AccessEndpointRefresher {
    transport: Arc<dyn Transport>,
    path: String,
    credentials: Option<serde_json::Value>,
}

impl AccessEndpointRefresher {
    /// Creates a refresher posting to `path`.
    pub fn new(transport: Arc<dyn Transport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
            credentials: None,
        }
    }

    /// Sends `credentials` as the request body.
    pub fn with_credentials(mut self, credentials: serde_json::Value) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[async_trait]
impl TokenRefresher for AccessEndpointRefresher {
    async fn refresh(&self, previous: Option<AccessToken>) -> TransportResult<AccessToken> {
        let mut builder = Request::builder(Method::Post, self.path.as_str())
            .token_policy(TokenPolicy::None)
            .tag("access-token");
        if let Some(credentials) = &self.credentials {
            builder = builder.json(credentials.clone());
        }
        let request = builder.build();

        // The endpoint may accept the expired token as proof of the session.
        let response = self.transport.send(&request, previous.as_ref(), None).await;
        if let Some(err) = response.error() {
            return Err(err.clone());
        }
        if !response.is_success() {
            return Err(TransportError::AuthenticationFailed(format!(
                "access endpoint answered {}",
                response.status().unwrap_or(0)
            )));
        }

        let json = response.json().ok_or_else(|| {
            TransportError::AuthenticationFailed("access endpoint sent no body".into())
        })?;
        let body: AccessEndpointBody = serde_json::from_value(json.clone())
            .map_err(|e| TransportError::AuthenticationFailed(format!("bad token body: {e}")))?;

        Ok(AccessToken::new(
            body.access_token,
            body.token_type,
            Duration::from_secs(body.expires_in),
        ))
    }
}
