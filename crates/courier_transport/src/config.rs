//! Configuration for the transport layer.

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the request scheduler.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum number of requests in flight at the same time.
    pub maximum_concurrent_requests: usize,
    /// Expiration applied to requests that do not carry their own.
    pub default_request_expiration: Duration,
    /// Backoff used after the backend answers "try again later".
    pub rate_limit_backoff: RetryConfig,
    /// Request loop detection, disabled when `None`.
    pub loop_detection: Option<LoopDetectionConfig>,
    /// Identifier of the background session used while suspending.
    pub background_session_identifier: String,
    /// Where the background recovery log lives, if background continuation
    /// is enabled.
    pub recovery_log_path: Option<PathBuf>,
}

impl TransportConfig {
    /// Creates a configuration with the given concurrency ceiling.
    pub fn new(maximum_concurrent_requests: usize) -> Self {
        Self {
            maximum_concurrent_requests: maximum_concurrent_requests.max(1),
            default_request_expiration: Duration::from_secs(60),
            rate_limit_backoff: RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
            loop_detection: Some(LoopDetectionConfig::default()),
            background_session_identifier: "courier.background".into(),
            recovery_log_path: None,
        }
    }

    /// Sets the default request expiration.
    pub fn with_default_expiration(mut self, expiration: Duration) -> Self {
        self.default_request_expiration = expiration;
        self
    }

    /// Sets the rate-limit backoff.
    pub fn with_rate_limit_backoff(mut self, backoff: RetryConfig) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    /// Sets or disables request loop detection.
    pub fn with_loop_detection(mut self, config: Option<LoopDetectionConfig>) -> Self {
        self.loop_detection = config;
        self
    }

    /// Enables background continuation with a recovery log at `path`.
    pub fn with_background_session(
        mut self,
        identifier: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        self.background_session_identifier = identifier.into();
        self.recovery_log_path = Some(path.into());
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Configuration for request loop detection.
#[derive(Debug, Clone)]
pub struct LoopDetectionConfig {
    /// Number of identical requests tolerated inside the window.
    pub threshold: usize,
    /// Length of the observation window.
    pub window: Duration,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            window: Duration::from_secs(60),
        }
    }
}

/// Configuration for the push channel.
#[derive(Debug, Clone)]
pub struct PushChannelConfig {
    /// Maximum number of events held while no consumer is configured.
    pub buffer_capacity: usize,
    /// Number of recent notification ids remembered for de-duplication.
    pub dedup_window: usize,
    /// Reconnect backoff.
    pub reconnect: RetryConfig,
    /// Whether the connection needs an access token.
    pub requires_token: bool,
}

impl PushChannelConfig {
    /// Creates a push channel configuration with default values.
    pub fn new() -> Self {
        Self {
            buffer_capacity: 1024,
            dedup_window: 512,
            reconnect: RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
            requires_token: true,
        }
    }

    /// Sets the buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets whether an access token is attached to the connection.
    pub fn with_requires_token(mut self, requires_token: bool) -> Self {
        self.requires_token = requires_token;
        self
    }
}

impl Default for PushChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempts` failures.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
