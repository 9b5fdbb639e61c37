//! # Courier Transport
//!
//! Network side of the Courier sync engine.
//!
//! This crate provides:
//! - Request descriptors with channel-based completion and cancellation
//! - A request scheduler with a concurrency ceiling, deadlines and rate limiting
//! - An access token manager that coalesces refreshes
//! - Background-session continuation through a durable recovery log
//! - A reconnecting push channel with ordered, de-duplicated delivery
//! - Transport abstractions (HTTP adapter, mock, loopback)
//!
//! ## Key Invariants
//!
//! - In-flight requests never exceed the configured ceiling
//! - Every admitted request resolves exactly once
//! - No token-requiring request is sent without a token
//! - At most one token refresh runs at a time
//! - Push events reach the consumer in order, once each

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod push;
mod reachability;
mod recovery;
mod request;
mod response;
mod scheduler;
mod token;
mod transport;

pub use config::{LoopDetectionConfig, PushChannelConfig, RetryConfig, TransportConfig};
pub use error::{RecoveryLogError, TransportError, TransportResult};
pub use http::{HttpClient, HttpRequest, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer};
pub use push::{
    DeliveryQueue, LoopbackPushConnector, PushChannel, PushChannelConsumer, PushConnection,
    PushConnector, PushEvent, PushFrame, PushStatus, WebSocketConnector,
};
pub use reachability::{NetworkState, NetworkStateDelegate, Reachability, ReachabilityMonitor};
pub use recovery::{RecoveredResponse, RecoveryEntry, RecoveryLog, RecoveryResult};
pub use request::{
    Canceller, Method, Payload, Priority, Request, RequestBuilder, RequestId, ResponseHandle,
    TokenPolicy,
};
pub use response::{EnqueueResult, Response};
pub use scheduler::{RateLimitState, RequestScheduler};
pub use token::{AccessEndpointRefresher, AccessToken, AccessTokenManager, TokenRefresher};
pub use transport::{
    BackgroundTask, BackgroundTaskState, BackgroundTicket, MockReply, MockTransport, SentRequest,
    Transport,
};
