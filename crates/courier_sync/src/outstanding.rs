//! Outstanding-item tracking.
//!
//! Every transcoder keeps the units of work it still owes the backend in an
//! [`OutstandingItems`] set. An item is either pending (waiting to be turned
//! into a request, possibly parked until a retry deadline) or in flight
//! (attributed to exactly one admitted request). Failed requests are
//! classified here so all transcoders share one retry policy.

use courier_transport::{RequestId, RetryConfig, TransportError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use tokio::time::Instant;

/// Synchronization state of one transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing to do.
    Idle,
    /// Work is waiting for a request slot.
    HasOutstandingItems,
    /// At least one request is in flight.
    RequestInFlight,
}

impl SyncState {
    /// Returns true if the transcoder is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

/// What happened to an item whose request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The item is pending again and becomes eligible at `at`.
    Retry {
        /// Earliest time of the next attempt.
        at: Instant,
    },
    /// The item was dropped.
    GaveUp,
}

/// Pending and in-flight work items of one transcoder.
#[derive(Debug)]
pub struct OutstandingItems<K> {
    retry: RetryConfig,
    pending: VecDeque<K>,
    in_flight: HashMap<RequestId, K>,
    in_flight_keys: HashMap<K, RequestId>,
    /// Items changed again while their request was in flight.
    redirtied: HashSet<K>,
    attempts: HashMap<K, u32>,
    parked_until: HashMap<K, Instant>,
}

impl<K: Clone + Eq + Hash> OutstandingItems<K> {
    /// Creates an empty set using `retry` for failed requests.
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            in_flight_keys: HashMap::new(),
            redirtied: HashSet::new(),
            attempts: HashMap::new(),
            parked_until: HashMap::new(),
        }
    }

    /// Returns the retry policy.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Adds an item. Returns true if it became pending.
    ///
    /// An item that is in flight is remembered and re-queued once its
    /// request completes.
    pub fn add(&mut self, key: K) -> bool {
        if self.in_flight_keys.contains_key(&key) {
            self.redirtied.insert(key);
            return false;
        }
        if self.pending.contains(&key) {
            return false;
        }
        self.pending.push_back(key);
        true
    }

    /// Drops a pending item. Returns true if it was pending.
    ///
    /// In-flight items stay attributed to their request.
    pub fn remove(&mut self, key: &K) -> bool {
        self.redirtied.remove(key);
        let Some(index) = self.pending.iter().position(|k| k == key) else {
            return false;
        };
        self.pending.remove(index);
        self.attempts.remove(key);
        self.parked_until.remove(key);
        true
    }

    /// Returns true if the item is pending or in flight.
    pub fn contains(&self, key: &K) -> bool {
        self.in_flight_keys.contains_key(key) || self.pending.contains(key)
    }

    /// Returns the request currently carrying `key`.
    pub fn request_for(&self, key: &K) -> Option<RequestId> {
        self.in_flight_keys.get(key).copied()
    }

    /// Returns the item carried by `request_id`.
    pub fn item_for(&self, request_id: RequestId) -> Option<&K> {
        self.in_flight.get(&request_id)
    }

    /// Returns the pending items eligible at `now`, in queue order.
    pub fn ready(&self, now: Instant) -> Vec<K> {
        self.pending
            .iter()
            .filter(|k| self.parked_until.get(*k).map_or(true, |at| *at <= now))
            .cloned()
            .collect()
    }

    /// Moves a pending item in flight under `request_id`.
    pub fn start(&mut self, key: K, request_id: RequestId) {
        if let Some(index) = self.pending.iter().position(|k| *k == key) {
            self.pending.remove(index);
        }
        self.parked_until.remove(&key);
        self.in_flight_keys.insert(key.clone(), request_id);
        self.in_flight.insert(request_id, key);
    }

    fn finish(&mut self, request_id: RequestId) -> Option<K> {
        let key = self.in_flight.remove(&request_id)?;
        self.in_flight_keys.remove(&key);
        Some(key)
    }

    fn requeue_if_redirtied(&mut self, key: &K) {
        if self.redirtied.remove(key) {
            self.pending.push_back(key.clone());
        }
    }

    /// Completes a request successfully.
    pub fn succeed(&mut self, request_id: RequestId) -> Option<K> {
        let key = self.finish(request_id)?;
        self.attempts.remove(&key);
        self.requeue_if_redirtied(&key);
        Some(key)
    }

    /// Drops the item of a permanently rejected request.
    pub fn reject(&mut self, request_id: RequestId) -> Option<K> {
        let key = self.finish(request_id)?;
        self.attempts.remove(&key);
        self.requeue_if_redirtied(&key);
        Some(key)
    }

    /// Classifies a failed request and reschedules or drops its item.
    pub fn fail(
        &mut self,
        request_id: RequestId,
        error: &TransportError,
        now: Instant,
    ) -> Option<(K, Disposition)> {
        let key = self.finish(request_id)?;
        let attempts = self.attempts.get(&key).copied().unwrap_or(0);

        let disposition = match error {
            TransportError::TryAgainLater { retry_after } => {
                let backoff = self.retry.delay_for_attempt(attempts + 1);
                let wait = retry_after.unwrap_or_default().max(backoff);
                Disposition::Retry { at: now + wait }
            }
            TransportError::AuthenticationFailed(_) => Disposition::Retry {
                at: now + self.retry.delay_for_attempt(attempts + 1),
            },
            TransportError::Cancelled => Disposition::Retry { at: now },
            TransportError::Expired | TransportError::TransportFailure { retryable: true, .. } => {
                let attempts = attempts + 1;
                if self.retry.allows_attempt(attempts) {
                    self.attempts.insert(key.clone(), attempts);
                    Disposition::Retry {
                        at: now + self.retry.delay_for_attempt(attempts),
                    }
                } else {
                    Disposition::GaveUp
                }
            }
            TransportError::TransportFailure {
                retryable: false, ..
            } => Disposition::GaveUp,
        };

        match disposition {
            Disposition::Retry { at } => {
                self.redirtied.remove(&key);
                if at > now {
                    self.parked_until.insert(key.clone(), at);
                }
                // Retried work goes before anything queued behind it.
                self.pending.push_front(key.clone());
            }
            Disposition::GaveUp => {
                self.attempts.remove(&key);
                self.parked_until.remove(&key);
                self.requeue_if_redirtied(&key);
            }
        }
        Some((key, disposition))
    }

    /// Returns the number of failed attempts recorded for `key`.
    pub fn attempts(&self, key: &K) -> u32 {
        self.attempts.get(key).copied().unwrap_or(0)
    }

    /// Returns the number of pending items.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of in-flight requests.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if items are pending.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns true if requests are in flight.
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Returns true if nothing is pending or in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Returns the earliest future time a parked item becomes eligible.
    pub fn next_retry_deadline(&self, now: Instant) -> Option<Instant> {
        self.pending
            .iter()
            .filter_map(|k| self.parked_until.get(k))
            .filter(|at| **at > now)
            .min()
            .copied()
    }

    /// Derives the synchronization state.
    pub fn sync_state(&self) -> SyncState {
        if self.has_in_flight() {
            SyncState::RequestInFlight
        } else if self.has_pending() {
            SyncState::HasOutstandingItems
        } else {
            SyncState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn retry() -> RetryConfig {
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false)
    }

    #[test]
    fn state_follows_items() {
        let mut items = OutstandingItems::new(retry());
        assert_eq!(items.sync_state(), SyncState::Idle);

        items.add("a");
        assert_eq!(items.sync_state(), SyncState::HasOutstandingItems);

        let id = RequestId::new();
        items.start("a", id);
        assert_eq!(items.sync_state(), SyncState::RequestInFlight);

        assert_eq!(items.succeed(id), Some("a"));
        assert_eq!(items.sync_state(), SyncState::Idle);
    }

    #[test]
    fn change_during_flight_requeues_after_success() {
        let mut items = OutstandingItems::new(retry());
        items.add("a");
        let id = RequestId::new();
        items.start("a", id);

        assert!(!items.add("a"));
        assert_eq!(items.pending_len(), 0);

        items.succeed(id);
        assert_eq!(items.ready(Instant::now()), vec!["a"]);
    }

    #[test]
    fn retryable_failures_back_off_then_give_up() {
        let mut items = OutstandingItems::new(retry());
        let now = Instant::now();
        items.add("a");

        for attempt in 1..3 {
            let id = RequestId::new();
            items.start("a", id);
            let (_, disposition) = items
                .fail(id, &TransportError::network("reset"), now)
                .unwrap();
            assert!(matches!(disposition, Disposition::Retry { at } if at > now));
            assert_eq!(items.attempts(&"a"), attempt);
            assert!(items.ready(now).is_empty());
            assert!(items.next_retry_deadline(now).is_some());
        }

        let id = RequestId::new();
        items.start("a", id);
        let (_, disposition) = items.fail(id, &TransportError::Expired, now).unwrap();
        assert_eq!(disposition, Disposition::GaveUp);
        assert!(items.is_empty());
    }

    #[test]
    fn rate_limit_waits_for_retry_after_without_counting() {
        let mut items = OutstandingItems::new(retry());
        let now = Instant::now();
        items.add("a");
        let id = RequestId::new();
        items.start("a", id);

        let error = TransportError::TryAgainLater {
            retry_after: Some(Duration::from_secs(5)),
        };
        let (_, disposition) = items.fail(id, &error, now).unwrap();
        assert_eq!(
            disposition,
            Disposition::Retry {
                at: now + Duration::from_secs(5)
            }
        );
        assert_eq!(items.attempts(&"a"), 0);
    }

    #[test]
    fn cancelled_item_is_ready_again() {
        let mut items = OutstandingItems::new(retry());
        let now = Instant::now();
        items.add("a");
        items.add("b");
        let id = RequestId::new();
        items.start("a", id);

        items.fail(id, &TransportError::Cancelled, now);
        assert_eq!(items.ready(now), vec!["a", "b"]);
    }

    #[test]
    fn fatal_failure_gives_up_immediately() {
        let mut items = OutstandingItems::new(retry());
        items.add("a");
        let id = RequestId::new();
        items.start("a", id);

        let (_, disposition) = items
            .fail(id, &TransportError::fatal("bad certificate"), Instant::now())
            .unwrap();
        assert_eq!(disposition, Disposition::GaveUp);
        assert!(!items.contains(&"a"));
    }

    #[test]
    fn unknown_request_is_ignored() {
        let mut items: OutstandingItems<&str> = OutstandingItems::new(retry());
        assert!(items.succeed(RequestId::new()).is_none());
        assert!(items
            .fail(RequestId::new(), &TransportError::Expired, Instant::now())
            .is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Remove(u8),
        Start(u8),
        Succeed(usize),
        Fail(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Add),
            (0u8..6).prop_map(Op::Remove),
            (0u8..6).prop_map(Op::Start),
            any::<usize>().prop_map(Op::Succeed),
            any::<usize>().prop_map(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn an_item_is_never_pending_and_in_flight(ops in prop::collection::vec(op(), 1..60)) {
            let mut items = OutstandingItems::new(retry());
            let mut requests: Vec<RequestId> = Vec::new();
            let now = Instant::now();

            for op in ops {
                match op {
                    Op::Add(k) => { items.add(k); }
                    Op::Remove(k) => { items.remove(&k); }
                    Op::Start(k) => {
                        if items.ready(now).contains(&k) {
                            let id = RequestId::new();
                            items.start(k, id);
                            requests.push(id);
                        }
                    }
                    Op::Succeed(i) if !requests.is_empty() => {
                        let id = requests.remove(i % requests.len());
                        items.succeed(id);
                    }
                    Op::Fail(i) if !requests.is_empty() => {
                        let id = requests.remove(i % requests.len());
                        items.fail(id, &TransportError::network("x"), now);
                    }
                    _ => {}
                }

                for key in items.pending.iter() {
                    prop_assert!(!items.in_flight_keys.contains_key(key));
                }
                prop_assert_eq!(items.in_flight.len(), items.in_flight_keys.len());
                prop_assert_eq!(items.in_flight.len(), requests.len());
            }
        }
    }
}
