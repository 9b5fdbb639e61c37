//! Transcoder registry and the polling strategy built on it.
//!
//! The registry fixes the order in which transcoders are asked for work:
//! by [`Tier`](crate::Tier), then by registration order. The
//! [`SyncStrategy`] walks that order on every poll, attributes admitted
//! requests to their transcoder and hands responses back in admission
//! order.

use crate::error::{SyncError, SyncResult};
use crate::outstanding::SyncState;
use crate::store::{ChangeSet, ObjectStore};
use crate::transcoder::Transcoder;
use courier_transport::{
    EnqueueResult, PushEvent, RecoveredResponse, RequestId, RequestScheduler, Response,
    ResponseHandle,
};
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Transcoders in polling order.
#[derive(Default)]
pub struct TranscoderRegistry {
    transcoders: Vec<Box<dyn Transcoder>>,
}

impl TranscoderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transcoder after every registered transcoder of the same or
    /// a lower tier.
    pub fn register(&mut self, transcoder: Box<dyn Transcoder>) {
        let tier = transcoder.tier();
        let position = self
            .transcoders
            .iter()
            .position(|t| t.tier() > tier)
            .unwrap_or(self.transcoders.len());
        debug!(name = transcoder.name(), ?tier, position, "registering transcoder");
        self.transcoders.insert(position, transcoder);
    }

    /// Returns the transcoder names in polling order.
    pub fn order(&self) -> Vec<&str> {
        self.transcoders.iter().map(|t| t.name()).collect()
    }

    /// Returns the number of transcoders.
    pub fn len(&self) -> usize {
        self.transcoders.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.transcoders.is_empty()
    }

    /// Returns the transcoder at `index` in polling order.
    pub fn get(&self, index: usize) -> Option<&dyn Transcoder> {
        self.transcoders.get(index).map(|t| t.as_ref())
    }

    /// Iterates in polling order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Transcoder> {
        self.transcoders.iter().map(|t| t.as_ref())
    }
}

impl std::fmt::Debug for TranscoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.order()).finish()
    }
}

/// Releases responses of each transcoder in the order its requests were
/// admitted, holding back early arrivals.
#[derive(Debug, Default)]
pub struct ResponseSequencer {
    lanes: Vec<Lane>,
}

#[derive(Debug, Default)]
struct Lane {
    next_admission: u64,
    next_release: u64,
    held: BTreeMap<u64, Response>,
}

impl ResponseSequencer {
    /// Creates a sequencer for `transcoders` lanes.
    pub fn new(transcoders: usize) -> Self {
        Self {
            lanes: (0..transcoders).map(|_| Lane::default()).collect(),
        }
    }

    /// Assigns the next admission number of a transcoder.
    pub fn admit(&mut self, transcoder: usize) -> u64 {
        let lane = self.lane(transcoder);
        let sequence = lane.next_admission;
        lane.next_admission += 1;
        sequence
    }

    /// Accepts a response and returns every response now ready, in order.
    ///
    /// A sequence number that was already released is ignored.
    pub fn arrive(&mut self, transcoder: usize, sequence: u64, response: Response) -> Vec<Response> {
        let lane = self.lane(transcoder);
        if sequence < lane.next_release || lane.held.contains_key(&sequence) {
            warn!(transcoder, sequence, "duplicate response ignored");
            return Vec::new();
        }
        lane.held.insert(sequence, response);

        let mut ready = Vec::new();
        while let Some(response) = lane.held.remove(&lane.next_release) {
            ready.push(response);
            lane.next_release += 1;
        }
        if !lane.held.is_empty() {
            trace!(transcoder, held = lane.held.len(), "holding early responses");
        }
        ready
    }

    /// Returns the number of responses held back.
    pub fn held(&self) -> usize {
        self.lanes.iter().map(|l| l.held.len()).sum()
    }

    fn lane(&mut self, transcoder: usize) -> &mut Lane {
        if transcoder >= self.lanes.len() {
            self.lanes.resize_with(transcoder + 1, Lane::default);
        }
        &mut self.lanes[transcoder]
    }
}

/// A request admitted during a poll.
#[derive(Debug)]
pub struct Admission {
    /// Index of the producing transcoder in polling order.
    pub transcoder: usize,
    /// Admission number within that transcoder.
    pub sequence: u64,
    /// Handle resolving with the response.
    pub handle: ResponseHandle,
}

/// Outcome of [`SyncStrategy::poll`].
#[derive(Debug)]
pub struct PollOutcome {
    /// What the scheduler reported.
    pub enqueue: EnqueueResult,
    /// The admitted request, if one was generated.
    pub admitted: Option<Admission>,
}

impl PollOutcome {
    /// Returns true if polling again may admit more work.
    pub fn should_continue(&self) -> bool {
        self.enqueue.should_continue()
    }
}

/// Drives a [`TranscoderRegistry`] against a [`RequestScheduler`].
///
/// Not thread safe on purpose: a single owner (the engine actor) calls
/// every method, so generator callbacks and response application never race.
#[derive(Debug)]
pub struct SyncStrategy {
    registry: TranscoderRegistry,
    sequencer: ResponseSequencer,
    adopted: HashMap<RequestId, usize>,
}

impl SyncStrategy {
    /// Creates a strategy over `registry`.
    pub fn new(registry: TranscoderRegistry) -> Self {
        let sequencer = ResponseSequencer::new(registry.len());
        Self {
            registry,
            sequencer,
            adopted: HashMap::new(),
        }
    }

    /// Returns the registry.
    pub fn registry(&self) -> &TranscoderRegistry {
        &self.registry
    }

    /// Lets every transcoder scan the store for leftover work.
    pub fn bootstrap(&mut self, store: &dyn ObjectStore) -> SyncResult<()> {
        for transcoder in &mut self.registry.transcoders {
            transcoder.bootstrap(store)?;
            debug!(name = transcoder.name(), state = ?transcoder.sync_state(), "bootstrapped");
        }
        Ok(())
    }

    /// Offers the scheduler one request.
    ///
    /// Transcoders are asked in polling order; a transcoder that declines
    /// passes the slot to the next one.
    pub fn poll(
        &mut self,
        scheduler: &RequestScheduler,
        store: &dyn ObjectStore,
    ) -> SyncResult<PollOutcome> {
        let now = Instant::now();
        let transcoders = &mut self.registry.transcoders;
        let mut failure: Option<SyncError> = None;
        let mut produced: Option<(usize, ResponseHandle)> = None;

        let enqueue = scheduler.attempt_to_enqueue(|| {
            for (index, transcoder) in transcoders.iter_mut().enumerate() {
                if !transcoder.has_outstanding_items() {
                    continue;
                }
                match transcoder.next_request(store, now) {
                    Ok(Some(mut request)) => {
                        trace!(
                            name = transcoder.name(),
                            request_id = %request.id(),
                            path = request.path(),
                            "request generated"
                        );
                        produced = Some((index, request.response_handle()));
                        return Some(request);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        failure = Some(err);
                        return None;
                    }
                }
            }
            None
        });

        if let Some(err) = failure {
            return Err(err);
        }
        let admitted = produced.map(|(transcoder, handle)| Admission {
            transcoder,
            sequence: self.sequencer.admit(transcoder),
            handle,
        });
        Ok(PollOutcome { enqueue, admitted })
    }

    /// Passes a response through the sequencer and applies whatever it
    /// releases.
    pub fn response_arrived(
        &mut self,
        store: &dyn ObjectStore,
        transcoder: usize,
        sequence: u64,
        response: Response,
    ) -> SyncResult<()> {
        let ready = self.sequencer.arrive(transcoder, sequence, response);
        let Some(target) = self.registry.transcoders.get_mut(transcoder) else {
            warn!(transcoder, "response for unknown transcoder");
            return Ok(());
        };
        let now = Instant::now();
        for response in ready {
            target.apply_response(store, &response, now)?;
        }
        Ok(())
    }

    /// Forwards a store transaction to every transcoder. Returns requests
    /// that should be cancelled.
    pub fn objects_did_change(&mut self, changes: &ChangeSet) -> Vec<RequestId> {
        self.registry
            .transcoders
            .iter_mut()
            .flat_map(|t| t.objects_did_change(changes))
            .collect()
    }

    /// Applies push events, in receipt order, through every transcoder.
    pub fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()> {
        for transcoder in &mut self.registry.transcoders {
            transcoder.process_events(store, events)?;
        }
        Ok(())
    }

    /// Finds the transcoder that issued a background request in a previous
    /// run. Returns false if none claims the tag.
    pub fn adopt_recovered(&mut self, request_id: RequestId, tag: &str) -> bool {
        for (index, transcoder) in self.registry.transcoders.iter_mut().enumerate() {
            if transcoder.adopt_recovered(request_id, tag) {
                debug!(name = transcoder.name(), %request_id, tag, "adopted recovered request");
                self.adopted.insert(request_id, index);
                return true;
            }
        }
        false
    }

    /// Applies the response of an adopted background request. Returns
    /// false if the request was never adopted.
    pub fn apply_recovered(
        &mut self,
        store: &dyn ObjectStore,
        recovered: &RecoveredResponse,
    ) -> SyncResult<bool> {
        let Some(index) = self.adopted.remove(&recovered.request_id) else {
            warn!(
                request_id = %recovered.request_id,
                path = %recovered.path,
                "recovered response with no owner"
            );
            return Ok(false);
        };
        if let Some(transcoder) = self.registry.transcoders.get_mut(index) {
            transcoder.apply_response(store, &recovered.response, Instant::now())?;
        }
        Ok(true)
    }

    /// Returns true if no transcoder has outstanding items or requests in
    /// flight.
    pub fn is_synchronization_complete(&self) -> bool {
        self.registry
            .iter()
            .all(|t| !t.has_outstanding_items() && !t.has_in_flight_requests())
    }

    /// Returns the earliest future retry deadline of any transcoder.
    pub fn next_retry_deadline(&self, now: Instant) -> Option<Instant> {
        self.registry
            .iter()
            .filter_map(|t| t.next_retry_deadline(now))
            .min()
    }

    /// Returns each transcoder's name and state, in polling order.
    pub fn states(&self) -> Vec<(&str, SyncState)> {
        self.registry
            .iter()
            .map(|t| (t.name(), t.sync_state()))
            .collect()
    }
}
