//! Transcoders and their building blocks.
//!
//! A [`Transcoder`] owns one entity category. It turns dirty objects into
//! requests, applies the responses back to the store, and consumes the push
//! events that concern it. Most transcoders are assembled from three parts:
//!
//! - [`UpstreamSync`] pushes local inserts, updates and deletes
//! - [`DownstreamSync`] fetches objects flagged as needing a pull
//! - [`PagedSync`] walks a remote listing page by page
//!
//! [`EntityTranscoder`] composes parts with an [`EventHandler`].

use crate::error::{SyncError, SyncResult};
use crate::outstanding::{Disposition, OutstandingItems, SyncState};
use crate::store::{
    ChangeBatch, ChangeOrigin, ChangeSet, EntityKind, Fields, Mutation, ObjectId, ObjectStore,
    Record,
};
use courier_transport::{PushEvent, Request, RequestBuilder, RequestId, Response, RetryConfig};
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Polling tier of a transcoder. Lower tiers are asked for requests first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Session setup (client registration).
    Session,
    /// Object graph state (users, connections, conversations).
    State,
    /// Content (messages).
    Content,
}

/// Translates one entity category between the store and the backend.
pub trait Transcoder: Send {
    /// Returns a short name, used in logs and [`TranscoderRegistry::order`](crate::TranscoderRegistry::order).
    fn name(&self) -> &str;

    /// Returns the polling tier.
    fn tier(&self) -> Tier;

    /// Scans the store for work left over from a previous run.
    fn bootstrap(&mut self, store: &dyn ObjectStore) -> SyncResult<()>;

    /// Reacts to a store transaction. Returns in-flight requests that no
    /// longer make sense and should be cancelled.
    fn objects_did_change(&mut self, changes: &ChangeSet) -> Vec<RequestId>;

    /// Returns true if work is waiting for a request slot.
    fn has_outstanding_items(&self) -> bool;

    /// Returns true if a request of this transcoder is in flight.
    fn has_in_flight_requests(&self) -> bool;

    /// Produces the next request, or declines with `None`.
    ///
    /// A returned request is always admitted, so the transcoder may
    /// consider it in flight immediately.
    fn next_request(&mut self, store: &dyn ObjectStore, now: Instant) -> SyncResult<Option<Request>>;

    /// Applies the response of a request this transcoder produced.
    fn apply_response(
        &mut self,
        store: &dyn ObjectStore,
        response: &Response,
        now: Instant,
    ) -> SyncResult<()>;

    /// Applies inbound push events.
    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()>;

    /// Claims a background request from a previous run by its tag. A claimed
    /// request's response is later passed to [`apply_response`](Self::apply_response).
    fn adopt_recovered(&mut self, _request_id: RequestId, _tag: &str) -> bool {
        false
    }

    /// Returns the earliest future time a parked item becomes eligible.
    fn next_retry_deadline(&self, now: Instant) -> Option<Instant>;

    /// Returns the current state.
    fn sync_state(&self) -> SyncState {
        if self.has_in_flight_requests() {
            SyncState::RequestInFlight
        } else if self.has_outstanding_items() {
            SyncState::HasOutstandingItems
        } else {
            SyncState::Idle
        }
    }
}

/// One building block of an [`EntityTranscoder`].
pub trait SyncPart: Send {
    /// Scans the store for work.
    fn bootstrap(&mut self, store: &dyn ObjectStore) -> SyncResult<()>;

    /// Reacts to a store transaction, returning requests to cancel.
    fn objects_did_change(&mut self, changes: &ChangeSet) -> Vec<RequestId>;

    /// Returns true if work is pending.
    fn has_pending(&self) -> bool;

    /// Returns true if a request is in flight.
    fn has_in_flight(&self) -> bool;

    /// Produces the next request.
    fn next_request(&mut self, store: &dyn ObjectStore, now: Instant) -> SyncResult<Option<Request>>;

    /// Returns true if `request_id` belongs to this part.
    fn owns(&self, request_id: RequestId) -> bool;

    /// Applies a response of a request this part owns.
    fn apply_response(
        &mut self,
        store: &dyn ObjectStore,
        response: &Response,
        now: Instant,
    ) -> SyncResult<()>;

    /// Claims a recovered background request.
    fn adopt(&mut self, _request_id: RequestId, _tag: &str) -> bool {
        false
    }

    /// Returns the earliest future retry deadline.
    fn next_retry_deadline(&self, now: Instant) -> Option<Instant>;
}

/// Consumes push events for an [`EntityTranscoder`].
pub trait EventHandler: Send {
    /// Applies the events that concern this entity category.
    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()>;
}

/// Returns the fields of a JSON object, minus `skip`.
pub fn object_fields(value: &Value, skip: &[&str]) -> Fields {
    match value {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !skip.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Fields::new(),
    }
}

/// Returns the string `id` of a JSON object.
pub fn remote_id_of(value: &Value) -> Option<String> {
    value.get("id").and_then(Value::as_str).map(str::to_string)
}

fn json_body(response: &Response) -> SyncResult<&Value> {
    response
        .json()
        .ok_or_else(|| SyncError::decode("expected a JSON body"))
}

/// A local change to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamChange {
    /// Create the object remotely with the given keys.
    Insert(Vec<String>),
    /// Update the given keys.
    Update(Vec<String>),
    /// Delete the object remotely.
    Delete,
}

impl UpstreamChange {
    /// Derives the change a record needs, if any.
    pub fn of(record: &Record) -> Option<Self> {
        let keys = || record.modified_keys().iter().cloned().collect::<Vec<_>>();
        if record.is_deleted_locally() {
            Some(UpstreamChange::Delete)
        } else if record.is_inserted_locally() {
            Some(UpstreamChange::Insert(keys()))
        } else if !record.modified_keys().is_empty() {
            Some(UpstreamChange::Update(keys()))
        } else {
            None
        }
    }

    /// Returns the keys this change pushes.
    pub fn keys(&self) -> &[String] {
        match self {
            UpstreamChange::Insert(keys) | UpstreamChange::Update(keys) => keys,
            UpstreamChange::Delete => &[],
        }
    }

    /// Encodes the change as a request tag.
    pub fn tag(&self, kind: EntityKind, id: ObjectId) -> String {
        let op = match self {
            UpstreamChange::Insert(keys) => format!("insert={}", keys.join(",")),
            UpstreamChange::Update(keys) => format!("update={}", keys.join(",")),
            UpstreamChange::Delete => "delete".to_string(),
        };
        format!("{kind}:{id}:{op}")
    }

    /// Decodes a tag produced by [`tag`](Self::tag).
    pub fn parse_tag(tag: &str) -> Option<(String, ObjectId, Self)> {
        let mut parts = tag.splitn(3, ':');
        let kind = parts.next()?.to_string();
        let id = ObjectId::parse(parts.next()?)?;
        let op = parts.next()?;
        let split_keys = |keys: &str| -> Vec<String> {
            keys.split(',')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        };
        let change = match op.split_once('=') {
            Some(("insert", keys)) => UpstreamChange::Insert(split_keys(keys)),
            Some(("update", keys)) => UpstreamChange::Update(split_keys(keys)),
            None if op == "delete" => UpstreamChange::Delete,
            _ => return None,
        };
        Some((kind, id, change))
    }
}

/// Default store updates after the backend accepted `change`.
///
/// Inserts adopt the `id` from the response body; pushed keys stop being
/// modified; fields echoed by the backend are merged; deletes remove the
/// object.
pub fn acknowledge(
    record: &Record,
    change: &UpstreamChange,
    response: &Response,
) -> SyncResult<Vec<Mutation>> {
    let id = record.id();
    let mut mutations = Vec::new();
    match change {
        UpstreamChange::Delete => {
            mutations.push(Mutation::Remove { id });
            return Ok(mutations);
        }
        UpstreamChange::Insert(_) => {
            let body = json_body(response)?;
            let remote_id =
                remote_id_of(body).ok_or_else(|| SyncError::decode("insert response without id"))?;
            mutations.push(Mutation::SetRemoteId { id, remote_id });
            mutations.push(Mutation::ClearInserted { id });
        }
        UpstreamChange::Update(_) => {}
    }
    mutations.push(Mutation::ClearModified {
        id,
        keys: change.keys().to_vec(),
    });
    if let Some(body) = response.json() {
        let fields = object_fields(body, &["id"]);
        if !fields.is_empty() {
            mutations.push(Mutation::Update { id, fields });
        }
    }
    Ok(mutations)
}

/// A push event can name an object before the response creating it is
/// applied, leaving a placeholder with the same remote id. The placeholder
/// is dropped and the acknowledged object pulled instead.
fn merge_placeholder(
    store: &dyn ObjectStore,
    record: &Record,
    mutations: &mut Vec<Mutation>,
) -> SyncResult<()> {
    let assigned = mutations.iter().find_map(|m| match m {
        Mutation::SetRemoteId { remote_id, .. } => Some(remote_id.clone()),
        _ => None,
    });
    let Some(remote_id) = assigned else {
        return Ok(());
    };
    let Some(placeholder) = store.find_by_remote_id(record.kind(), &remote_id)? else {
        return Ok(());
    };
    if placeholder.id() == record.id() {
        return Ok(());
    }
    debug!(kind = %record.kind(), %remote_id, "replacing placeholder of acknowledged insert");
    mutations.insert(0, Mutation::Remove { id: placeholder.id() });
    mutations.push(Mutation::SetNeedsPull {
        id: record.id(),
        needs_pull: true,
    });
    Ok(())
}

/// How an [`UpstreamCodec`] wants a change handled.
#[derive(Debug)]
pub enum Push {
    /// Send this request.
    Send(RequestBuilder),
    /// Not yet; for example the parent object has no remote id.
    Wait,
    /// The backend has no operation for this change; stop tracking it.
    Skip,
}

/// Entity-specific half of [`UpstreamSync`].
pub trait UpstreamCodec: Send {
    /// Entity kind handled.
    fn kind(&self) -> EntityKind;

    /// Decides how to push `change`.
    fn request_for(
        &self,
        store: &dyn ObjectStore,
        record: &Record,
        change: &UpstreamChange,
    ) -> SyncResult<Push>;

    /// Store updates once the backend accepted `change`.
    fn on_success(
        &self,
        record: &Record,
        change: &UpstreamChange,
        response: &Response,
    ) -> SyncResult<Vec<Mutation>> {
        acknowledge(record, change, response)
    }

    /// Store updates once the backend rejected `change` or retries ran out.
    fn on_rejected(&self, _record: &Record, _change: &UpstreamChange) -> Vec<Mutation> {
        Vec::new()
    }
}

/// Pushes local changes of one entity kind.
pub struct UpstreamSync<C> {
    codec: C,
    items: OutstandingItems<ObjectId>,
    changes: HashMap<RequestId, (ObjectId, UpstreamChange)>,
}

impl<C: UpstreamCodec> UpstreamSync<C> {
    /// Creates the part.
    pub fn new(codec: C, retry: RetryConfig) -> Self {
        Self {
            codec,
            items: OutstandingItems::new(retry),
            changes: HashMap::new(),
        }
    }

    /// Returns the tracked items.
    pub fn items(&self) -> &OutstandingItems<ObjectId> {
        &self.items
    }

    fn reject(&self, store: &dyn ObjectStore, id: ObjectId, change: &UpstreamChange) -> SyncResult<()> {
        if let Some(record) = store.fetch(id)? {
            let mutations = self.codec.on_rejected(&record, change);
            if !mutations.is_empty() {
                store.apply(ChangeBatch::sync(mutations))?;
            }
        }
        Ok(())
    }
}

impl<C: UpstreamCodec> SyncPart for UpstreamSync<C> {
    fn bootstrap(&mut self, store: &dyn ObjectStore) -> SyncResult<()> {
        for record in store.dirty_objects(self.codec.kind())? {
            self.items.add(record.id());
        }
        Ok(())
    }

    fn objects_did_change(&mut self, changes: &ChangeSet) -> Vec<RequestId> {
        let mut cancel = Vec::new();
        for change in changes.of_kind(self.codec.kind()) {
            if change.removed {
                self.items.remove(&change.id);
                cancel.extend(self.items.request_for(&change.id));
            } else if change.dirty && changes.origin != ChangeOrigin::Sync {
                self.items.add(change.id);
            } else if !change.dirty {
                self.items.remove(&change.id);
            }
        }
        cancel
    }

    fn has_pending(&self) -> bool {
        self.items.has_pending()
    }

    fn has_in_flight(&self) -> bool {
        self.items.has_in_flight()
    }

    fn next_request(&mut self, store: &dyn ObjectStore, now: Instant) -> SyncResult<Option<Request>> {
        let kind = self.codec.kind();
        for id in self.items.ready(now) {
            let Some(record) = store.fetch(id)? else {
                self.items.remove(&id);
                continue;
            };
            let Some(change) = UpstreamChange::of(&record) else {
                self.items.remove(&id);
                continue;
            };
            let builder = match self.codec.request_for(store, &record, &change)? {
                Push::Send(builder) => builder,
                Push::Wait => continue,
                Push::Skip => {
                    debug!(%kind, object = %id, ?change, "change has no backend operation");
                    self.items.remove(&id);
                    continue;
                }
            };
            let request = builder.tag(change.tag(kind, id)).build();
            debug!(%kind, object = %id, request_id = %request.id(), ?change, "pushing local change");
            self.items.start(id, request.id());
            self.changes.insert(request.id(), (id, change));
            return Ok(Some(request));
        }
        Ok(None)
    }

    fn owns(&self, request_id: RequestId) -> bool {
        self.changes.contains_key(&request_id)
    }

    fn apply_response(
        &mut self,
        store: &dyn ObjectStore,
        response: &Response,
        now: Instant,
    ) -> SyncResult<()> {
        let request_id = response.request_id();
        let Some((id, change)) = self.changes.remove(&request_id) else {
            return Ok(());
        };
        let kind = self.codec.kind();

        if response.is_success() {
            let Some(record) = store.fetch(id)? else {
                self.items.succeed(request_id);
                return Ok(());
            };
            match self.codec.on_success(&record, &change, response) {
                Ok(mut mutations) => {
                    merge_placeholder(store, &record, &mut mutations)?;
                    store.apply(ChangeBatch::sync(mutations))?;
                    self.items.succeed(request_id);
                }
                Err(SyncError::Decode(reason)) => {
                    warn!(%kind, object = %id, %reason, "dropping change after undecodable response");
                    self.items.reject(request_id);
                    self.reject(store, id, &change)?;
                }
                Err(e) => return Err(e),
            }
        } else if let Some(error) = response.error() {
            match self.items.fail(request_id, error, now) {
                Some((_, Disposition::GaveUp)) => {
                    warn!(%kind, object = %id, error = %error, "giving up on local change");
                    self.reject(store, id, &change)?;
                }
                Some((_, Disposition::Retry { at })) => {
                    debug!(%kind, object = %id, error = error.label(), retry_in = ?at.saturating_duration_since(now), "will retry");
                }
                None => {}
            }
        } else {
            warn!(%kind, object = %id, status = ?response.status(), "backend rejected local change");
            self.items.reject(request_id);
            self.reject(store, id, &change)?;
        }
        Ok(())
    }

    fn adopt(&mut self, request_id: RequestId, tag: &str) -> bool {
        let Some((kind, id, change)) = UpstreamChange::parse_tag(tag) else {
            return false;
        };
        if kind != self.codec.kind().as_str() {
            return false;
        }
        if !self.changes.contains_key(&request_id) {
            self.items.start(id, request_id);
            self.changes.insert(request_id, (id, change));
        }
        true
    }

    fn next_retry_deadline(&self, now: Instant) -> Option<Instant> {
        self.items.next_retry_deadline(now)
    }
}

/// Entity-specific half of [`DownstreamSync`].
pub trait DownstreamCodec: Send {
    /// Entity kind handled.
    fn kind(&self) -> EntityKind;

    /// Builds the request fetching the object with `remote_id`.
    fn fetch_request(&self, remote_id: &str) -> RequestBuilder;

    /// Store updates for a fetched object.
    fn on_fetched(&self, record: &Record, response: &Response) -> SyncResult<Vec<Mutation>> {
        let body = json_body(response)?;
        Ok(vec![
            Mutation::Update {
                id: record.id(),
                fields: object_fields(body, &["id"]),
            },
            Mutation::SetNeedsPull {
                id: record.id(),
                needs_pull: false,
            },
        ])
    }
}

/// Fetches objects flagged as needing a pull.
pub struct DownstreamSync<C> {
    codec: C,
    items: OutstandingItems<ObjectId>,
    fetches: HashMap<RequestId, ObjectId>,
}

impl<C: DownstreamCodec> DownstreamSync<C> {
    /// Creates the part.
    pub fn new(codec: C, retry: RetryConfig) -> Self {
        Self {
            codec,
            items: OutstandingItems::new(retry),
            fetches: HashMap::new(),
        }
    }

    fn clear_flag(store: &dyn ObjectStore, id: ObjectId) -> SyncResult<()> {
        store.apply(ChangeBatch::sync(vec![Mutation::SetNeedsPull {
            id,
            needs_pull: false,
        }]))?;
        Ok(())
    }
}

impl<C: DownstreamCodec> SyncPart for DownstreamSync<C> {
    fn bootstrap(&mut self, store: &dyn ObjectStore) -> SyncResult<()> {
        for record in store.objects_needing_pull(self.codec.kind())? {
            self.items.add(record.id());
        }
        Ok(())
    }

    fn objects_did_change(&mut self, changes: &ChangeSet) -> Vec<RequestId> {
        let mut cancel = Vec::new();
        for change in changes.of_kind(self.codec.kind()) {
            if change.removed {
                self.items.remove(&change.id);
                cancel.extend(self.items.request_for(&change.id));
            } else if change.needs_pull {
                self.items.add(change.id);
            } else {
                self.items.remove(&change.id);
            }
        }
        cancel
    }

    fn has_pending(&self) -> bool {
        self.items.has_pending()
    }

    fn has_in_flight(&self) -> bool {
        self.items.has_in_flight()
    }

    fn next_request(&mut self, store: &dyn ObjectStore, now: Instant) -> SyncResult<Option<Request>> {
        for id in self.items.ready(now) {
            let record = store.fetch(id)?;
            let Some(remote_id) = record.as_ref().and_then(Record::remote_id) else {
                self.items.remove(&id);
                continue;
            };
            let request = self.codec.fetch_request(remote_id).build();
            debug!(kind = %self.codec.kind(), object = %id, path = request.path(), "fetching object");
            self.items.start(id, request.id());
            self.fetches.insert(request.id(), id);
            return Ok(Some(request));
        }
        Ok(None)
    }

    fn owns(&self, request_id: RequestId) -> bool {
        self.fetches.contains_key(&request_id)
    }

    fn apply_response(
        &mut self,
        store: &dyn ObjectStore,
        response: &Response,
        now: Instant,
    ) -> SyncResult<()> {
        let request_id = response.request_id();
        let Some(id) = self.fetches.remove(&request_id) else {
            return Ok(());
        };
        let kind = self.codec.kind();

        if response.is_success() {
            self.items.succeed(request_id);
            let Some(record) = store.fetch(id)? else {
                return Ok(());
            };
            match self.codec.on_fetched(&record, response) {
                Ok(mutations) => {
                    store.apply(ChangeBatch::sync(mutations))?;
                }
                Err(SyncError::Decode(reason)) => {
                    warn!(%kind, object = %id, %reason, "undecodable fetch result");
                    Self::clear_flag(store, id)?;
                }
                Err(e) => return Err(e),
            }
        } else if response.status() == Some(404) {
            debug!(%kind, object = %id, "object gone remotely");
            self.items.reject(request_id);
            store.apply(ChangeBatch::sync(vec![Mutation::Remove { id }]))?;
        } else if let Some(error) = response.error() {
            if let Some((_, Disposition::GaveUp)) = self.items.fail(request_id, error, now) {
                warn!(%kind, object = %id, error = %error, "giving up on fetch");
            }
        } else {
            warn!(%kind, object = %id, status = ?response.status(), "fetch rejected");
            self.items.reject(request_id);
            Self::clear_flag(store, id)?;
        }
        Ok(())
    }

    fn next_retry_deadline(&self, now: Instant) -> Option<Instant> {
        self.items.next_retry_deadline(now)
    }
}

/// One decoded page of a remote listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Store updates for the page's objects.
    pub mutations: Vec<Mutation>,
    /// Cursor of the next page; `None` on the last page.
    pub next: Option<String>,
}

/// Entity-specific half of [`PagedSync`].
pub trait PagedCodec: Send {
    /// Name of the listing, for logs.
    fn listing(&self) -> &'static str;

    /// Builds the request for the page after `cursor` (first page if `None`).
    fn page_request(&self, cursor: Option<&str>) -> RequestBuilder;

    /// Decodes one page.
    fn on_page(&self, response: &Response) -> SyncResult<Page>;
}

/// Walks a remote listing page by page.
///
/// Each page is one request; a page with a continuation cursor leaves the
/// part with outstanding work until the last page is applied.
pub struct PagedSync<C> {
    codec: C,
    items: OutstandingItems<Option<String>>,
    pages: HashMap<RequestId, Option<String>>,
    start_on_bootstrap: bool,
    pages_fetched: usize,
}

impl<C: PagedCodec> PagedSync<C> {
    /// Creates the part. The listing starts on bootstrap.
    pub fn new(codec: C, retry: RetryConfig) -> Self {
        Self {
            codec,
            items: OutstandingItems::new(retry),
            pages: HashMap::new(),
            start_on_bootstrap: true,
            pages_fetched: 0,
        }
    }

    /// Keeps the listing idle until [`start`](Self::start) is called.
    pub fn manual(mut self) -> Self {
        self.start_on_bootstrap = false;
        self
    }

    /// Starts the listing from the first page. Returns false if it is running.
    pub fn start(&mut self) -> bool {
        if !self.items.is_empty() {
            return false;
        }
        self.items.add(None)
    }

    /// Returns the number of pages applied.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

impl<C: PagedCodec> SyncPart for PagedSync<C> {
    fn bootstrap(&mut self, _store: &dyn ObjectStore) -> SyncResult<()> {
        if self.start_on_bootstrap {
            self.start();
        }
        Ok(())
    }

    fn objects_did_change(&mut self, _changes: &ChangeSet) -> Vec<RequestId> {
        Vec::new()
    }

    fn has_pending(&self) -> bool {
        self.items.has_pending()
    }

    fn has_in_flight(&self) -> bool {
        self.items.has_in_flight()
    }

    fn next_request(&mut self, _store: &dyn ObjectStore, now: Instant) -> SyncResult<Option<Request>> {
        let Some(cursor) = self.items.ready(now).into_iter().next() else {
            return Ok(None);
        };
        let request = self.codec.page_request(cursor.as_deref()).build();
        debug!(listing = self.codec.listing(), cursor = ?cursor, "requesting page");
        self.items.start(cursor.clone(), request.id());
        self.pages.insert(request.id(), cursor);
        Ok(Some(request))
    }

    fn owns(&self, request_id: RequestId) -> bool {
        self.pages.contains_key(&request_id)
    }

    fn apply_response(
        &mut self,
        store: &dyn ObjectStore,
        response: &Response,
        now: Instant,
    ) -> SyncResult<()> {
        let request_id = response.request_id();
        if self.pages.remove(&request_id).is_none() {
            return Ok(());
        }
        let listing = self.codec.listing();

        if response.is_success() {
            match self.codec.on_page(response) {
                Ok(page) => {
                    if !page.mutations.is_empty() {
                        store.apply(ChangeBatch::sync(page.mutations))?;
                    }
                    self.items.succeed(request_id);
                    self.pages_fetched += 1;
                    match page.next {
                        Some(next) => {
                            self.items.add(Some(next));
                        }
                        None => info!(listing, pages = self.pages_fetched, "listing complete"),
                    }
                }
                Err(SyncError::Decode(reason)) => {
                    warn!(listing, %reason, "abandoning listing after undecodable page");
                    self.items.reject(request_id);
                }
                Err(e) => return Err(e),
            }
        } else if let Some(error) = response.error() {
            if let Some((_, Disposition::GaveUp)) = self.items.fail(request_id, error, now) {
                warn!(listing, error = %error, "giving up on listing");
            }
        } else {
            warn!(listing, status = ?response.status(), "listing rejected");
            self.items.reject(request_id);
        }
        Ok(())
    }

    fn next_retry_deadline(&self, now: Instant) -> Option<Instant> {
        self.items.next_retry_deadline(now)
    }
}

/// A transcoder assembled from [`SyncPart`]s and an optional [`EventHandler`].
///
/// Parts are asked for requests in the order they were added.
pub struct EntityTranscoder {
    name: &'static str,
    tier: Tier,
    parts: Vec<Box<dyn SyncPart>>,
    events: Option<Box<dyn EventHandler>>,
}

impl EntityTranscoder {
    /// Creates a transcoder with no parts.
    pub fn new(name: &'static str, tier: Tier) -> Self {
        Self {
            name,
            tier,
            parts: Vec::new(),
            events: None,
        }
    }

    /// Adds a part.
    pub fn with_part(mut self, part: impl SyncPart + 'static) -> Self {
        self.parts.push(Box::new(part));
        self
    }

    /// Sets the event handler.
    pub fn with_events(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Some(Box::new(handler));
        self
    }
}

impl Transcoder for EntityTranscoder {
    fn name(&self) -> &str {
        self.name
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn bootstrap(&mut self, store: &dyn ObjectStore) -> SyncResult<()> {
        for part in &mut self.parts {
            part.bootstrap(store)?;
        }
        Ok(())
    }

    fn objects_did_change(&mut self, changes: &ChangeSet) -> Vec<RequestId> {
        self.parts
            .iter_mut()
            .flat_map(|part| part.objects_did_change(changes))
            .collect()
    }

    fn has_outstanding_items(&self) -> bool {
        self.parts.iter().any(|part| part.has_pending())
    }

    fn has_in_flight_requests(&self) -> bool {
        self.parts.iter().any(|part| part.has_in_flight())
    }

    fn next_request(&mut self, store: &dyn ObjectStore, now: Instant) -> SyncResult<Option<Request>> {
        for part in &mut self.parts {
            if !part.has_pending() {
                continue;
            }
            if let Some(request) = part.next_request(store, now)? {
                return Ok(Some(request));
            }
        }
        Ok(None)
    }

    fn apply_response(
        &mut self,
        store: &dyn ObjectStore,
        response: &Response,
        now: Instant,
    ) -> SyncResult<()> {
        let request_id = response.request_id();
        match self.parts.iter_mut().find(|part| part.owns(request_id)) {
            Some(part) => part.apply_response(store, response, now),
            None => {
                debug!(transcoder = self.name, %request_id, "response for unknown request");
                Ok(())
            }
        }
    }

    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()> {
        match &mut self.events {
            Some(handler) => handler.process_events(store, events),
            None => Ok(()),
        }
    }

    fn adopt_recovered(&mut self, request_id: RequestId, tag: &str) -> bool {
        self.parts.iter_mut().any(|part| part.adopt(request_id, tag))
    }

    fn next_retry_deadline(&self, now: Instant) -> Option<Instant> {
        self.parts
            .iter()
            .filter_map(|part| part.next_retry_deadline(now))
            .min()
    }
}
