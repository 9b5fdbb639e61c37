//! Persistent object store collaborator.
//!
//! The sync layer never owns the object graph. It reads and mutates it
//! through [`ObjectStore`], whose mutations happen in scoped, all-or-nothing
//! batches and are announced to subscribers as [`ChangeSet`]s once applied.
//!
//! [`MemoryStore`] is the reference implementation. It keeps a working state
//! and a last-saved state; saves are coalesced behind a short delay and a
//! failed save rolls the working state back.

use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// JSON attributes of a record.
pub type Fields = Map<String, Value>;

/// Categories of synchronized objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// This device's client registration.
    SelfClient,
    /// A user profile (including the self user).
    User,
    /// A connection request between two users.
    Connection,
    /// A conversation.
    Conversation,
    /// A message in a conversation.
    Message,
}

impl EntityKind {
    /// Returns a stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::SelfClient => "self_client",
            EntityKind::User => "user",
            EntityKind::Connection => "connection",
            EntityKind::Conversation => "conversation",
            EntityKind::Message => "message",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local identifier of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generates a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the hyphenated form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One stored object together with its synchronization flags.
///
/// A record is *dirty* when it carries locally modified keys or is a pending
/// local insert or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: ObjectId,
    kind: EntityKind,
    remote_id: Option<String>,
    fields: Fields,
    modified_keys: BTreeSet<String>,
    inserted_locally: bool,
    deleted_locally: bool,
    needs_pull: bool,
}

impl Record {
    /// Creates a record that was created on this device and not yet pushed.
    pub fn local(kind: EntityKind, fields: Fields) -> Self {
        Self {
            id: ObjectId::new(),
            kind,
            remote_id: None,
            modified_keys: fields.keys().cloned().collect(),
            fields,
            inserted_locally: true,
            deleted_locally: false,
            needs_pull: false,
        }
    }

    /// Creates a record mirroring a known remote object.
    pub fn remote(kind: EntityKind, remote_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: ObjectId::new(),
            kind,
            remote_id: Some(remote_id.into()),
            fields,
            modified_keys: BTreeSet::new(),
            inserted_locally: false,
            deleted_locally: false,
            needs_pull: false,
        }
    }

    /// Creates a placeholder for a remote object whose contents must be fetched.
    pub fn stub(kind: EntityKind, remote_id: impl Into<String>) -> Self {
        let mut record = Self::remote(kind, remote_id, Fields::new());
        record.needs_pull = true;
        record
    }

    /// Returns the record with `key` set, without marking it modified.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Returns the local id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns the kind.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Returns the backend id, once known.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// Returns all fields.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Returns one field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Returns the keys changed locally since the last push.
    pub fn modified_keys(&self) -> &BTreeSet<String> {
        &self.modified_keys
    }

    /// Returns true for a local insert not yet acknowledged by the backend.
    pub fn is_inserted_locally(&self) -> bool {
        self.inserted_locally
    }

    /// Returns true for a local delete not yet acknowledged by the backend.
    pub fn is_deleted_locally(&self) -> bool {
        self.deleted_locally
    }

    /// Returns true if the object must be fetched from the backend.
    pub fn needs_pull(&self) -> bool {
        self.needs_pull
    }

    /// Returns true if the record has local changes to push.
    pub fn is_dirty(&self) -> bool {
        self.inserted_locally || self.deleted_locally || !self.modified_keys.is_empty()
    }
}

/// One change inside a [`ChangeBatch`].
///
/// `Update` and `Delete` depend on the batch origin: local updates mark keys
/// modified and local deletes are recorded for upload, while sync updates
/// leave locally modified keys alone and sync deletes remove the object.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Inserts a new record.
    Insert(Record),
    /// Sets fields on an existing record.
    Update {
        /// Target object.
        id: ObjectId,
        /// Fields to set.
        fields: Fields,
    },
    /// Deletes a record.
    Delete {
        /// Target object.
        id: ObjectId,
    },
    /// Inserts or updates the record mirroring a remote object.
    UpsertRemote {
        /// Object kind.
        kind: EntityKind,
        /// Backend id.
        remote_id: String,
        /// Remote fields.
        fields: Fields,
    },
    /// Records the backend id of a pushed insert.
    SetRemoteId {
        /// Target object.
        id: ObjectId,
        /// Backend id.
        remote_id: String,
    },
    /// Clears modified keys after they were pushed.
    ClearModified {
        /// Target object.
        id: ObjectId,
        /// Keys to clear.
        keys: Vec<String>,
    },
    /// Marks a pushed insert as acknowledged.
    ClearInserted {
        /// Target object.
        id: ObjectId,
    },
    /// Sets or clears the needs-pull flag.
    SetNeedsPull {
        /// Target object.
        id: ObjectId,
        /// New flag value.
        needs_pull: bool,
    },
    /// Removes the record regardless of its flags.
    Remove {
        /// Target object.
        id: ObjectId,
    },
}

impl Mutation {
    fn target(&self) -> Option<ObjectId> {
        match self {
            Mutation::Insert(record) => Some(record.id),
            Mutation::UpsertRemote { .. } => None,
            Mutation::Update { id, .. }
            | Mutation::Delete { id }
            | Mutation::SetRemoteId { id, .. }
            | Mutation::ClearModified { id, .. }
            | Mutation::ClearInserted { id }
            | Mutation::SetNeedsPull { id, .. }
            | Mutation::Remove { id } => Some(*id),
        }
    }
}

/// Who produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// The application, on this device.
    Local,
    /// The sync engine, applying backend data.
    Sync,
    /// A failed save restored the last saved state.
    Rollback,
}

/// A set of mutations applied as one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    origin: ChangeOrigin,
    mutations: Vec<Mutation>,
}

impl ChangeBatch {
    /// Creates an empty batch for local changes.
    pub fn local() -> Self {
        Self {
            origin: ChangeOrigin::Local,
            mutations: Vec::new(),
        }
    }

    /// Creates a sync batch from mutations.
    pub fn sync(mutations: Vec<Mutation>) -> Self {
        Self {
            origin: ChangeOrigin::Sync,
            mutations,
        }
    }

    /// Returns the origin.
    pub fn origin(&self) -> ChangeOrigin {
        self.origin
    }

    /// Returns the mutations.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Returns the number of mutations.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns true if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Adds a mutation.
    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Inserts a record and returns its id.
    pub fn insert(&mut self, record: Record) -> ObjectId {
        let id = record.id;
        self.mutations.push(Mutation::Insert(record));
        id
    }

    /// Sets fields on a record.
    pub fn update(&mut self, id: ObjectId, fields: Fields) {
        self.mutations.push(Mutation::Update { id, fields });
    }

    /// Sets one field on a record.
    pub fn set(&mut self, id: ObjectId, key: impl Into<String>, value: Value) {
        let mut fields = Fields::new();
        fields.insert(key.into(), value);
        self.update(id, fields);
    }

    /// Deletes a record.
    pub fn delete(&mut self, id: ObjectId) {
        self.mutations.push(Mutation::Delete { id });
    }
}

/// Flags of one object after a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    /// The object.
    pub id: ObjectId,
    /// Its kind.
    pub kind: EntityKind,
    /// Whether it has local changes to push.
    pub dirty: bool,
    /// Whether it must be fetched.
    pub needs_pull: bool,
    /// Whether it no longer exists.
    pub removed: bool,
}

/// The outcome of one transaction, delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Who produced the changes.
    pub origin: ChangeOrigin,
    /// Changed objects in first-touch order.
    pub changes: Vec<ObjectChange>,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the changes for one kind.
    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &ObjectChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }

    /// Returns the change for `id`, if any.
    pub fn get(&self, id: ObjectId) -> Option<&ObjectChange> {
        self.changes.iter().find(|c| c.id == id)
    }
}

/// The persistent object graph as seen by the sync layer.
pub trait ObjectStore: Send + Sync {
    /// Fetches one object.
    fn fetch(&self, id: ObjectId) -> StoreResult<Option<Record>>;

    /// Finds the object mirroring a remote id.
    fn find_by_remote_id(&self, kind: EntityKind, remote_id: &str) -> StoreResult<Option<Record>>;

    /// Applies a batch as one transaction.
    fn apply(&self, batch: ChangeBatch) -> StoreResult<ChangeSet>;

    /// Persists the working state, rolling it back if that fails.
    fn save_or_rollback(&self) -> StoreResult<()>;

    /// Schedules a coalesced save.
    fn enqueue_delayed_save(&self);

    /// Saves immediately if too many changes are pending. Returns true if it saved.
    fn save_if_too_many_changes(&self) -> StoreResult<bool>;

    /// Returns all objects of `kind`.
    fn objects(&self, kind: EntityKind) -> StoreResult<Vec<Record>>;

    /// Returns the dirty objects of `kind`.
    fn dirty_objects(&self, kind: EntityKind) -> StoreResult<Vec<Record>>;

    /// Returns the objects of `kind` that must be fetched.
    fn objects_needing_pull(&self, kind: EntityKind) -> StoreResult<Vec<Record>>;

    /// Subscribes to change notifications.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeSet>;

    /// Subscribes to failures of saves run by [`enqueue_delayed_save`].
    ///
    /// [`enqueue_delayed_save`]: ObjectStore::enqueue_delayed_save
    fn subscribe_save_failures(&self) -> mpsc::UnboundedReceiver<StoreError>;
}

/// Runs `changes` as one local transaction and schedules a save.
pub fn perform_changes<F>(store: &dyn ObjectStore, changes: F) -> StoreResult<ChangeSet>
where
    F: FnOnce(&mut ChangeBatch),
{
    let mut batch = ChangeBatch::local();
    changes(&mut batch);
    let set = store.apply(batch)?;
    if !store.save_if_too_many_changes()? {
        store.enqueue_delayed_save();
    }
    Ok(set)
}

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Delay used to coalesce saves.
    pub save_delay: Duration,
    /// Pending change count that forces an immediate save.
    pub max_pending_changes: usize,
}

impl StoreConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            save_delay: Duration::from_millis(200),
            max_pending_changes: 100,
        }
    }

    /// Sets the save delay.
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = delay;
        self
    }

    /// Sets the pending change threshold.
    pub fn with_max_pending_changes(mut self, max: usize) -> Self {
        self.max_pending_changes = max.max(1);
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct StoreState {
    working: BTreeMap<ObjectId, Record>,
    saved: BTreeMap<ObjectId, Record>,
    remote_index: HashMap<(EntityKind, String), ObjectId>,
    pending_changes: usize,
    save_scheduled: bool,
    saves: u64,
    failing_saves: usize,
}

impl StoreState {
    fn lookup_remote(
        &self,
        staged: &BTreeMap<ObjectId, Option<Record>>,
        kind: EntityKind,
        remote_id: &str,
    ) -> Option<ObjectId> {
        let in_staged = staged.values().flatten().find(|r| {
            r.kind == kind && r.remote_id.as_deref() == Some(remote_id)
        });
        if let Some(record) = in_staged {
            return Some(record.id);
        }
        self.remote_index
            .get(&(kind, remote_id.to_string()))
            .copied()
            .filter(|id| !staged.contains_key(id))
    }

    fn rebuild_index(&mut self) {
        self.remote_index = self
            .working
            .values()
            .filter_map(|r| Some(((r.kind, r.remote_id.clone()?), r.id)))
            .collect();
    }
}

/// In-memory [`ObjectStore`] with coalesced saves and rollback.
pub struct MemoryStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeSet>>>,
    save_failures: Mutex<Vec<mpsc::UnboundedSender<StoreError>>>,
    closed: AtomicBool,
    me: Weak<MemoryStore>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            state: Mutex::new(StoreState::default()),
            subscribers: Mutex::new(Vec::new()),
            save_failures: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the number of objects in the working state.
    pub fn len(&self) -> usize {
        self.state.lock().working.len()
    }

    /// Returns true if the working state is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.state.lock().saves
    }

    /// Returns the number of mutations applied since the last save.
    pub fn pending_changes(&self) -> usize {
        self.state.lock().pending_changes
    }

    /// Returns the last saved version of an object.
    pub fn saved(&self, id: ObjectId) -> Option<Record> {
        self.state.lock().saved.get(&id).cloned()
    }

    /// Makes the next `count` saves fail, as a failing disk would.
    pub fn fail_next_saves(&self, count: usize) {
        self.state.lock().failing_saves = count;
    }

    /// Closes the store. Later calls fail with [`StoreError::Unavailable`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().clear();
        self.save_failures.lock().clear();
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store is closed".into()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, set: &ChangeSet) {
        if set.is_empty() {
            return;
        }
        self.subscribers
            .lock()
            .retain(|sender| sender.send(set.clone()).is_ok());
    }

    fn run_scheduled_save(&self) {
        self.state.lock().save_scheduled = false;
        if let Err(e) = self.save_or_rollback() {
            warn!(error = %e, "delayed save failed");
            self.save_failures
                .lock()
                .retain(|sender| sender.send(e.clone()).is_ok());
        }
    }

    fn filter(&self, kind: EntityKind, predicate: impl Fn(&Record) -> bool) -> Vec<Record> {
        self.state
            .lock()
            .working
            .values()
            .filter(|r| r.kind == kind && predicate(r))
            .cloned()
            .collect()
    }
}

fn stage_update(record: &mut Record, fields: Fields, origin: ChangeOrigin) {
    for (key, value) in fields {
        match origin {
            ChangeOrigin::Local => {
                record.modified_keys.insert(key.clone());
                record.fields.insert(key, value);
            }
            ChangeOrigin::Sync | ChangeOrigin::Rollback => {
                // Pending local edits win over remote values until pushed.
                if !record.modified_keys.contains(&key) {
                    record.fields.insert(key, value);
                }
            }
        }
    }
}

impl ObjectStore for MemoryStore {
    fn fetch(&self, id: ObjectId) -> StoreResult<Option<Record>> {
        self.check_open()?;
        Ok(self.state.lock().working.get(&id).cloned())
    }

    fn find_by_remote_id(&self, kind: EntityKind, remote_id: &str) -> StoreResult<Option<Record>> {
        self.check_open()?;
        let state = self.state.lock();
        Ok(state
            .remote_index
            .get(&(kind, remote_id.to_string()))
            .and_then(|id| state.working.get(id))
            .cloned())
    }

    fn apply(&self, batch: ChangeBatch) -> StoreResult<ChangeSet> {
        self.check_open()?;
        let origin = batch.origin;
        let count = batch.mutations.len();

        let set = {
            let mut state = self.state.lock();
            let mut staged: BTreeMap<ObjectId, Option<Record>> = BTreeMap::new();
            let mut touched: Vec<ObjectId> = Vec::new();
            let mut existed: BTreeSet<ObjectId> = BTreeSet::new();

            for mutation in batch.mutations {
                let id = match mutation.target() {
                    Some(id) => id,
                    None => match &mutation {
                        Mutation::UpsertRemote {
                            kind, remote_id, ..
                        } => match state.lookup_remote(&staged, *kind, remote_id) {
                            Some(id) => id,
                            None => ObjectId::new(),
                        },
                        _ => ObjectId::new(),
                    },
                };
                let current = match staged.get(&id) {
                    Some(entry) => entry.clone(),
                    None => {
                        let found = state.working.get(&id).cloned();
                        if found.is_some() {
                            existed.insert(id);
                        }
                        found
                    }
                };
                if !touched.contains(&id) {
                    touched.push(id);
                }

                let next = match (mutation, current) {
                    (Mutation::Insert(record), None) => Some(record),
                    (Mutation::Insert(_), Some(_)) => {
                        return Err(StoreError::Conflict(format!("object {id} already exists")));
                    }
                    (Mutation::UpsertRemote { kind, remote_id, fields }, None) => {
                        let mut record = Record::remote(kind, remote_id, fields);
                        record.id = id;
                        Some(record)
                    }
                    (Mutation::UpsertRemote { fields, .. }, Some(mut record)) => {
                        stage_update(&mut record, fields, ChangeOrigin::Sync);
                        Some(record)
                    }
                    (_, None) if origin == ChangeOrigin::Local => {
                        return Err(StoreError::NotFound(id.to_string()));
                    }
                    (Mutation::Remove { .. }, _) => None,
                    (_, None) => {
                        // The object went away while the sync result was in flight.
                        trace!(object = %id, "skipping sync mutation for missing object");
                        None
                    }
                    (Mutation::Update { fields, .. }, Some(mut record)) => {
                        stage_update(&mut record, fields, origin);
                        Some(record)
                    }
                    (Mutation::Delete { .. }, Some(mut record)) => {
                        if origin == ChangeOrigin::Local
                            && !(record.inserted_locally && record.remote_id.is_none())
                        {
                            record.deleted_locally = true;
                            Some(record)
                        } else {
                            None
                        }
                    }
                    (Mutation::SetRemoteId { remote_id, .. }, Some(mut record)) => {
                        record.remote_id = Some(remote_id);
                        Some(record)
                    }
                    (Mutation::ClearModified { keys, .. }, Some(mut record)) => {
                        for key in keys {
                            record.modified_keys.remove(&key);
                        }
                        Some(record)
                    }
                    (Mutation::ClearInserted { .. }, Some(mut record)) => {
                        record.inserted_locally = false;
                        Some(record)
                    }
                    (Mutation::SetNeedsPull { needs_pull, .. }, Some(mut record)) => {
                        record.needs_pull = needs_pull;
                        Some(record)
                    }
                };
                staged.insert(id, next);
            }

            let mut changes = Vec::with_capacity(touched.len());
            for id in touched {
                let Some(entry) = staged.remove(&id) else {
                    continue;
                };
                let stale_key = state
                    .working
                    .get(&id)
                    .and_then(|old| old.remote_id.clone().map(|remote_id| (old.kind, remote_id)));
                if let Some(key) = stale_key {
                    state.remote_index.remove(&key);
                }
                match entry {
                    Some(record) => {
                        if let Some(remote_id) = &record.remote_id {
                            state
                                .remote_index
                                .insert((record.kind, remote_id.clone()), record.id);
                        }
                        changes.push(ObjectChange {
                            id,
                            kind: record.kind,
                            dirty: record.is_dirty(),
                            needs_pull: record.needs_pull,
                            removed: false,
                        });
                        state.working.insert(id, record);
                    }
                    None => {
                        if let Some(old) = state.working.remove(&id) {
                            changes.push(ObjectChange {
                                id,
                                kind: old.kind,
                                dirty: false,
                                needs_pull: false,
                                removed: true,
                            });
                        } else if existed.contains(&id) {
                            warn!(object = %id, "object vanished during transaction");
                        }
                    }
                }
            }
            state.pending_changes += count;
            ChangeSet { origin, changes }
        };

        trace!(?origin, changed = set.changes.len(), "applied change batch");
        self.publish(&set);
        Ok(set)
    }

    fn save_or_rollback(&self) -> StoreResult<()> {
        self.check_open()?;
        let rollback = {
            let mut state = self.state.lock();
            if state.pending_changes == 0 {
                return Ok(());
            }
            if state.failing_saves == 0 {
                state.saved = state.working.clone();
                state.pending_changes = 0;
                state.saves += 1;
                debug!(saves = state.saves, "store saved");
                return Ok(());
            }
            state.failing_saves -= 1;

            let ids: BTreeSet<ObjectId> = state
                .working
                .keys()
                .chain(state.saved.keys())
                .copied()
                .collect();
            let mut changes = Vec::new();
            for id in ids {
                let (current, saved) = (state.working.get(&id), state.saved.get(&id));
                if current == saved {
                    continue;
                }
                changes.push(match saved {
                    Some(record) => ObjectChange {
                        id,
                        kind: record.kind,
                        dirty: record.is_dirty(),
                        needs_pull: record.needs_pull,
                        removed: false,
                    },
                    None => ObjectChange {
                        id,
                        kind: current.map(|r| r.kind).unwrap_or(EntityKind::User),
                        dirty: false,
                        needs_pull: false,
                        removed: true,
                    },
                });
            }
            state.working = state.saved.clone();
            state.pending_changes = 0;
            state.rebuild_index();
            ChangeSet {
                origin: ChangeOrigin::Rollback,
                changes,
            }
        };

        warn!(rolled_back = rollback.changes.len(), "save failed, rolled back");
        self.publish(&rollback);
        Err(StoreError::SaveFailed("write rejected by storage".into()))
    }

    fn enqueue_delayed_save(&self) {
        {
            let mut state = self.state.lock();
            if state.save_scheduled {
                return;
            }
            state.save_scheduled = true;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.run_scheduled_save();
            return;
        };
        let me = self.me.clone();
        let delay = self.config.save_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(store) = me.upgrade() {
                store.run_scheduled_save();
            }
        });
    }

    fn save_if_too_many_changes(&self) -> StoreResult<bool> {
        if self.state.lock().pending_changes < self.config.max_pending_changes {
            return Ok(false);
        }
        self.save_or_rollback()?;
        Ok(true)
    }

    fn objects(&self, kind: EntityKind) -> StoreResult<Vec<Record>> {
        self.check_open()?;
        Ok(self.filter(kind, |_| true))
    }

    fn dirty_objects(&self, kind: EntityKind) -> StoreResult<Vec<Record>> {
        self.check_open()?;
        Ok(self.filter(kind, Record::is_dirty))
    }

    fn objects_needing_pull(&self, kind: EntityKind) -> StoreResult<Vec<Record>> {
        self.check_open()?;
        Ok(self.filter(kind, Record::needs_pull))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeSet> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            self.subscribers.lock().push(tx);
        }
        rx
    }

    fn subscribe_save_failures(&self) -> mpsc::UnboundedReceiver<StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            self.save_failures.lock().push(tx);
        }
        rx
    }
}
