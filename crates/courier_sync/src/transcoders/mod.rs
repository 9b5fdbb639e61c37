//! Transcoders for the entity categories of a messaging client.
//!
//! The JSON shapes used here are illustrative; a real backend dictates its
//! own schema. Each module exposes its codecs and a `transcoder` function
//! assembling them into an [`EntityTranscoder`](crate::EntityTranscoder).

pub mod client;
pub mod connection;
pub mod conversation;
pub mod message;
pub mod user;

use crate::error::{SyncError, SyncResult};
use crate::registry::TranscoderRegistry;
use crate::store::{EntityKind, Fields, Mutation, ObjectId, ObjectStore, Record};
use crate::transcoder::{object_fields, remote_id_of, Page};
use courier_transport::{Response, RetryConfig};
use serde_json::Value;

/// Number of objects requested per listing page.
pub const PAGE_SIZE: usize = 100;

/// Builds the registry with every transcoder of this module, in tier order.
pub fn default_registry(retry: &RetryConfig) -> TranscoderRegistry {
    let mut registry = TranscoderRegistry::new();
    registry.register(Box::new(client::transcoder(retry)));
    registry.register(Box::new(user::transcoder(retry)));
    registry.register(Box::new(connection::transcoder(retry)));
    registry.register(Box::new(conversation::transcoder(retry)));
    registry.register(Box::new(message::transcoder(retry)));
    registry
}

/// Returns the local id of the object mirroring `remote_id`, queueing a
/// placeholder that needs a pull when it is unknown.
pub(crate) fn resolve_or_stub(
    store: &dyn ObjectStore,
    kind: EntityKind,
    remote_id: &str,
    mutations: &mut Vec<Mutation>,
) -> SyncResult<ObjectId> {
    if let Some(record) = store.find_by_remote_id(kind, remote_id)? {
        return Ok(record.id());
    }
    if let Some(id) = queued_insert(mutations, kind, remote_id) {
        return Ok(id);
    }
    let stub = Record::stub(kind, remote_id);
    let id = stub.id();
    mutations.push(Mutation::Insert(stub));
    Ok(id)
}

/// Queues an upsert of the object mirroring `remote_id` and returns its
/// local id. Unknown objects are inserted with an id chosen here so later
/// events in the same batch can refer to them.
pub(crate) fn upsert_remote(
    store: &dyn ObjectStore,
    kind: EntityKind,
    remote_id: &str,
    fields: Fields,
    mutations: &mut Vec<Mutation>,
) -> SyncResult<ObjectId> {
    let known = match store.find_by_remote_id(kind, remote_id)? {
        Some(record) => Some(record.id()),
        None => queued_insert(mutations, kind, remote_id),
    };
    match known {
        Some(id) => {
            mutations.push(Mutation::UpsertRemote {
                kind,
                remote_id: remote_id.to_string(),
                fields,
            });
            Ok(id)
        }
        None => {
            let record = Record::remote(kind, remote_id, fields);
            let id = record.id();
            mutations.push(Mutation::Insert(record));
            Ok(id)
        }
    }
}

fn queued_insert(mutations: &[Mutation], kind: EntityKind, remote_id: &str) -> Option<ObjectId> {
    mutations.iter().find_map(|m| match m {
        Mutation::Insert(record)
            if record.kind() == kind && record.remote_id() == Some(remote_id) =>
        {
            Some(record.id())
        }
        _ => None,
    })
}

/// Decodes a `{ "<list_key>": [...], "has_more": bool }` listing page.
pub(crate) fn decode_page(response: &Response, list_key: &str, kind: EntityKind) -> SyncResult<Page> {
    let body = response
        .json()
        .ok_or_else(|| SyncError::decode("listing without JSON body"))?;
    let items = body
        .get(list_key)
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::decode(format!("listing without `{list_key}`")))?;

    let mut page = Page::default();
    for item in items {
        let remote_id = remote_id_of(item)
            .ok_or_else(|| SyncError::decode(format!("{kind} without id")))?;
        page.mutations.push(Mutation::UpsertRemote {
            kind,
            remote_id,
            fields: object_fields(item, &["id"]),
        });
    }
    if body.get("has_more").and_then(Value::as_bool).unwrap_or(false) {
        page.next = items.last().and_then(remote_id_of);
    }
    Ok(page)
}

/// Returns the current values of `keys` as a JSON object.
pub(crate) fn changed_fields(record: &Record, keys: &[String]) -> Value {
    Value::Object(
        keys.iter()
            .filter_map(|k| Some((k.clone(), record.field(k)?.clone())))
            .collect(),
    )
}

/// Returns a string member of an event payload.
pub(crate) fn payload_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}
