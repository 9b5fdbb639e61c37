//! Connection requests between users.

use super::{changed_fields, decode_page, payload_str, resolve_or_stub, PAGE_SIZE};
use crate::error::SyncResult;
use crate::store::{ChangeBatch, EntityKind, Mutation, ObjectStore, Record};
use crate::transcoder::{
    object_fields, remote_id_of, EntityTranscoder, EventHandler, Page, PagedCodec, PagedSync,
    Push, Tier, UpstreamChange, UpstreamCodec, UpstreamSync,
};
use courier_transport::{Method, PushEvent, Request, RequestBuilder, Response, RetryConfig};
use serde_json::json;

/// Sends connection requests and status changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionCodec;

impl UpstreamCodec for ConnectionCodec {
    fn kind(&self) -> EntityKind {
        EntityKind::Connection
    }

    fn request_for(
        &self,
        _store: &dyn ObjectStore,
        record: &Record,
        change: &UpstreamChange,
    ) -> SyncResult<Push> {
        match (change, record.remote_id()) {
            (UpstreamChange::Insert(_), _) => {
                let Some(to) = record.str_field("to") else {
                    return Ok(Push::Skip);
                };
                let body = json!({
                    "user": to,
                    "message": record.str_field("message").unwrap_or_default(),
                });
                Ok(Push::Send(Request::builder(Method::Post, "/connections").json(body)))
            }
            (UpstreamChange::Update(keys), Some(remote_id)) => Ok(Push::Send(
                Request::builder(Method::Put, format!("/connections/{remote_id}"))
                    .json(changed_fields(record, keys)),
            )),
            _ => Ok(Push::Skip),
        }
    }
}

/// Lists all connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionListing;

impl PagedCodec for ConnectionListing {
    fn listing(&self) -> &'static str {
        "connections"
    }

    fn page_request(&self, cursor: Option<&str>) -> RequestBuilder {
        let path = match cursor {
            Some(start) => format!("/connections?size={PAGE_SIZE}&start={start}"),
            None => format!("/connections?size={PAGE_SIZE}"),
        };
        Request::builder(Method::Get, path)
    }

    fn on_page(&self, response: &Response) -> SyncResult<Page> {
        decode_page(response, "connections", EntityKind::Connection)
    }
}

/// Applies `user.connection` events.
#[derive(Debug, Default)]
pub struct ConnectionEvents;

impl EventHandler for ConnectionEvents {
    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()> {
        let mut mutations = Vec::new();
        for event in events.iter().filter(|e| e.event_type == "user.connection") {
            let Some(connection) = event.payload.get("connection") else {
                continue;
            };
            let Some(remote_id) = remote_id_of(connection) else {
                continue;
            };
            if let Some(to) = payload_str(connection, "to") {
                resolve_or_stub(store, EntityKind::User, to, &mut mutations)?;
            }
            mutations.push(Mutation::UpsertRemote {
                kind: EntityKind::Connection,
                remote_id,
                fields: object_fields(connection, &["id"]),
            });
        }
        if !mutations.is_empty() {
            store.apply(ChangeBatch::sync(mutations))?;
        }
        Ok(())
    }
}

/// Builds the connection transcoder.
pub fn transcoder(retry: &RetryConfig) -> EntityTranscoder {
    EntityTranscoder::new("connection", Tier::State)
        .with_part(UpstreamSync::new(ConnectionCodec, retry.clone()))
        .with_part(PagedSync::new(ConnectionListing, retry.clone()))
        .with_events(ConnectionEvents)
}
