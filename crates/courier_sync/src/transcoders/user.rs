//! User profiles.
//!
//! Only the self user can be edited locally; other users are fetched on
//! demand when something refers to them.

use super::changed_fields;
use crate::error::SyncResult;
use crate::store::{ChangeBatch, EntityKind, Mutation, ObjectStore, Record};
use crate::transcoder::{
    object_fields, remote_id_of, DownstreamCodec, DownstreamSync, EntityTranscoder, EventHandler,
    Push, Tier, UpstreamChange, UpstreamCodec, UpstreamSync,
};
use courier_transport::{Method, PushEvent, Request, RequestBuilder, RetryConfig};
use serde_json::Value;

/// Pushes self-user edits and fetches other users.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserCodec;

impl UpstreamCodec for UserCodec {
    fn kind(&self) -> EntityKind {
        EntityKind::User
    }

    fn request_for(
        &self,
        _store: &dyn ObjectStore,
        record: &Record,
        change: &UpstreamChange,
    ) -> SyncResult<Push> {
        let is_self = record.field("is_self").and_then(Value::as_bool).unwrap_or(false);
        match change {
            UpstreamChange::Update(keys) if is_self => Ok(Push::Send(
                Request::builder(Method::Put, "/self").json(changed_fields(record, keys)),
            )),
            _ => Ok(Push::Skip),
        }
    }
}

impl DownstreamCodec for UserCodec {
    fn kind(&self) -> EntityKind {
        EntityKind::User
    }

    fn fetch_request(&self, remote_id: &str) -> RequestBuilder {
        Request::builder(Method::Get, format!("/users/{remote_id}"))
    }
}

/// Applies `user.update` events.
#[derive(Debug, Default)]
pub struct UserEvents;

impl EventHandler for UserEvents {
    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()> {
        let mutations: Vec<Mutation> = events
            .iter()
            .filter(|e| e.event_type == "user.update")
            .filter_map(|e| {
                let user = e.payload.get("user")?;
                Some(Mutation::UpsertRemote {
                    kind: EntityKind::User,
                    remote_id: remote_id_of(user)?,
                    fields: object_fields(user, &["id"]),
                })
            })
            .collect();
        if !mutations.is_empty() {
            store.apply(ChangeBatch::sync(mutations))?;
        }
        Ok(())
    }
}

/// Builds the user transcoder.
pub fn transcoder(retry: &RetryConfig) -> EntityTranscoder {
    EntityTranscoder::new("user", Tier::State)
        .with_part(UpstreamSync::new(UserCodec, retry.clone()))
        .with_part(DownstreamSync::new(UserCodec, retry.clone()))
        .with_events(UserEvents)
}
