//! Messages.
//!
//! Outgoing messages are sent as background requests so an upload survives
//! process suspension. A message waits until its conversation has a remote
//! id.

use super::{changed_fields, payload_str, resolve_or_stub, upsert_remote};
use crate::error::SyncResult;
use crate::store::{ChangeBatch, EntityKind, Fields, Mutation, ObjectId, ObjectStore, Record};
use crate::transcoder::{
    acknowledge, object_fields, remote_id_of, EntityTranscoder, EventHandler, Push, Tier,
    UpstreamChange, UpstreamCodec, UpstreamSync,
};
use courier_transport::{Method, Priority, PushEvent, Request, Response, RetryConfig};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::trace;

/// Deadline for message uploads.
pub const SEND_EXPIRATION: Duration = Duration::from_secs(60);

/// Delivery state of a message sent from this device.
pub const DELIVERY_STATE: &str = "delivery_state";

fn state_field(state: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(DELIVERY_STATE.to_string(), Value::from(state));
    fields
}

/// Uploads, edits and deletes messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// `None` once the conversation is gone, `Some(None)` while it has no
    /// remote id yet.
    fn conversation_remote_id(
        store: &dyn ObjectStore,
        record: &Record,
    ) -> SyncResult<Option<Option<String>>> {
        let Some(conversation) = record.str_field("conversation").and_then(ObjectId::parse) else {
            return Ok(None);
        };
        Ok(store
            .fetch(conversation)?
            .map(|c| c.remote_id().map(str::to_string)))
    }
}

impl UpstreamCodec for MessageCodec {
    fn kind(&self) -> EntityKind {
        EntityKind::Message
    }

    fn request_for(
        &self,
        store: &dyn ObjectStore,
        record: &Record,
        change: &UpstreamChange,
    ) -> SyncResult<Push> {
        let conversation = match Self::conversation_remote_id(store, record)? {
            None => return Ok(Push::Skip),
            Some(None) => return Ok(Push::Wait),
            Some(Some(remote_id)) => remote_id,
        };
        let messages = format!("/conversations/{conversation}/messages");

        let builder = match (change, record.remote_id()) {
            (UpstreamChange::Insert(_), _) => Request::builder(Method::Post, messages)
                .json(json!({
                    "text": record.field("text").cloned().unwrap_or(Value::Null),
                    "nonce": record.id().to_string(),
                }))
                .background()
                .priority(Priority::High)
                .expires_in(SEND_EXPIRATION),
            (UpstreamChange::Update(keys), Some(remote_id)) => {
                Request::builder(Method::Put, format!("{messages}/{remote_id}"))
                    .json(changed_fields(record, keys))
            }
            (UpstreamChange::Delete, Some(remote_id)) => {
                Request::builder(Method::Delete, format!("{messages}/{remote_id}"))
            }
            _ => return Ok(Push::Skip),
        };
        Ok(Push::Send(builder))
    }

    fn on_success(
        &self,
        record: &Record,
        change: &UpstreamChange,
        response: &Response,
    ) -> SyncResult<Vec<Mutation>> {
        let mut mutations = acknowledge(record, change, response)?;
        if matches!(change, UpstreamChange::Insert(_)) {
            mutations.push(Mutation::Update {
                id: record.id(),
                fields: state_field("sent"),
            });
        }
        Ok(mutations)
    }

    fn on_rejected(&self, record: &Record, change: &UpstreamChange) -> Vec<Mutation> {
        let id = record.id();
        let mut mutations = vec![Mutation::ClearModified {
            id,
            keys: change.keys().to_vec(),
        }];
        if matches!(change, UpstreamChange::Insert(_)) {
            mutations.push(Mutation::ClearInserted { id });
            mutations.push(Mutation::Update {
                id,
                fields: state_field("failed"),
            });
        }
        mutations
    }
}

/// Applies message events.
#[derive(Debug, Default)]
pub struct MessageEvents;

impl EventHandler for MessageEvents {
    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()> {
        let mut mutations = Vec::new();
        for event in events {
            let Some(conversation) = payload_str(&event.payload, "conversation") else {
                continue;
            };
            let data = event.payload.get("data").cloned().unwrap_or(Value::Null);
            let Some(message_id) = remote_id_of(&data) else {
                continue;
            };

            match event.event_type.as_str() {
                "conversation.message-add" => {
                    let own = payload_str(&data, "nonce")
                        .and_then(ObjectId::parse)
                        .map(|nonce| store.fetch(nonce))
                        .transpose()?
                        .flatten();
                    if own.is_some() {
                        trace!(message = %message_id, "echo of own message");
                        continue;
                    }
                    let conversation_id =
                        resolve_or_stub(store, EntityKind::Conversation, conversation, &mut mutations)?;
                    let mut fields = object_fields(&data, &["id", "nonce"]);
                    fields.insert("conversation".into(), Value::from(conversation_id.to_string()));
                    fields.extend(state_field("delivered"));
                    upsert_remote(store, EntityKind::Message, &message_id, fields, &mut mutations)?;
                }
                "conversation.message-delete" => {
                    if let Some(record) = store.find_by_remote_id(EntityKind::Message, &message_id)? {
                        mutations.push(Mutation::Remove { id: record.id() });
                    }
                }
                _ => {}
            }
        }
        if !mutations.is_empty() {
            store.apply(ChangeBatch::sync(mutations))?;
        }
        Ok(())
    }
}

/// Builds the message transcoder.
pub fn transcoder(retry: &RetryConfig) -> EntityTranscoder {
    EntityTranscoder::new("message", Tier::Content)
        .with_part(UpstreamSync::new(MessageCodec, retry.clone()))
        .with_events(MessageEvents)
}
