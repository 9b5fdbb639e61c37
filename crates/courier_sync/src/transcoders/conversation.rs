//! Conversations and their membership.

use super::{
    changed_fields, decode_page, payload_str, resolve_or_stub, upsert_remote, PAGE_SIZE,
};
use crate::error::SyncResult;
use crate::store::{ChangeBatch, EntityKind, Fields, Mutation, ObjectStore, Record};
use crate::transcoder::{
    object_fields, DownstreamCodec, DownstreamSync, EntityTranscoder, EventHandler, Page,
    PagedCodec, PagedSync, Push, Tier, UpstreamChange, UpstreamCodec, UpstreamSync,
};
use courier_transport::{Method, PushEvent, Request, RequestBuilder, Response, RetryConfig};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Pushes conversation edits and fetches single conversations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationCodec;

impl UpstreamCodec for ConversationCodec {
    fn kind(&self) -> EntityKind {
        EntityKind::Conversation
    }

    fn request_for(
        &self,
        _store: &dyn ObjectStore,
        record: &Record,
        change: &UpstreamChange,
    ) -> SyncResult<Push> {
        let builder = match (change, record.remote_id()) {
            (UpstreamChange::Insert(keys), _) => {
                Request::builder(Method::Post, "/conversations").json(changed_fields(record, keys))
            }
            (UpstreamChange::Update(keys), Some(remote_id)) => {
                Request::builder(Method::Put, format!("/conversations/{remote_id}"))
                    .json(changed_fields(record, keys))
            }
            (UpstreamChange::Delete, Some(remote_id)) => {
                Request::builder(Method::Delete, format!("/conversations/{remote_id}"))
            }
            _ => return Ok(Push::Skip),
        };
        Ok(Push::Send(builder))
    }
}

impl DownstreamCodec for ConversationCodec {
    fn kind(&self) -> EntityKind {
        EntityKind::Conversation
    }

    fn fetch_request(&self, remote_id: &str) -> RequestBuilder {
        Request::builder(Method::Get, format!("/conversations/{remote_id}"))
    }
}

/// Lists all conversations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationListing;

impl PagedCodec for ConversationListing {
    fn listing(&self) -> &'static str {
        "conversations"
    }

    fn page_request(&self, cursor: Option<&str>) -> RequestBuilder {
        let path = match cursor {
            Some(start) => format!("/conversations?size={PAGE_SIZE}&start={start}"),
            None => format!("/conversations?size={PAGE_SIZE}"),
        };
        Request::builder(Method::Get, path)
    }

    fn on_page(&self, response: &Response) -> SyncResult<Page> {
        decode_page(response, "conversations", EntityKind::Conversation)
    }
}

/// Applies conversation lifecycle and membership events.
#[derive(Debug, Default)]
pub struct ConversationEvents;

impl EventHandler for ConversationEvents {
    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()> {
        let mut mutations = Vec::new();
        // Member lists touched earlier in this batch.
        let mut members: HashMap<String, Vec<String>> = HashMap::new();

        for event in events {
            if !event.event_type.starts_with("conversation.") {
                continue;
            }
            let Some(conversation) = payload_str(&event.payload, "conversation") else {
                continue;
            };
            let data = event.payload.get("data").cloned().unwrap_or(Value::Null);

            match event.event_type.as_str() {
                "conversation.create" | "conversation.rename" => {
                    // A rename of an unknown conversation leaves the rest to a pull.
                    if event.event_type.ends_with("rename") {
                        resolve_or_stub(store, EntityKind::Conversation, conversation, &mut mutations)?;
                    }
                    let fields = object_fields(&data, &["id"]);
                    upsert_remote(store, EntityKind::Conversation, conversation, fields, &mut mutations)?;
                }
                "conversation.member-join" | "conversation.member-leave" => {
                    resolve_or_stub(store, EntityKind::Conversation, conversation, &mut mutations)?;
                    let current = match members.get(conversation) {
                        Some(list) => list.clone(),
                        None => store
                            .find_by_remote_id(EntityKind::Conversation, conversation)?
                            .and_then(|r| r.field("members").map(member_list))
                            .unwrap_or_default(),
                    };
                    let changed = data.get("user_ids").map(member_list).unwrap_or_default();
                    let updated: Vec<String> = if event.event_type.ends_with("join") {
                        let mut list = current;
                        for user in changed {
                            resolve_or_stub(store, EntityKind::User, &user, &mut mutations)?;
                            if !list.contains(&user) {
                                list.push(user);
                            }
                        }
                        list
                    } else {
                        current.into_iter().filter(|u| !changed.contains(u)).collect()
                    };

                    let mut fields = Fields::new();
                    fields.insert("members".into(), Value::from(updated.clone()));
                    upsert_remote(store, EntityKind::Conversation, conversation, fields, &mut mutations)?;
                    members.insert(conversation.to_string(), updated);
                }
                "conversation.delete" => {
                    if let Some(record) =
                        store.find_by_remote_id(EntityKind::Conversation, conversation)?
                    {
                        mutations.push(Mutation::Remove { id: record.id() });
                    }
                }
                other => debug!(event_type = other, "ignoring conversation event"),
            }
        }

        if !mutations.is_empty() {
            store.apply(ChangeBatch::sync(mutations))?;
        }
        Ok(())
    }
}

fn member_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Builds the conversation transcoder.
pub fn transcoder(retry: &RetryConfig) -> EntityTranscoder {
    EntityTranscoder::new("conversation", Tier::State)
        .with_part(UpstreamSync::new(ConversationCodec, retry.clone()))
        .with_part(DownstreamSync::new(ConversationCodec, retry.clone()))
        .with_part(PagedSync::new(ConversationListing, retry.clone()))
        .with_events(ConversationEvents)
}
