//! Registration of this device's client.

use super::{changed_fields, payload_str};
use crate::error::SyncResult;
use crate::store::{ChangeBatch, EntityKind, Mutation, ObjectStore, Record};
use crate::transcoder::{
    EntityTranscoder, EventHandler, Push, Tier, UpstreamChange, UpstreamCodec, UpstreamSync,
};
use courier_transport::{Method, Priority, PushEvent, Request, RetryConfig};
use tracing::info;

/// Pushes the self-client record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCodec;

impl UpstreamCodec for ClientCodec {
    fn kind(&self) -> EntityKind {
        EntityKind::SelfClient
    }

    fn request_for(
        &self,
        _store: &dyn ObjectStore,
        record: &Record,
        change: &UpstreamChange,
    ) -> SyncResult<Push> {
        let builder = match (change, record.remote_id()) {
            (UpstreamChange::Insert(keys), _) => {
                Request::builder(Method::Post, "/clients").json(changed_fields(record, keys))
            }
            (UpstreamChange::Update(keys), Some(remote_id)) => {
                Request::builder(Method::Put, format!("/clients/{remote_id}"))
                    .json(changed_fields(record, keys))
            }
            (UpstreamChange::Delete, Some(remote_id)) => {
                Request::builder(Method::Delete, format!("/clients/{remote_id}"))
            }
            (_, None) => return Ok(Push::Skip),
        };
        Ok(Push::Send(builder.priority(Priority::High)))
    }
}

/// Drops the self-client when the backend removes it.
#[derive(Debug, Default)]
pub struct ClientEvents;

impl EventHandler for ClientEvents {
    fn process_events(&mut self, store: &dyn ObjectStore, events: &[PushEvent]) -> SyncResult<()> {
        let mut mutations = Vec::new();
        for event in events.iter().filter(|e| e.event_type == "user.client-remove") {
            let client = event.payload.get("client");
            let Some(client_id) = client.and_then(|c| payload_str(c, "id")) else {
                continue;
            };
            if let Some(record) = store.find_by_remote_id(EntityKind::SelfClient, client_id)? {
                info!(client = client_id, "self client removed remotely");
                mutations.push(Mutation::Remove { id: record.id() });
            }
        }
        if !mutations.is_empty() {
            store.apply(ChangeBatch::sync(mutations))?;
        }
        Ok(())
    }
}

/// Builds the client registration transcoder.
pub fn transcoder(retry: &RetryConfig) -> EntityTranscoder {
    EntityTranscoder::new("client", Tier::Session)
        .with_part(UpstreamSync::new(ClientCodec, retry.clone()))
        .with_events(ClientEvents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{perform_changes, MemoryStore, StoreConfig};
    use crate::transcoder::object_fields;
    use courier_transport::PushFrame;
    use serde_json::json;

    #[test]
    fn registration_posts_client_fields() {
        let store = MemoryStore::new(StoreConfig::new());
        let record = Record::local(
            EntityKind::SelfClient,
            object_fields(&json!({"label": "laptop", "type": "permanent"}), &[]),
        );
        let change = UpstreamChange::of(&record).unwrap();

        let push = ClientCodec.request_for(store.as_ref(), &record, &change).unwrap();
        let Push::Send(builder) = push else {
            panic!("expected a request");
        };
        let request = builder.build();
        assert_eq!(request.path(), "/clients");
        assert_eq!(
            request.body().and_then(|b| b.as_json()).unwrap(),
            &json!({"label": "laptop", "type": "permanent"})
        );
    }

    #[test]
    fn remote_removal_deletes_self_client() {
        let store = MemoryStore::new(StoreConfig::new());
        let record = Record::remote(EntityKind::SelfClient, "c1", Default::default());
        let id = record.id();
        perform_changes(store.as_ref(), |batch| {
            batch.insert(record);
        })
        .unwrap();

        let events =
            PushFrame::new(vec![json!({"type": "user.client-remove", "client": {"id": "c1"}})])
                .events();
        ClientEvents.process_events(store.as_ref(), &events).unwrap();
        assert!(store.fetch(id).unwrap().is_none());
    }
}
