//! Integration tests for the sync engine against a scripted backend.

use async_trait::async_trait;
use courier_sync::transcoders::message::DELIVERY_STATE;
use courier_sync::{
    EngineConfig, EngineStatus, EntityKind, MemoryStore, ObjectStore, Record,
    StoreConfig, SyncEngine, SyncEngineHandle, SyncError, UpstreamChange,
};
use courier_transport::{
    AccessToken, AccessTokenManager, BackgroundTask, BackgroundTaskState, Method, MockReply,
    MockTransport, Payload, PushFrame, ReachabilityMonitor, RecoveryEntry, RequestId,
    RequestScheduler, Response, RetryConfig, TokenRefresher, TransportConfig, TransportResult,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct StaticRefresher;

#[async_trait]
impl TokenRefresher for StaticRefresher {
    async fn refresh(&self, _previous: Option<AccessToken>) -> TransportResult<AccessToken> {
        Ok(AccessToken::bearer("token", Duration::from_secs(3600)))
    }
}

/// A backend with empty listings that assigns fixed ids to created objects.
fn backend() -> Arc<MockTransport> {
    let transport = Arc::new(MockTransport::new());
    transport.respond_with(|request, _token| {
        let path = request.path();
        let reply = match (request.method(), path) {
            (Method::Get, p) if p.starts_with("/connections?") => {
                MockReply::ok(json!({"connections": [], "has_more": false}))
            }
            (Method::Get, p) if p.starts_with("/conversations?") => {
                MockReply::ok(json!({"conversations": [], "has_more": false}))
            }
            (Method::Post, "/conversations") => MockReply::status(201).json(json!({"id": "c1"})),
            (Method::Post, "/conversations/c1/messages") => {
                MockReply::status(201).json(json!({"id": "m1"}))
            }
            (Method::Get, "/conversations/c9") => {
                MockReply::ok(json!({"id": "c9", "name": "Ops"}))
            }
            (Method::Get, p) if p.starts_with("/users/") => {
                let id = p.trim_start_matches("/users/");
                MockReply::ok(json!({"id": id, "name": "Someone"}))
            }
            _ => return None,
        };
        Some(reply)
    });
    transport
}

fn scheduler(config: TransportConfig, transport: Arc<MockTransport>) -> RequestScheduler {
    RequestScheduler::new(
        config,
        transport,
        AccessTokenManager::new(Arc::new(StaticRefresher)),
        Arc::new(ReachabilityMonitor::online()),
    )
    .unwrap()
}

fn engine_config() -> EngineConfig {
    EngineConfig::new().with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
    )
}

fn start(store: &Arc<MemoryStore>, scheduler: RequestScheduler) -> SyncEngineHandle {
    let store: Arc<dyn ObjectStore> = store.clone();
    SyncEngine::spawn_default(engine_config(), store, scheduler)
}

async fn caught_up(engine: &SyncEngineHandle) {
    tokio::time::timeout(Duration::from_secs(5), engine.wait_until_caught_up())
        .await
        .expect("engine did not catch up")
        .unwrap();
}

#[tokio::test]
async fn local_insert_is_pushed_and_cleared() {
    let store = MemoryStore::new(StoreConfig::new());
    let transport = backend();
    let engine = start(&store, scheduler(TransportConfig::new(4), transport.clone()));
    caught_up(&engine).await;

    let conversation = Record::local(EntityKind::Conversation, Default::default())
        .with_field("name", json!("Design"));
    let conversation_id = conversation.id();
    engine
        .enqueue_changes(move |batch| {
            batch.insert(conversation);
        })
        .await
        .unwrap();
    caught_up(&engine).await;

    let saved = store.fetch(conversation_id).unwrap().unwrap();
    assert_eq!(saved.remote_id(), Some("c1"));
    assert!(!saved.is_dirty());

    let message = Record::local(EntityKind::Message, Default::default())
        .with_field("conversation", json!(conversation_id.to_string()))
        .with_field("text", json!("hello"));
    let message_id = message.id();
    engine
        .enqueue_changes(move |batch| {
            batch.insert(message);
        })
        .await
        .unwrap();
    caught_up(&engine).await;

    let message = store.fetch(message_id).unwrap().unwrap();
    assert_eq!(message.remote_id(), Some("m1"));
    assert_eq!(message.str_field(DELIVERY_STATE), Some("sent"));
    assert!(!message.is_dirty());
    assert!(transport
        .sent_paths()
        .contains(&"/conversations/c1/messages".to_string()));
    assert!(engine.stats().responses_applied >= 4);

    engine.shutdown().await;
    assert_eq!(engine.status(), EngineStatus::Stopped);
}

#[tokio::test]
async fn message_waits_for_conversation_created_after_it() {
    let store = MemoryStore::new(StoreConfig::new());
    let transport = backend();
    let engine = start(&store, scheduler(TransportConfig::new(4), transport.clone()));
    caught_up(&engine).await;

    let conversation = Record::local(EntityKind::Conversation, Default::default());
    let message = Record::local(EntityKind::Message, Default::default())
        .with_field("conversation", json!(conversation.id().to_string()))
        .with_field("text", json!("first"));
    let message_id = message.id();
    engine
        .enqueue_changes(move |batch| {
            batch.insert(message);
            batch.insert(conversation);
        })
        .await
        .unwrap();
    caught_up(&engine).await;

    let paths = transport.sent_paths();
    let created = paths.iter().position(|p| p == "/conversations").unwrap();
    let sent = paths
        .iter()
        .position(|p| p == "/conversations/c1/messages")
        .unwrap();
    assert!(created < sent);
    assert_eq!(store.fetch(message_id).unwrap().unwrap().remote_id(), Some("m1"));
}

#[tokio::test]
async fn push_events_are_applied_and_unknown_objects_fetched() {
    let store = MemoryStore::new(StoreConfig::new());
    let transport = backend();
    let engine = start(&store, scheduler(TransportConfig::new(4), transport.clone()));
    caught_up(&engine).await;

    let consumer = engine.push_consumer();
    consumer.did_receive(
        PushFrame::new(vec![
            json!({"type": "user.update", "user": {"id": "u1", "name": "Ada"}}),
            json!({
                "type": "conversation.message-add",
                "conversation": "c9",
                "data": {"id": "m7", "text": "hi", "from": "u1"},
            }),
        ])
        .events(),
    );
    caught_up(&engine).await;

    let user = store.find_by_remote_id(EntityKind::User, "u1").unwrap().unwrap();
    assert_eq!(user.str_field("name"), Some("Ada"));

    let conversation = store
        .find_by_remote_id(EntityKind::Conversation, "c9")
        .unwrap()
        .unwrap();
    assert!(!conversation.needs_pull());
    assert_eq!(conversation.str_field("name"), Some("Ops"));

    let message = store.find_by_remote_id(EntityKind::Message, "m7").unwrap().unwrap();
    assert_eq!(
        message.str_field("conversation"),
        Some(conversation.id().to_string().as_str())
    );
    assert!(transport.sent_paths().contains(&"/conversations/c9".to_string()));
    assert_eq!(engine.stats().event_batches, 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let store = MemoryStore::new(StoreConfig::new());
    let transport = backend();
    let engine = start(&store, scheduler(TransportConfig::new(1), transport.clone()));
    caught_up(&engine).await;

    transport.push_reply("/conversations", MockReply::status(503));
    transport.push_reply("/conversations", MockReply::status(502));
    let conversation = Record::local(EntityKind::Conversation, Default::default());
    let id = conversation.id();
    engine
        .enqueue_changes(move |batch| {
            batch.insert(conversation);
        })
        .await
        .unwrap();
    caught_up(&engine).await;

    assert_eq!(store.fetch(id).unwrap().unwrap().remote_id(), Some("c1"));
    let attempts = transport
        .sent_paths()
        .iter()
        .filter(|p| p.as_str() == "/conversations")
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn store_failure_stops_the_engine() {
    let store = MemoryStore::new(StoreConfig::new());
    let transport = backend();
    let engine = start(&store, scheduler(TransportConfig::new(4), transport.clone()));
    caught_up(&engine).await;

    let sent_before = transport.sent_count();
    transport.pause();
    engine
        .enqueue_changes(|batch| {
            batch.insert(Record::local(EntityKind::Conversation, Default::default()));
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.sent_count() == sent_before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    store.close();
    transport.resume();

    let result = tokio::time::timeout(Duration::from_secs(5), engine.wait_until_caught_up())
        .await
        .unwrap();
    assert!(matches!(result, Err(SyncError::EngineFailed(_))));
    assert!(matches!(engine.status(), EngineStatus::Failed(_)));
    assert!(engine.stats().last_error.is_some());
}

#[tokio::test]
async fn delayed_save_failure_stops_the_engine() {
    let store = MemoryStore::new(StoreConfig::new().with_save_delay(Duration::from_millis(20)));
    let transport = backend();
    let engine = start(&store, scheduler(TransportConfig::new(4), transport.clone()));
    caught_up(&engine).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.pause();
    store.fail_next_saves(1);
    engine
        .enqueue_changes(|batch| {
            batch.insert(Record::local(EntityKind::Conversation, Default::default()));
        })
        .await
        .unwrap();

    let mut status = engine.subscribe_status();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !matches!(*status.borrow_and_update(), EngineStatus::Failed(_)) {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(engine.status(), EngineStatus::Failed(_)));
    let last_error = engine.stats().last_error.unwrap();
    assert!(last_error.contains("save failed"));
    transport.resume();
}

#[tokio::test]
async fn failed_final_save_is_recorded() {
    let store = MemoryStore::new(StoreConfig::new().with_save_delay(Duration::from_secs(60)));
    let engine = start(&store, scheduler(TransportConfig::new(2), backend()));
    caught_up(&engine).await;
    engine
        .enqueue_changes(|batch| {
            batch.insert(Record::local(EntityKind::Conversation, Default::default()));
        })
        .await
        .unwrap();
    caught_up(&engine).await;

    store.fail_next_saves(1);
    engine.shutdown().await;

    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(engine.stats().last_error.unwrap().contains("save failed"));
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn recovered_upload_is_adopted_not_resent() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new(StoreConfig::new());
    let conversation = Record::remote(EntityKind::Conversation, "c1", Default::default());
    let message = Record::local(EntityKind::Message, Default::default())
        .with_field("conversation", json!(conversation.id().to_string()))
        .with_field("text", json!("sent before suspension"));
    let message_id = message.id();
    let change = UpstreamChange::of(&message).unwrap();
    courier_sync::perform_changes(store.as_ref(), |batch| {
        batch.insert(conversation);
        batch.insert(message);
    })
    .unwrap();

    let transport = backend();
    let request_id = RequestId::new();
    transport.add_background_task(
        "courier.test",
        BackgroundTask {
            task_id: "task-1".into(),
            state: BackgroundTaskState::Completed(Response::from_status(
                request_id,
                201,
                Some(Payload::Json(json!({"id": "m42"}))),
            )),
        },
    );
    let config = TransportConfig::new(4)
        .with_background_session("courier.test", dir.path().join("recovery.cbor"));
    let scheduler = scheduler(config, transport.clone());
    scheduler
        .recovery_log()
        .unwrap()
        .record(RecoveryEntry::new(
            request_id,
            Some(change.tag(EntityKind::Message, message_id)),
            Method::Post,
            "/conversations/c1/messages",
            "courier.test",
            "task-1",
        ))
        .unwrap();

    let engine = start(&store, scheduler.clone());
    caught_up(&engine).await;

    let message = store.fetch(message_id).unwrap().unwrap();
    assert_eq!(message.remote_id(), Some("m42"));
    assert_eq!(message.str_field(DELIVERY_STATE), Some("sent"));
    assert!(!transport
        .sent_paths()
        .contains(&"/conversations/c1/messages".to_string()));
    assert_eq!(engine.stats().recovered_applied, 1);
    assert!(scheduler.recovery_log().unwrap().is_empty());
}

#[tokio::test]
async fn dropping_every_handle_saves_and_stops() {
    let store = MemoryStore::new(StoreConfig::new().with_save_delay(Duration::from_secs(60)));
    let engine = start(&store, scheduler(TransportConfig::new(2), backend()));
    caught_up(&engine).await;
    engine
        .enqueue_changes(|batch| {
            batch.insert(Record::local(EntityKind::Conversation, Default::default()));
        })
        .await
        .unwrap();
    caught_up(&engine).await;
    assert_eq!(store.save_count(), 0);

    let mut status = engine.subscribe_status();
    drop(engine);
    tokio::time::timeout(Duration::from_secs(5), async {
        while *status.borrow_and_update() != EngineStatus::Stopped {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(*status.borrow(), EngineStatus::Stopped);
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.pending_changes(), 0);
}
