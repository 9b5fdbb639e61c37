//! Integration tests for the request scheduler.

use async_trait::async_trait;
use courier_transport::{
    AccessToken, AccessTokenManager, BackgroundTask, BackgroundTaskState, Method, MockReply,
    MockTransport, NetworkState, NetworkStateDelegate, ReachabilityMonitor, RecoveryEntry,
    RecoveryLog, Request, RequestId, RequestScheduler, Response, TokenPolicy, TokenRefresher,
    TransportConfig, TransportError, TransportResult,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct SlowRefresher {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl TokenRefresher for SlowRefresher {
    async fn refresh(&self, _previous: Option<AccessToken>) -> TransportResult<AccessToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        if self.fail {
            Err(TransportError::AuthenticationFailed("session revoked".into()))
        } else {
            Ok(AccessToken::bearer("fresh", Duration::from_secs(3600)))
        }
    }
}

fn refresher(fail: bool) -> Arc<SlowRefresher> {
    Arc::new(SlowRefresher {
        calls: AtomicUsize::new(0),
        fail,
    })
}

fn build(
    config: TransportConfig,
    transport: Arc<MockTransport>,
    tokens: AccessTokenManager,
) -> RequestScheduler {
    RequestScheduler::new(
        config,
        transport,
        tokens,
        Arc::new(ReachabilityMonitor::online()),
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn in_flight_never_exceeds_ceiling(
        max in 1usize..6,
        offers in prop::collection::vec(any::<bool>(), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let transport = Arc::new(MockTransport::new());
            transport.pause();
            let tokens = AccessTokenManager::new(refresher(false));
            tokens.set_token(AccessToken::bearer("t", Duration::from_secs(3600)));
            let scheduler = build(TransportConfig::new(max), transport.clone(), tokens);

            let mut admitted = 0usize;
            for generate in offers.iter().copied() {
                let result = scheduler.attempt_to_enqueue(|| generate.then(|| Request::get("/x")));
                if result.generated {
                    admitted += 1;
                }
                assert!(scheduler.in_flight() <= max);
                if result.generated {
                    assert_eq!(result.has_capacity, scheduler.in_flight() < max);
                }
                tokio::task::yield_now().await;
                assert!(transport.max_in_flight() <= max);
            }

            let offered = offers.iter().filter(|g| **g).count();
            assert_eq!(admitted, offered.min(max));
        });
    }
}

#[tokio::test]
async fn refresh_failure_fails_all_parked_requests() {
    let refresher = refresher(true);
    let tokens = AccessTokenManager::new(refresher.clone());
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    tokens.on_refresh_failure(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let transport = Arc::new(MockTransport::new());
    let scheduler = build(TransportConfig::new(4), transport.clone(), tokens);

    let mut handles = Vec::new();
    for path in ["/a", "/b", "/c"] {
        let mut request = Request::builder(Method::Get, path)
            .token_policy(TokenPolicy::Required)
            .build();
        handles.push(request.response_handle());
        assert!(scheduler.attempt_to_enqueue(move || Some(request)).generated);
    }

    for handle in handles {
        let response = handle.response().await;
        assert!(matches!(
            response.error(),
            Some(TransportError::AuthenticationFailed(_))
        ));
    }
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.sent_count(), 0);

    // Later requests fail without another refresh until a token is supplied.
    let mut request = Request::builder(Method::Get, "/d")
        .token_policy(TokenPolicy::Required)
        .build();
    let handle = request.response_handle();
    scheduler.attempt_to_enqueue(move || Some(request));
    assert!(handle.response().await.error().is_some());
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

    scheduler
        .tokens()
        .set_token(AccessToken::bearer("manual", Duration::from_secs(3600)));
    let mut request = Request::get("/e");
    let handle = request.response_handle();
    scheduler.attempt_to_enqueue(move || Some(request));
    assert!(handle.response().await.is_success());
}

#[tokio::test]
async fn concurrent_unauthorized_responses_refresh_once() {
    let refresher = refresher(false);
    let tokens = AccessTokenManager::new(refresher.clone());
    tokens.set_token(AccessToken::bearer("stale", Duration::from_secs(3600)));

    let transport = Arc::new(MockTransport::new());
    transport.respond_with(|_, token| match token.map(|t| t.value()) {
        Some("fresh") => None,
        _ => Some(MockReply::status(401)),
    });
    let scheduler = build(TransportConfig::new(4), transport.clone(), tokens);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let mut request = Request::get("/self");
        handles.push(request.response_handle());
        scheduler.attempt_to_enqueue(move || Some(request));
    }
    for handle in handles {
        assert!(handle.response().await.is_success());
    }

    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    let sent = transport.sent();
    assert_eq!(sent.len(), 6);
    assert!(sent.iter().all(|r| r.token.is_some()));
}

#[tokio::test]
async fn late_result_after_cancellation_is_discarded() {
    let transport = Arc::new(MockTransport::new());
    transport.set_default_reply(MockReply::status(200).delay(Duration::from_millis(50)));
    let tokens = AccessTokenManager::new(refresher(false));
    tokens.set_token(AccessToken::bearer("t", Duration::from_secs(3600)));
    let scheduler = build(TransportConfig::new(1), transport.clone(), tokens);

    let mut request = Request::get("/slow");
    let handle = request.response_handle();
    let canceller = handle.canceller();
    scheduler.attempt_to_enqueue(move || Some(request));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.sent_count(), 1);
    canceller.cancel();

    let response = handle.response().await;
    assert!(response.is_cancelled());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn cancelled_before_dispatch_never_reaches_network() {
    let transport = Arc::new(MockTransport::new());
    transport.pause();
    let tokens = AccessTokenManager::new(refresher(false));
    tokens.set_token(AccessToken::bearer("t", Duration::from_secs(3600)));
    let scheduler = build(TransportConfig::new(1), transport.clone(), tokens);

    scheduler.attempt_to_enqueue(|| Some(Request::get("/blocking")));

    let mut waiting = Request::get("/waiting");
    let handle = waiting.response_handle();
    handle.cancel();
    scheduler.enqueue_one_time(waiting);

    assert!(handle.response().await.is_cancelled());
    assert_eq!(transport.sent_paths(), vec!["/blocking".to_string()]);
}

#[tokio::test]
async fn one_time_request_waits_for_network() {
    let transport = Arc::new(MockTransport::new());
    let tokens = AccessTokenManager::new(refresher(false));
    tokens.set_token(AccessToken::bearer("t", Duration::from_secs(3600)));
    let reachability = Arc::new(ReachabilityMonitor::new(NetworkState::Offline));
    let scheduler = RequestScheduler::new(
        TransportConfig::new(2),
        transport.clone(),
        tokens,
        reachability.clone(),
    )
    .unwrap();

    let mut request = Request::get("/one-time");
    let handle = request.response_handle();
    scheduler.enqueue_one_time(request);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent_count(), 0);

    reachability.set_state(NetworkState::Online);
    let response = tokio::time::timeout(Duration::from_secs(5), handle.response())
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(transport.sent_paths(), vec!["/one-time".to_string()]);
}

struct RecordingDelegate {
    received: AtomicUsize,
    offline: AtomicUsize,
}

impl NetworkStateDelegate for RecordingDelegate {
    fn did_receive_data(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn did_go_offline(&self) {
        self.offline.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn network_state_delegate_sees_responses() {
    let transport = Arc::new(MockTransport::new());
    transport.push_reply("/down", MockReply::error(TransportError::network("unreachable")));
    let tokens = AccessTokenManager::new(refresher(false));
    tokens.set_token(AccessToken::bearer("t", Duration::from_secs(3600)));
    let scheduler = build(TransportConfig::new(2), transport, tokens);
    let delegate = Arc::new(RecordingDelegate {
        received: AtomicUsize::new(0),
        offline: AtomicUsize::new(0),
    });
    scheduler.set_network_state_delegate(delegate.clone());

    for path in ["/up", "/down"] {
        let mut request = Request::get(path);
        let handle = request.response_handle();
        scheduler.attempt_to_enqueue(move || Some(request));
        handle.response().await;
    }

    assert_eq!(delegate.received.load(Ordering::SeqCst), 1);
    assert_eq!(delegate.offline.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn suspension_routes_requests_through_recovery_log() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("recovery.cbor");
    let transport = Arc::new(MockTransport::new());
    transport.pause();
    let tokens = AccessTokenManager::new(refresher(false));
    tokens.set_token(AccessToken::bearer("t", Duration::from_secs(3600)));
    let config = TransportConfig::new(2).with_background_session("bg", &log_path);
    let scheduler = build(config, transport.clone(), tokens);

    scheduler.prepare_for_suspension();
    let mut request = Request::builder(Method::Post, "/conversations/c1/messages")
        .tag("message")
        .build();
    let handle = request.response_handle();
    scheduler.attempt_to_enqueue(move || Some(request));
    tokio::task::yield_now().await;

    let logged = RecoveryLog::read(&log_path).unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].tag.as_deref(), Some("message"));
    assert_eq!(logged[0].session, "bg");

    transport.resume();
    assert!(handle.response().await.is_success());
    assert!(transport.sent()[0].background.is_some());
    assert!(RecoveryLog::read(&log_path).unwrap().is_empty());
}

#[tokio::test]
async fn reattach_delivers_finished_running_and_lost_tasks() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("recovery.cbor");

    let finished = RequestId::new();
    let running = RequestId::new();
    let missing = RequestId::new();
    {
        let log = RecoveryLog::open(&log_path).unwrap();
        for (id, task) in [(finished, "t1"), (running, "t2"), (missing, "t3")] {
            log.record(RecoveryEntry::new(
                id,
                Some("message".into()),
                Method::Post,
                "/conversations/c1/messages",
                "bg",
                task,
            ))
            .unwrap();
        }
    }

    let transport = Arc::new(MockTransport::new());
    transport.add_background_task(
        "bg",
        BackgroundTask {
            task_id: "t1".into(),
            state: BackgroundTaskState::Completed(Response::from_status(RequestId::new(), 201, None)),
        },
    );
    transport.add_background_task(
        "bg",
        BackgroundTask {
            task_id: "t2".into(),
            state: BackgroundTaskState::Running,
        },
    );

    let tokens = AccessTokenManager::new(refresher(false));
    let config = TransportConfig::new(2).with_background_session("bg", &log_path);
    let scheduler = build(config, transport.clone(), tokens);

    let mut recovered = scheduler.reattach_background_tasks().await.unwrap();
    let drained = Arc::new(Mutex::new(false));
    let flag = drained.clone();
    scheduler.add_completion_handler_for_background_session("bg", move || *flag.lock() = true);

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(recovered.recv().await.unwrap());
    }
    assert!(seen
        .iter()
        .any(|r| r.request_id == finished && r.response.status() == Some(201)));
    assert!(seen
        .iter()
        .any(|r| r.request_id == missing && r.response.error().is_some()));
    assert!(!*drained.lock());

    transport.complete_background_task("bg", "t2", Response::from_status(RequestId::new(), 200, None));
    let last = recovered.recv().await.unwrap();
    assert_eq!(last.request_id, running);
    assert_eq!(last.response.request_id(), running);
    assert_eq!(last.tag.as_deref(), Some("message"));

    tokio::task::yield_now().await;
    assert!(*drained.lock());
    assert!(RecoveryLog::read(&log_path).unwrap().is_empty());
}

#[tokio::test]
async fn reattach_settles_session_when_log_cannot_be_rewritten() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("recovery.cbor");

    let finished = RequestId::new();
    let running = RequestId::new();
    {
        let log = RecoveryLog::open(&log_path).unwrap();
        for (id, task) in [(finished, "t1"), (running, "t2")] {
            log.record(RecoveryEntry::new(
                id,
                None,
                Method::Post,
                "/conversations/c1/messages",
                "bg",
                task,
            ))
            .unwrap();
        }
    }

    let transport = Arc::new(MockTransport::new());
    transport.add_background_task(
        "bg",
        BackgroundTask {
            task_id: "t1".into(),
            state: BackgroundTaskState::Completed(Response::from_status(RequestId::new(), 201, None)),
        },
    );
    transport.add_background_task(
        "bg",
        BackgroundTask {
            task_id: "t2".into(),
            state: BackgroundTaskState::Running,
        },
    );

    let tokens = AccessTokenManager::new(refresher(false));
    let config = TransportConfig::new(2).with_background_session("bg", &log_path);
    let scheduler = build(config, transport.clone(), tokens);

    // A directory in place of the temp file makes every rewrite fail.
    std::fs::create_dir(log_path.with_extension("tmp")).unwrap();

    let mut recovered = scheduler.reattach_background_tasks().await.unwrap();
    assert_eq!(recovered.recv().await.unwrap().request_id, finished);

    let drained = Arc::new(Mutex::new(false));
    let flag = drained.clone();
    scheduler.add_completion_handler_for_background_session("bg", move || *flag.lock() = true);
    assert!(!*drained.lock());

    transport.complete_background_task("bg", "t2", Response::from_status(RequestId::new(), 200, None));
    assert_eq!(recovered.recv().await.unwrap().request_id, running);

    tokio::task::yield_now().await;
    assert!(*drained.lock());
}

#[tokio::test]
async fn offline_then_online_wakes_subscribers() {
    let transport = Arc::new(MockTransport::new());
    let reachability = Arc::new(ReachabilityMonitor::online());
    let scheduler = RequestScheduler::new(
        TransportConfig::new(1),
        transport,
        AccessTokenManager::new(refresher(false)),
        reachability.clone(),
    )
    .unwrap();
    let mut wakeups = scheduler.subscribe_new_requests();

    reachability.set_state(NetworkState::Offline);
    assert!(!scheduler.can_send());
    reachability.set_state(NetworkState::Online);

    tokio::time::timeout(Duration::from_secs(1), wakeups.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(scheduler.can_send());
}
