//! Integration tests for the push channel.

use courier_transport::{
    DeliveryQueue, LoopbackPushConnector, PushChannel, PushChannelConfig, PushChannelConsumer,
    PushEvent, PushFrame, PushStatus, ReachabilityMonitor, RetryConfig,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl PushChannelConsumer for Recorder {
    fn did_receive(&self, events: Vec<PushEvent>) {
        let mut seen = self.events.lock();
        for event in events {
            seen.push(event.payload["name"].as_str().unwrap_or("?").to_string());
        }
    }

    fn did_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn did_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn config() -> PushChannelConfig {
    PushChannelConfig::new()
        .with_requires_token(false)
        .with_reconnect(
            RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20))
                .with_jitter(false),
        )
}

fn frame(name: &str) -> PushFrame {
    PushFrame::new(vec![json!({"type": "conversation.message-add", "name": name})])
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn redelivery_after_reconnect_yields_each_event_once() {
    let backend = Arc::new(LoopbackPushConnector::new());
    let channel = PushChannel::spawn(
        config(),
        backend.clone(),
        None,
        Arc::new(ReachabilityMonitor::online()),
    );
    let recorder = Arc::new(Recorder::default());
    channel.configure(recorder.clone(), DeliveryQueue::new());
    eventually(|| channel.status() == PushStatus::Connected).await;

    let b = frame("B");
    backend.publish(frame("A"));
    backend.publish(b.clone());
    eventually(|| recorder.events.lock().len() == 2).await;

    backend.disconnect();
    eventually(|| !backend.is_connected()).await;
    backend.publish(frame("C"));

    eventually(|| recorder.events.lock().len() == 3).await;
    // Give a duplicate time to show up if de-duplication were broken.
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(*recorder.events.lock(), vec!["A", "B", "C"]);
    let connects = backend.connects();
    assert_eq!(connects.first(), Some(&None));
    assert!(connects.iter().skip(1).all(|since| *since == Some(b.id)));
    assert!(recorder.opened.load(Ordering::SeqCst) >= 2);
    assert!(recorder.closed.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn order_is_kept_across_many_frames() {
    let backend = Arc::new(LoopbackPushConnector::new());
    let channel = PushChannel::spawn(
        config(),
        backend.clone(),
        None,
        Arc::new(ReachabilityMonitor::online()),
    );
    let recorder = Arc::new(Recorder::default());
    channel.configure(recorder.clone(), DeliveryQueue::new());
    eventually(|| channel.status() == PushStatus::Connected).await;

    let names: Vec<String> = (0..50).map(|i| format!("e{i}")).collect();
    for name in &names {
        backend.publish(frame(name));
    }
    eventually(|| recorder.events.lock().len() == names.len()).await;
    assert_eq!(*recorder.events.lock(), names);

    channel.close();
    eventually(|| channel.status() == PushStatus::Closed).await;
}
