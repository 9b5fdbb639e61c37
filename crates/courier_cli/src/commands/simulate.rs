//! Simulate command implementation.

use super::{CliError, CliResult};
use crate::backend::{BackendConfig, BackendStats, SimulatedBackend};
use courier_sync::transcoders::message::DELIVERY_STATE;
use courier_sync::{
    EngineConfig, EngineStats, EntityKind, Fields, MemoryStore, ObjectStore, Record, StoreConfig,
    SyncEngine, SyncEngineHandle,
};
use courier_transport::{
    AccessEndpointRefresher, AccessTokenManager, DeliveryQueue, HttpTransport, LoopbackClient,
    LoopbackPushConnector, PushChannel, PushChannelConfig, ReachabilityMonitor, RequestScheduler,
    RetryConfig, Transport, TransportConfig,
};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Background session used when a recovery log is requested.
const BACKGROUND_SESSION: &str = "courier.simulate";

/// Workload and backend settings.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Conversations created locally.
    pub conversations: usize,
    /// Messages created in each conversation.
    pub messages_per_conversation: usize,
    /// Scheduler concurrency.
    pub max_concurrent: usize,
    /// Backend 5xx probability.
    pub failure_rate: f64,
    /// Mean backend latency.
    pub latency: Duration,
    /// How long to wait for the engine to catch up.
    pub timeout: Duration,
    /// Recovery log for background uploads.
    pub recovery_log: Option<PathBuf>,
}

/// Local objects of one kind after the run.
#[derive(Debug, Serialize)]
pub struct KindSummary {
    /// Entity kind.
    pub kind: &'static str,
    /// Objects in the store.
    pub objects: usize,
    /// Objects with unpushed local changes.
    pub dirty: usize,
    /// Objects still waiting for a fetch.
    pub needs_pull: usize,
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Whether the engine caught up before the timeout.
    pub caught_up: bool,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u128,
    /// Messages acknowledged by the backend.
    pub messages_sent: usize,
    /// Messages the engine gave up on.
    pub messages_failed: usize,
    /// Store contents per kind.
    pub kinds: Vec<KindSummary>,
    /// Engine counters.
    pub engine: EngineStats,
    /// Backend counters.
    pub backend: BackendStats,
}

/// Runs the simulate command.
pub async fn run(options: SimulateOptions, format: &str) -> CliResult<()> {
    let timeout = options.timeout;
    let report = simulate(options).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }

    if report.caught_up {
        Ok(())
    } else {
        Err(CliError::Timeout(timeout))
    }
}

/// Runs one session against a fresh simulated backend.
pub async fn simulate(options: SimulateOptions) -> CliResult<SimulationReport> {
    validate(&options)?;
    let started = Instant::now();

    let push = Arc::new(LoopbackPushConnector::new());
    let backend = SimulatedBackend::new(
        BackendConfig::new()
            .with_failure_rate(options.failure_rate)
            .with_latency(options.latency),
        push.clone(),
    );
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        "https://backend.simulated",
        LoopbackClient::new(backend.clone()),
    ));
    let tokens = AccessTokenManager::new(Arc::new(AccessEndpointRefresher::new(
        transport.clone(),
        "/access",
    )));
    let reachability = Arc::new(ReachabilityMonitor::online());

    let mut transport_config = TransportConfig::new(options.max_concurrent).with_rate_limit_backoff(
        RetryConfig::new(u32::MAX)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2)),
    );
    if let Some(path) = &options.recovery_log {
        transport_config = transport_config.with_background_session(BACKGROUND_SESSION, path.clone());
    }
    let scheduler = RequestScheduler::new(
        transport_config,
        transport,
        tokens.clone(),
        reachability.clone(),
    )?;

    let store: Arc<dyn ObjectStore> = MemoryStore::new(StoreConfig::new());
    let engine = SyncEngine::spawn_default(
        EngineConfig::new().with_retry(
            RetryConfig::new(8)
                .with_initial_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_secs(2)),
        ),
        store.clone(),
        scheduler,
    );
    let channel = PushChannel::spawn(
        PushChannelConfig::new().with_requires_token(true),
        push,
        Some(tokens),
        reachability,
    );
    channel.configure(engine.push_consumer(), DeliveryQueue::new());

    seed(&engine, &options).await?;
    info!(
        conversations = options.conversations,
        messages = options.conversations * options.messages_per_conversation,
        "workload queued"
    );

    let caught_up = match tokio::time::timeout(options.timeout, engine.wait_until_caught_up()).await
    {
        Ok(result) => {
            result?;
            true
        }
        Err(_) => false,
    };

    let report = build_report(&engine, store.as_ref(), &backend, caught_up, started)?;
    channel.close();
    engine.shutdown().await;
    Ok(report)
}

fn validate(options: &SimulateOptions) -> CliResult<()> {
    if options.max_concurrent == 0 {
        return Err(CliError::InvalidArgument(
            "max-concurrent must be at least 1".into(),
        ));
    }
    if !(0.0..1.0).contains(&options.failure_rate) {
        return Err(CliError::InvalidArgument(
            "failure-rate must be in [0, 1)".into(),
        ));
    }
    Ok(())
}

/// Creates the self client, the conversations and their messages in one
/// local transaction.
async fn seed(engine: &SyncEngineHandle, options: &SimulateOptions) -> CliResult<()> {
    let conversations = options.conversations;
    let per_conversation = options.messages_per_conversation;
    engine
        .enqueue_changes(move |batch| {
            batch.insert(
                Record::local(EntityKind::SelfClient, Fields::new())
                    .with_field("label", json!("courier simulate")),
            );
            for c in 0..conversations {
                let conversation = Record::local(EntityKind::Conversation, Fields::new())
                    .with_field("name", json!(format!("Conversation {c}")));
                let conversation_id = conversation.id().to_string();
                batch.insert(conversation);
                for m in 0..per_conversation {
                    batch.insert(
                        Record::local(EntityKind::Message, Fields::new())
                            .with_field("conversation", json!(conversation_id))
                            .with_field("text", json!(format!("message {m}"))),
                    );
                }
            }
        })
        .await?;
    Ok(())
}

fn build_report(
    engine: &SyncEngineHandle,
    store: &dyn ObjectStore,
    backend: &SimulatedBackend,
    caught_up: bool,
    started: Instant,
) -> CliResult<SimulationReport> {
    let mut kinds = Vec::new();
    for kind in [
        EntityKind::SelfClient,
        EntityKind::User,
        EntityKind::Connection,
        EntityKind::Conversation,
        EntityKind::Message,
    ] {
        let objects = store.objects(kind).map_err(courier_sync::SyncError::from)?;
        kinds.push(KindSummary {
            kind: kind.as_str(),
            objects: objects.len(),
            dirty: objects.iter().filter(|r| r.is_dirty()).count(),
            needs_pull: objects.iter().filter(|r| r.needs_pull()).count(),
        });
    }

    let messages = store
        .objects(EntityKind::Message)
        .map_err(courier_sync::SyncError::from)?;
    let delivered = |state: &str| {
        messages
            .iter()
            .filter(|m| m.str_field(DELIVERY_STATE) == Some(state))
            .count()
    };

    Ok(SimulationReport {
        caught_up,
        elapsed_ms: started.elapsed().as_millis(),
        messages_sent: delivered("sent"),
        messages_failed: delivered("failed"),
        kinds,
        engine: engine.stats(),
        backend: backend.stats(),
    })
}

fn print_text_output(report: &SimulationReport) {
    println!("Simulation Report");
    println!("=================");
    println!();
    println!("Caught up:         {}", report.caught_up);
    println!("Elapsed:           {} ms", report.elapsed_ms);
    println!("Messages sent:     {}", report.messages_sent);
    println!("Messages failed:   {}", report.messages_failed);
    println!();
    println!("{:<14} {:>8} {:>8} {:>10}", "KIND", "OBJECTS", "DIRTY", "NEEDS PULL");
    for kind in &report.kinds {
        println!(
            "{:<14} {:>8} {:>8} {:>10}",
            kind.kind, kind.objects, kind.dirty, kind.needs_pull
        );
    }
    println!();
    println!("Engine:");
    println!("  Requests admitted:  {}", report.engine.requests_admitted);
    println!("  Responses applied:  {}", report.engine.responses_applied);
    println!("  Event batches:      {}", report.engine.event_batches);
    println!("  Requests cancelled: {}", report.engine.requests_cancelled);
    if let Some(error) = &report.engine.last_error {
        println!("  Last error:         {error}");
    }
    println!();
    println!("Backend:");
    println!("  Requests:           {}", report.backend.requests);
    println!("  Injected 503s:      {}", report.backend.injected_failures);
    println!("  Injected 429s:      {}", report.backend.injected_rate_limits);
    println!("  Tokens issued:      {}", report.backend.tokens_issued);
    println!("  Push frames:        {}", report.backend.push_frames);
}
