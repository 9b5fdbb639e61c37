//! Sync engine actor.
//!
//! One task owns the [`SyncStrategy`] and processes everything that touches
//! it serially: store change notifications, responses, push events,
//! recovered background responses and scheduler wake-ups. Network I/O runs
//! in tasks spawned per admitted request, bounded by the scheduler.

use crate::error::{StoreError, SyncError, SyncResult};
use crate::registry::{Admission, SyncStrategy, TranscoderRegistry};
use crate::store::{perform_changes, ChangeBatch, ChangeSet, ObjectStore};
use crate::transcoders::default_registry;
use courier_transport::{
    PushChannelConsumer, PushEvent, RecoveredResponse, RequestScheduler, Response, RetryConfig,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry policy handed to the default transcoders.
    pub retry: RetryConfig,
    /// Whether background requests of a previous run are reattached at
    /// startup.
    pub reattach_background_tasks: bool,
}

impl EngineConfig {
    /// Creates the default configuration: five attempts starting at one
    /// second, reattachment enabled.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::new(5)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
            reattach_background_tasks: true,
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables background reattachment.
    pub fn with_reattach_background_tasks(mut self, enabled: bool) -> Self {
        self.reattach_background_tasks = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of the engine as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Bootstrapping and reattaching.
    Starting,
    /// Some transcoder has work or a request in flight.
    Synchronizing,
    /// Every transcoder is idle.
    CaughtUp,
    /// Stopped after a fatal error.
    Failed(String),
    /// Shut down.
    Stopped,
}

impl EngineStatus {
    /// Returns true once the engine no longer runs.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineStatus::Failed(_) | EngineStatus::Stopped)
    }
}

/// Counters kept by the engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Requests admitted by the scheduler.
    pub requests_admitted: u64,
    /// Responses applied.
    pub responses_applied: u64,
    /// Push event batches applied.
    pub event_batches: u64,
    /// Recovered background responses applied.
    pub recovered_applied: u64,
    /// Requests cancelled because their object changed.
    pub requests_cancelled: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

type Changes = Box<dyn FnOnce(&mut ChangeBatch) + Send>;

enum EngineMessage {
    Events(Vec<PushEvent>),
    Perform {
        changes: Changes,
        reply: oneshot::Sender<SyncResult<ChangeSet>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Arrival {
    transcoder: usize,
    sequence: u64,
    response: Response,
}

/// Entry point for starting the engine.
pub struct SyncEngine;

impl SyncEngine {
    /// Starts the engine over `registry`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        config: EngineConfig,
        registry: TranscoderRegistry,
        store: Arc<dyn ObjectStore>,
        scheduler: RequestScheduler,
    ) -> SyncEngineHandle {
        let (messages, message_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(EngineStatus::Starting);
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let changes = store.subscribe();
        let save_failures = store.subscribe_save_failures();

        let actor = EngineActor {
            config,
            strategy: SyncStrategy::new(registry),
            store: Arc::clone(&store),
            scheduler,
            changes,
            save_failures,
            status: status_tx,
            stats: Arc::clone(&stats),
        };
        tokio::spawn(actor.run(message_rx));

        SyncEngineHandle {
            messages,
            status,
            stats,
            store,
        }
    }

    /// Starts the engine with the transcoders of [`crate::transcoders`].
    pub fn spawn_default(
        config: EngineConfig,
        store: Arc<dyn ObjectStore>,
        scheduler: RequestScheduler,
    ) -> SyncEngineHandle {
        let registry = default_registry(&config.retry);
        Self::spawn(config, registry, store, scheduler)
    }
}

/// Handle to a running engine. Cloning yields another handle; the engine
/// stops when the last one is dropped.
#[derive(Clone)]
pub struct SyncEngineHandle {
    messages: mpsc::UnboundedSender<EngineMessage>,
    status: watch::Receiver<EngineStatus>,
    stats: Arc<RwLock<EngineStats>>,
    store: Arc<dyn ObjectStore>,
}

impl SyncEngineHandle {
    /// Returns the current status.
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Returns the store the engine synchronizes.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Returns a consumer that feeds push events into the engine. The
    /// consumer does not keep the engine alive.
    pub fn push_consumer(&self) -> Arc<dyn PushChannelConsumer> {
        Arc::new(EngineConsumer {
            messages: self.messages.downgrade(),
        })
    }

    /// Applies local changes on the calling thread. The engine picks them up
    /// through the store's change notifications.
    pub fn perform_changes<F>(&self, changes: F) -> SyncResult<ChangeSet>
    where
        F: FnOnce(&mut ChangeBatch),
    {
        Ok(perform_changes(self.store.as_ref(), changes)?)
    }

    /// Applies local changes on the engine task. Transcoders have seen the
    /// changes by the time this returns.
    pub async fn enqueue_changes<F>(&self, changes: F) -> SyncResult<ChangeSet>
    where
        F: FnOnce(&mut ChangeBatch) + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.send(EngineMessage::Perform {
            changes: Box::new(changes),
            reply,
        })?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Waits until every transcoder is idle.
    ///
    /// Fails if the engine stops or fails first.
    pub async fn wait_until_caught_up(&self) -> SyncResult<()> {
        let (reply, flushed) = oneshot::channel();
        // If the engine already ended, the status says why.
        if self.send(EngineMessage::Flush { reply }).is_ok() {
            let _ = flushed.await;
        }

        let mut status = self.status.clone();
        loop {
            match &*status.borrow_and_update() {
                EngineStatus::CaughtUp => return Ok(()),
                EngineStatus::Failed(message) => return Err(SyncError::EngineFailed(message.clone())),
                EngineStatus::Stopped => return Err(SyncError::EngineStopped),
                EngineStatus::Starting | EngineStatus::Synchronizing => {}
            }
            if status.changed().await.is_err() {
                return match &*status.borrow() {
                    EngineStatus::CaughtUp => Ok(()),
                    EngineStatus::Failed(message) => Err(SyncError::EngineFailed(message.clone())),
                    _ => Err(SyncError::EngineStopped),
                };
            }
        }
    }

    /// Stops the engine after a final save.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.send(EngineMessage::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }

    fn send(&self, message: EngineMessage) -> SyncResult<()> {
        self.messages
            .send(message)
            .map_err(|_| SyncError::EngineStopped)
    }
}

impl std::fmt::Debug for SyncEngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngineHandle")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

struct EngineConsumer {
    messages: mpsc::WeakUnboundedSender<EngineMessage>,
}

impl PushChannelConsumer for EngineConsumer {
    fn did_receive(&self, events: Vec<PushEvent>) {
        let delivered = self
            .messages
            .upgrade()
            .is_some_and(|messages| messages.send(EngineMessage::Events(events)).is_ok());
        if !delivered {
            debug!("push events dropped, engine stopped");
        }
    }

    fn did_open(&self) {
        debug!("push channel open");
    }

    fn did_close(&self) {
        debug!("push channel closed");
    }
}

struct EngineActor {
    config: EngineConfig,
    strategy: SyncStrategy,
    store: Arc<dyn ObjectStore>,
    scheduler: RequestScheduler,
    changes: mpsc::UnboundedReceiver<ChangeSet>,
    save_failures: mpsc::UnboundedReceiver<StoreError>,
    status: watch::Sender<EngineStatus>,
    stats: Arc<RwLock<EngineStats>>,
}

impl EngineActor {
    async fn run(mut self, mut messages: mpsc::UnboundedReceiver<EngineMessage>) {
        info!(transcoders = ?self.strategy.registry().order(), "sync engine starting");
        let mut recovered = match self.start().await {
            Ok(recovered) => recovered,
            Err(e) => {
                self.fail(&e);
                return;
            }
        };

        let (arrivals_tx, mut arrivals) = mpsc::unbounded_channel::<Arrival>();
        let mut wakeups = self.scheduler.subscribe_new_requests();
        let mut wakeups_open = true;

        loop {
            if let Err(e) = self.settle(&arrivals_tx) {
                if self.handle_error(e) {
                    return;
                }
            }
            let deadline = self.strategy.next_retry_deadline(Instant::now());

            let step = tokio::select! {
                message = messages.recv() => match message {
                    Some(EngineMessage::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        return;
                    }
                    Some(message) => self.handle_message(message, &arrivals_tx),
                    None => {
                        debug!("all engine handles dropped");
                        self.stop();
                        return;
                    }
                },
                Some(arrival) = arrivals.recv() => self.apply_arrival(arrival),
                Some(response) = recovered.recv() => self.apply_recovered(response),
                Some(changes) = self.changes.recv() => {
                    self.objects_did_change(&changes);
                    Ok(())
                }
                Some(e) = self.save_failures.recv() => Err(SyncError::Store(e)),
                wakeup = wakeups.recv(), if wakeups_open => {
                    if matches!(wakeup, Err(RecvError::Closed)) {
                        wakeups_open = false;
                    }
                    Ok(())
                }
                _ = sleep_until(deadline), if deadline.is_some() => Ok(()),
            };

            if let Err(e) = step {
                if self.handle_error(e) {
                    return;
                }
            }
        }
    }

    /// Bootstraps the transcoders and reattaches background work.
    async fn start(&mut self) -> SyncResult<mpsc::UnboundedReceiver<RecoveredResponse>> {
        self.strategy.bootstrap(self.store.as_ref())?;

        if !self.config.reattach_background_tasks {
            let (_, empty) = mpsc::unbounded_channel();
            return Ok(empty);
        }
        if let Some(log) = self.scheduler.recovery_log() {
            for entry in log.entries() {
                let adopted = entry
                    .tag
                    .as_deref()
                    .is_some_and(|tag| self.strategy.adopt_recovered(entry.request_id, tag));
                if !adopted {
                    warn!(request_id = %entry.request_id, path = %entry.path, "background request has no owner");
                }
            }
        }
        Ok(self.scheduler.reattach_background_tasks().await?)
    }

    /// Feeds pending change notifications to the transcoders, admits as much
    /// work as the scheduler allows and publishes the resulting status.
    fn settle(&mut self, arrivals: &mpsc::UnboundedSender<Arrival>) -> SyncResult<()> {
        self.drain_changes();
        self.drive(arrivals)?;
        self.publish_status();
        Ok(())
    }

    fn drain_changes(&mut self) {
        while let Ok(changes) = self.changes.try_recv() {
            self.objects_did_change(&changes);
        }
    }

    fn objects_did_change(&mut self, changes: &ChangeSet) {
        let stale = self.strategy.objects_did_change(changes);
        for request_id in stale {
            if self.scheduler.cancel(request_id) {
                self.stats.write().requests_cancelled += 1;
            }
        }
    }

    fn drive(&mut self, arrivals: &mpsc::UnboundedSender<Arrival>) -> SyncResult<()> {
        loop {
            let outcome = self.strategy.poll(&self.scheduler, self.store.as_ref())?;
            let more = outcome.should_continue();
            if let Some(admission) = outcome.admitted {
                self.stats.write().requests_admitted += 1;
                Self::await_response(admission, arrivals.clone());
            }
            if !more {
                return Ok(());
            }
        }
    }

    fn await_response(admission: Admission, arrivals: mpsc::UnboundedSender<Arrival>) {
        let Admission {
            transcoder,
            sequence,
            handle,
        } = admission;
        tokio::spawn(async move {
            let response = handle.response().await;
            let _ = arrivals.send(Arrival {
                transcoder,
                sequence,
                response,
            });
        });
    }

    fn handle_message(
        &mut self,
        message: EngineMessage,
        arrivals: &mpsc::UnboundedSender<Arrival>,
    ) -> SyncResult<()> {
        match message {
            EngineMessage::Events(events) => {
                debug!(events = events.len(), "applying push events");
                self.strategy.process_events(self.store.as_ref(), &events)?;
                self.stats.write().event_batches += 1;
                self.schedule_save()
            }
            EngineMessage::Perform { changes, reply } => {
                let result = perform_changes(self.store.as_ref(), changes).map_err(SyncError::from);
                self.drain_changes();
                let _ = reply.send(result);
                Ok(())
            }
            EngineMessage::Flush { reply } => {
                let result = self.settle(arrivals);
                let _ = reply.send(());
                result
            }
            // Handled by the run loop.
            EngineMessage::Shutdown { reply } => {
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    fn apply_arrival(&mut self, arrival: Arrival) -> SyncResult<()> {
        self.strategy.response_arrived(
            self.store.as_ref(),
            arrival.transcoder,
            arrival.sequence,
            arrival.response,
        )?;
        self.stats.write().responses_applied += 1;
        self.schedule_save()
    }

    fn apply_recovered(&mut self, recovered: RecoveredResponse) -> SyncResult<()> {
        if self.strategy.apply_recovered(self.store.as_ref(), &recovered)? {
            self.stats.write().recovered_applied += 1;
        }
        self.schedule_save()
    }

    fn schedule_save(&self) -> SyncResult<()> {
        if !self.store.save_if_too_many_changes()? {
            self.store.enqueue_delayed_save();
        }
        Ok(())
    }

    fn publish_status(&self) {
        let next = if self.strategy.is_synchronization_complete() {
            EngineStatus::CaughtUp
        } else {
            EngineStatus::Synchronizing
        };
        self.status.send_if_modified(|current| {
            if *current == next || current.is_terminal() {
                return false;
            }
            if next == EngineStatus::CaughtUp {
                info!("synchronization complete");
            } else {
                debug!(states = ?self.strategy.states(), "synchronizing");
            }
            *current = next;
            true
        });
    }

    /// Logs an error. Returns true if the engine must stop.
    fn handle_error(&mut self, e: SyncError) -> bool {
        if e.is_fatal() {
            self.fail(&e);
            return true;
        }
        warn!(error = %e, "sync step failed");
        self.stats.write().last_error = Some(e.to_string());
        false
    }

    fn fail(&self, e: &SyncError) {
        error!(error = %e, "sync engine failed");
        self.stats.write().last_error = Some(e.to_string());
        self.status.send_replace(EngineStatus::Failed(e.to_string()));
    }

    fn stop(&self) {
        if let Err(e) = self.store.save_or_rollback() {
            warn!(error = %e, "final save failed");
            self.stats.write().last_error = Some(SyncError::Store(e).to_string());
        }
        info!("sync engine stopped");
        self.status.send_replace(EngineStatus::Stopped);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
