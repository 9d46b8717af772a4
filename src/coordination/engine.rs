//! Cross-chain settlement coordinator
//!
//! Listens to both watchers and turns every release observed on one chain into a settlement
//! on the other. The ledger is written only by the coordinator's loop; executor calls run on
//! their own tasks and report back over a channel so intake never waits on a chain.

use super::ledger::{Ledger, SettlementCounts, SettlementData, SettlementRecord, settlement_id};
use crate::chain::ChainWatcher;
use crate::config::CoordinatorConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{EscrowEvent, WatcherNotification};
use crate::tx::SettlementExecutor;

use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Notifications published by the coordinator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum SettlementNotification {
    #[serde(rename = "settlement:initiated")]
    Initiated(SettlementRecord),
    #[serde(rename = "settlement:completed")]
    Completed(SettlementRecord),
    #[serde(rename = "settlement:failed")]
    Failed(SettlementRecord),
    #[serde(rename = "coordinator:error")]
    CoordinatorError { message: String },
}

impl SettlementNotification {
    pub fn topic(&self) -> &'static str {
        match self {
            SettlementNotification::Initiated(_) => "settlement:initiated",
            SettlementNotification::Completed(_) => "settlement:completed",
            SettlementNotification::Failed(_) => "settlement:failed",
            SettlementNotification::CoordinatorError { .. } => "coordinator:error",
        }
    }
}

/// Settles releases across chains
pub struct SettlementCoordinator {
    config: CoordinatorConfig,
    watchers: Vec<Arc<dyn ChainWatcher>>,
    executor: Arc<dyn SettlementExecutor>,
    ledger: Arc<RwLock<Ledger>>,
    notify_tx: broadcast::Sender<SettlementNotification>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SettlementCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        watchers: Vec<Arc<dyn ChainWatcher>>,
        executor: Arc<dyn SettlementExecutor>,
    ) -> Self {
        let (notify_tx, _) = broadcast::channel(10_000);
        Self {
            config,
            watchers,
            executor,
            ledger: Arc::new(RwLock::new(Ledger::new())),
            notify_tx,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to the watchers and the executor's error channel and start settling
    pub async fn start(&self) -> RelayerResult<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Settlement coordinator already running");
            return Ok(());
        }

        let mut intake: SelectAll<BoxStream<'static, Intake>> = SelectAll::new();
        for watcher in &self.watchers {
            intake.push(broadcast_stream(watcher.subscribe(), Intake::Watcher));
        }
        if let Some(errors) = self.executor.subscribe_errors() {
            intake.push(broadcast_stream(errors, Intake::ExecutorError));
        }

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let settler = Settler {
            config: self.config.clone(),
            executor: self.executor.clone(),
            ledger: self.ledger.clone(),
            notify_tx: self.notify_tx.clone(),
            results_tx,
        };

        // Calls cut off by a previous stop may have landed; resume only what never left
        let (abandoned, carried_over) = {
            let mut ledger = self.ledger.write().await;
            (ledger.abandon_in_flight(), ledger.unfinished())
        };
        for record in abandoned {
            error!(
                "Settlement {} needs review: {}",
                record.id,
                record.error.as_deref().unwrap_or_default()
            );
            crate::metrics::record_settlement_outcome(record.target_chain, false);
            let _ = self.notify_tx.send(SettlementNotification::Failed(record));
        }
        if !carried_over.is_empty() {
            info!("Resuming {} unfinished settlements", carried_over.len());
        }

        *task = Some(tokio::spawn(settler.run(intake, results_rx, carried_over)));
        info!(
            "Settlement coordinator started (auto_settle: {}, max_retries: {})",
            self.config.auto_settle, self.config.max_retries
        );
        Ok(())
    }

    /// Stop settling. Pending retries resume on the next start; calls in flight are
    /// failed for review then, since their outcome is never observed.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("Settlement coordinator stopped");
        }
    }

    pub async fn status(&self) -> SettlementCounts {
        self.ledger.read().await.counts()
    }

    pub async fn settlement_record(&self, id: &str) -> RelayerResult<SettlementRecord> {
        self.ledger
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RelayerError::SettlementNotFound { id: id.to_string() })
    }

    pub async fn all_settlements(&self) -> Vec<SettlementRecord> {
        self.ledger.read().await.all()
    }

    /// Running and backed by a ready executor
    pub async fn is_operational(&self) -> bool {
        let running = self
            .task
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        running && self.executor.is_ready()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementNotification> {
        self.notify_tx.subscribe()
    }
}

enum Intake {
    Watcher(WatcherNotification),
    ExecutorError(String),
    Lagged(u64),
}

/// Turn a broadcast receiver into a stream that reports lag instead of ending
fn broadcast_stream<T>(
    rx: broadcast::Receiver<T>,
    wrap: fn(T) -> Intake,
) -> BoxStream<'static, Intake>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, move |mut rx| async move {
        match rx.recv().await {
            Ok(item) => Some((wrap(item), rx)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some((Intake::Lagged(n), rx)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
    .boxed()
}

struct AttemptResult {
    id: String,
    result: RelayerResult<String>,
}

/// State owned by the coordinator loop
struct Settler {
    config: CoordinatorConfig,
    executor: Arc<dyn SettlementExecutor>,
    ledger: Arc<RwLock<Ledger>>,
    notify_tx: broadcast::Sender<SettlementNotification>,
    results_tx: mpsc::UnboundedSender<AttemptResult>,
}

impl Settler {
    async fn run(
        self,
        mut intake: SelectAll<BoxStream<'static, Intake>>,
        mut results: mpsc::UnboundedReceiver<AttemptResult>,
        carried_over: Vec<String>,
    ) {
        let mut retries: JoinSet<String> = JoinSet::new();

        for id in carried_over {
            self.dispatch(&id).await;
        }

        loop {
            tokio::select! {
                Some(item) = intake.next() => self.handle_intake(item).await,
                Some(attempt) = results.recv() => self.handle_result(attempt, &mut retries).await,
                Some(due) = retries.join_next(), if !retries.is_empty() => match due {
                    Ok(id) => self.dispatch(&id).await,
                    Err(e) => error!("Retry timer failed: {}", e),
                },
            }
        }
    }

    async fn handle_intake(&self, item: Intake) {
        match item {
            Intake::Watcher(WatcherNotification::Event(event)) => {
                if event.kind.is_release() {
                    self.on_release(event).await;
                } else {
                    debug!(
                        "{} {} for escrow {} needs no settlement",
                        event.chain, event.kind, event.escrow_id
                    );
                }
            }
            Intake::Watcher(WatcherNotification::ReconnectExhausted { chain, attempts }) => {
                self.report_error(format!(
                    "{} watcher halted after {} reconnect attempts",
                    chain, attempts
                ));
            }
            Intake::Watcher(_) => {}
            Intake::ExecutorError(message) => {
                self.report_error(format!("executor: {}", message));
            }
            Intake::Lagged(missed) => {
                self.report_error(format!(
                    "intake lagged, {} notifications missed; releases among them are not settled",
                    missed
                ));
            }
        }
    }

    async fn on_release(&self, event: EscrowEvent) {
        if !self.config.auto_settle {
            info!(
                "Auto-settlement disabled, not settling release of escrow {} ({})",
                event.escrow_id, event.origin_tx_id
            );
            return;
        }

        let id = settlement_id(event.chain, &event.origin_tx_id);
        let record = {
            let mut ledger = self.ledger.write().await;
            if let Some(existing) = ledger.get(&id) {
                debug!(
                    "Release {} already has settlement {} ({})",
                    event.origin_tx_id, id, existing.status
                );
                return;
            }
            let record = SettlementRecord::new(SettlementData::from_event(&event));
            ledger.insert(record.clone());
            record
        };

        info!(
            "Settlement {} initiated: escrow {} released on {}, settling on {}",
            record.id, record.data.escrow_id, record.source_chain, record.target_chain
        );
        self.publish(SettlementNotification::Initiated(record.clone()));

        if let Err(e) = record.data.validate() {
            warn!("Settlement {} rejected: {}", record.id, e);
            if let Some(failed) = self.update(&id, |r| r.fail(&e)).await {
                crate::metrics::record_settlement_outcome(failed.target_chain, false);
                self.publish(SettlementNotification::Failed(failed));
            }
            return;
        }

        self.dispatch(&id).await;
    }

    /// Start the next attempt for a record on its own task
    async fn dispatch(&self, id: &str) {
        let Some(record) = self.ledger.write().await.begin_attempt(id) else {
            return;
        };

        debug!(
            "Settlement {} attempt {}/{} on {}",
            record.id, record.attempt_count, self.config.max_retries, record.target_chain
        );
        crate::metrics::record_settlement_attempt(record.target_chain);

        let executor = self.executor.clone();
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let result = executor.release_on(record.target_chain, record.data).await;
            let _ = results.send(AttemptResult {
                id: record.id,
                result,
            });
        });
    }

    async fn handle_result(&self, attempt: AttemptResult, retries: &mut JoinSet<String>) {
        let AttemptResult { id, result } = attempt;

        match result {
            Ok(tx_id) => {
                if let Some(record) = self.resolve(&id, |r| r.complete(tx_id)).await {
                    info!(
                        "Settlement {} completed on {}: {}",
                        id,
                        record.target_chain,
                        record.target_tx_id.as_deref().unwrap_or_default()
                    );
                    crate::metrics::record_settlement_outcome(record.target_chain, true);
                    if let Some(done) = record.completed_at {
                        let elapsed = (done - record.created_at).num_milliseconds();
                        crate::metrics::record_settlement_latency(
                            record.target_chain,
                            elapsed as f64 / 1000.0,
                        );
                    }
                    self.publish(SettlementNotification::Completed(record));
                }
            }
            Err(e) => {
                let max_retries = self.config.max_retries;
                let rejected = matches!(e, RelayerError::Validation(_));
                let final_attempt = !e.is_retryable();
                let Some(record) = self
                    .resolve(&id, |r| {
                        if rejected {
                            r.reject(&e);
                        } else if final_attempt || r.attempt_count >= max_retries {
                            r.fail(&e);
                        } else {
                            r.defer(&e);
                        }
                    })
                    .await
                else {
                    return;
                };

                if record.status.is_terminal() {
                    error!(
                        "Settlement {} failed after {} attempts: {}",
                        id, record.attempt_count, e
                    );
                    crate::metrics::record_settlement_outcome(record.target_chain, false);
                    self.publish(SettlementNotification::Failed(record));
                } else {
                    warn!(
                        "Settlement {} attempt {} failed, retrying in {:?}: {}",
                        id,
                        record.attempt_count,
                        self.config.retry_delay(),
                        e
                    );
                    let delay = self.config.retry_delay();
                    retries.spawn(async move {
                        tokio::time::sleep(delay).await;
                        id
                    });
                }
            }
        }
    }

    /// Mutate a record in place and return its new snapshot
    async fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut SettlementRecord),
    ) -> Option<SettlementRecord> {
        let mut ledger = self.ledger.write().await;
        let record = ledger.get_mut(id)?;
        f(record);
        Some(record.clone())
    }

    /// Apply an executor result to its record
    async fn resolve(
        &self,
        id: &str,
        f: impl FnOnce(&mut SettlementRecord),
    ) -> Option<SettlementRecord> {
        self.ledger.write().await.finish_attempt(id, f)
    }

    fn report_error(&self, message: String) {
        error!("Coordinator error: {}", message);
        self.publish(SettlementNotification::CoordinatorError { message });
    }

    fn publish(&self, notification: SettlementNotification) {
        trace!("Publishing {}", notification.topic());
        let _ = self.notify_tx.send(notification);
    }
}
