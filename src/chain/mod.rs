//! Chain module - escrow watchers for each chain family
//!
//! This module provides:
//! - The [`ChainWatcher`] contract shared by the EVM and Cardano watchers
//! - Stream sources for both chains (`ethers` WebSocket logs, Ogmios chain-sync)
//! - Connection supervision with linear reconnect backoff and position resume

pub mod cardano;
pub mod evm;
pub mod provider;
mod reconnect;

pub use cardano::CardanoWatcher;
pub use evm::EvmWatcher;
pub use reconnect::ReconnectPolicy;

use crate::error::{RelayerError, RelayerResult};
use crate::events::{Chain, ChainPosition, EscrowEvent, WatcherNotification};
use crate::state::{EscrowState, EscrowStore};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// A watched escrow locus: contract address (EVM) or script address (Cardano)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowContract {
    pub reference: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Native asset policy id the escrow locks (Cardano)
    #[serde(default)]
    pub asset_policy: Option<String>,
}

fn default_active() -> bool {
    true
}

impl EscrowContract {
    #[cfg(test)]
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            active: true,
            asset_policy: None,
        }
    }
}

/// Connection state reported by a watcher
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub last_position: Option<ChainPosition>,
    /// Reconnect attempts exhausted; needs an operator restart
    pub halted: bool,
}

/// Operations every chain watcher exposes
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    fn chain(&self) -> Chain;

    /// Open the stream connection and start processing
    async fn start(&self) -> RelayerResult<()>;

    /// Close the connection and cancel pending reconnects
    async fn stop(&self);

    fn add_contract(&self, contract: EscrowContract);

    fn remove_contract(&self, reference: &str) -> Option<EscrowContract>;

    async fn escrow_state(&self, contract_ref: &str, escrow_id: &str) -> Option<EscrowState>;

    async fn all_escrow_states(&self) -> Vec<EscrowState>;

    async fn connection_status(&self) -> ConnectionStatus;

    fn subscribe(&self) -> broadcast::Receiver<WatcherNotification>;
}

/// State and plumbing shared by both watcher implementations
pub(crate) struct WatcherCore {
    chain: Chain,
    contracts: DashMap<String, EscrowContract>,
    store: RwLock<EscrowStore>,
    status: RwLock<ConnectionStatus>,
    notify_tx: broadcast::Sender<WatcherNotification>,
    /// Bumped whenever the watched contract set changes
    contracts_version: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherCore {
    pub(crate) fn new(chain: Chain) -> Self {
        let (notify_tx, _) = broadcast::channel(10_000);
        let (contracts_version, _) = watch::channel(0);
        Self {
            chain,
            contracts: DashMap::new(),
            store: RwLock::new(EscrowStore::new()),
            status: RwLock::new(ConnectionStatus::default()),
            notify_tx,
            contracts_version,
            task: Mutex::new(None),
        }
    }

    pub(crate) fn chain(&self) -> Chain {
        self.chain
    }

    pub(crate) fn insert_contract(&self, contract: EscrowContract) {
        info!(
            "Watching {} contract {} (active: {})",
            self.chain, contract.reference, contract.active
        );
        self.contracts.insert(contract.reference.clone(), contract);
        self.bump_contracts_version();
    }

    pub(crate) fn delete_contract(&self, reference: &str) -> Option<EscrowContract> {
        let removed = self.contracts.remove(reference).map(|(_, c)| c);
        if removed.is_some() {
            info!("Stopped watching {} contract {}", self.chain, reference);
            self.bump_contracts_version();
        }
        removed
    }

    fn bump_contracts_version(&self) {
        self.contracts_version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Receiver that fires on the next change to the watched contract set.
    ///
    /// Take it before reading the contract set so no change slips between the two.
    pub(crate) fn watch_contracts(&self) -> watch::Receiver<u64> {
        self.contracts_version.subscribe()
    }

    /// Active contract registered under `reference`
    pub(crate) fn matched_contract(&self, reference: &str) -> Option<EscrowContract> {
        self.contracts
            .get(reference)
            .filter(|c| c.active)
            .map(|c| c.clone())
    }

    pub(crate) fn active_contracts(&self) -> Vec<EscrowContract> {
        self.contracts
            .iter()
            .filter(|c| c.active)
            .map(|c| c.value().clone())
            .collect()
    }

    /// Apply an event to the escrow store, then publish it and any state change
    pub(crate) async fn ingest(&self, event: EscrowEvent) {
        crate::metrics::record_event(self.chain, event.kind);

        let (transition, snapshot) = self.store.write().await.apply(&event);
        debug!(
            "{} {} for escrow {} (tx {}): {:?}",
            self.chain, event.kind, event.escrow_id, event.origin_tx_id, transition
        );

        self.publish(WatcherNotification::Event(event));
        if let Some(state) = snapshot {
            self.publish(WatcherNotification::StateChange(state));
        }
    }

    pub(crate) fn publish(&self, notification: WatcherNotification) {
        trace!("{} publishing {}", self.chain, notification.topic());
        // No receivers is fine
        let _ = self.notify_tx.send(notification);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WatcherNotification> {
        self.notify_tx.subscribe()
    }

    pub(crate) async fn escrow_state(&self, contract_ref: &str, escrow_id: &str) -> Option<EscrowState> {
        self.store.read().await.get(contract_ref, escrow_id).cloned()
    }

    pub(crate) async fn all_escrow_states(&self) -> Vec<EscrowState> {
        self.store.read().await.snapshot()
    }

    pub(crate) async fn connection_status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    pub(crate) async fn last_position(&self) -> Option<ChainPosition> {
        self.status.read().await.last_position.clone()
    }

    /// Record a confirmed chain position; block positions only move forward
    pub(crate) async fn set_position(&self, position: ChainPosition) {
        let mut status = self.status.write().await;
        let advance = match (&status.last_position, &position) {
            (Some(ChainPosition::Block { number: last }), ChainPosition::Block { number }) => {
                number > last
            }
            _ => true,
        };
        if advance {
            crate::metrics::record_position(self.chain, position.ordinal());
            status.last_position = Some(position);
        }
    }

    /// Move the position back to a rollback point; `None` means origin
    pub(crate) async fn rewind_position(&self, position: Option<ChainPosition>) {
        self.status.write().await.last_position = position;
    }

    async fn mark_connected(&self) {
        let position = {
            let mut status = self.status.write().await;
            status.connected = true;
            status.reconnect_attempts = 0;
            status.halted = false;
            status.last_position.clone()
        };
        crate::metrics::record_connection(self.chain, true);
        info!("{} stream connected (resume from {:?})", self.chain, position);
        self.publish(WatcherNotification::Connected {
            chain: self.chain,
            position,
        });
    }

    async fn mark_disconnected(&self) {
        self.status.write().await.connected = false;
        crate::metrics::record_connection(self.chain, false);
    }

    async fn set_reconnect_attempts(&self, attempts: u32) {
        self.status.write().await.reconnect_attempts = attempts;
    }

    async fn mark_halted(&self, attempts: u32) {
        {
            let mut status = self.status.write().await;
            status.connected = false;
            status.halted = true;
        }
        self.publish(WatcherNotification::ReconnectExhausted {
            chain: self.chain,
            attempts,
        });
    }

    fn publish_connection_error(&self, attempt: u32, error: &RelayerError) {
        self.publish(WatcherNotification::ConnectionError {
            chain: self.chain,
            attempt,
            message: error.to_string(),
        });
    }
}

/// Why a stream session ended
pub(crate) enum SessionEnd {
    /// Stream closed by the remote side
    Closed,
    Failed(RelayerError),
    /// Watched contract set changed; reconnect immediately
    Resubscribe,
}

/// Chain-specific connect and read loop driven by [`supervise`]
#[async_trait]
pub(crate) trait SyncDriver: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Open a stream resuming from the core's last position
    async fn connect(&self) -> RelayerResult<Self::Session>;

    /// Consume the stream until it ends
    async fn run_session(&self, session: Self::Session) -> SessionEnd;
}

async fn connect_with_timeout<D: SyncDriver>(
    driver: &D,
    policy: &ReconnectPolicy,
    chain: Chain,
) -> RelayerResult<D::Session> {
    match tokio::time::timeout(policy.connect_timeout(), driver.connect()).await {
        Ok(result) => result,
        Err(_) => Err(RelayerError::connection(
            chain,
            format!("connect timed out after {:?}", policy.connect_timeout()),
        )),
    }
}

/// Start a watcher: connect once synchronously, then hand the session to a supervised task
pub(crate) async fn start_watcher<D: SyncDriver>(
    driver: Arc<D>,
    core: Arc<WatcherCore>,
    policy: ReconnectPolicy,
) -> RelayerResult<()> {
    let mut task = core.task.lock().await;
    if task.as_ref().is_some_and(|h| !h.is_finished()) {
        warn!("{} watcher already running", core.chain());
        return Ok(());
    }

    let session = match connect_with_timeout(&*driver, &policy, core.chain()).await {
        Ok(session) => session,
        Err(e) => {
            core.publish_connection_error(0, &e);
            return Err(e);
        }
    };
    core.mark_connected().await;

    *task = Some(tokio::spawn(supervise(driver, core.clone(), policy, session)));
    Ok(())
}

/// Stop a watcher's task; idempotent
pub(crate) async fn stop_watcher(core: &WatcherCore) {
    if let Some(handle) = core.task.lock().await.take() {
        handle.abort();
        info!("{} watcher stopped", core.chain());
    }
    core.mark_disconnected().await;
    core.set_reconnect_attempts(0).await;
}

/// Run sessions back to back, reconnecting with linear backoff until attempts run out
async fn supervise<D: SyncDriver>(
    driver: Arc<D>,
    core: Arc<WatcherCore>,
    policy: ReconnectPolicy,
    mut session: D::Session,
) {
    let chain = core.chain();

    loop {
        let end = driver.run_session(session).await;
        core.mark_disconnected().await;

        match end {
            SessionEnd::Resubscribe => {
                debug!("{} watched contracts changed, resubscribing", chain);
                match connect_with_timeout(&*driver, &policy, chain).await {
                    Ok(next) => {
                        core.mark_connected().await;
                        session = next;
                        continue;
                    }
                    Err(e) => {
                        warn!("{} resubscribe failed: {}", chain, e);
                        core.publish_connection_error(0, &e);
                    }
                }
            }
            SessionEnd::Closed => warn!("{} stream closed", chain),
            SessionEnd::Failed(e) => {
                if e.should_alert() {
                    error!("{} stream failed: {}", chain, e);
                } else {
                    warn!("{} stream failed: {}", chain, e);
                }
                core.publish_connection_error(0, &e);
            }
        }

        let mut attempt = 0;
        session = loop {
            attempt += 1;
            if !policy.allows(attempt) {
                let attempts = attempt - 1;
                warn!(
                    "{} watcher giving up after {} reconnect attempts; restart required",
                    chain, attempts
                );
                core.mark_halted(attempts).await;
                return;
            }

            core.set_reconnect_attempts(attempt).await;
            let delay = policy.delay_for(attempt);
            info!(
                "Reconnecting {} in {:?} (attempt {}/{})",
                chain,
                delay,
                attempt,
                policy.max_attempts()
            );
            tokio::time::sleep(delay).await;
            crate::metrics::record_reconnect_attempt(chain);

            match connect_with_timeout(&*driver, &policy, chain).await {
                Ok(next) => break next,
                Err(e) => {
                    warn!("{} reconnect attempt {} failed: {}", chain, attempt, e);
                    core.publish_connection_error(attempt, &e);
                }
            }
        };
        core.mark_connected().await;
    }
}
