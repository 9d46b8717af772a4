//! EVM escrow watcher

use super::provider::{LogFilter, LogSource, LogStream, WsLogSource};
use super::{
    start_watcher, stop_watcher, ChainWatcher, ConnectionStatus, EscrowContract, ReconnectPolicy,
    SessionEnd, SyncDriver, WatcherCore,
};
use crate::config::EvmConfig;
use crate::error::RelayerResult;
use crate::events::evm::{format_address, topics};
use crate::events::{Chain, ChainPosition, EvmEventParser, WatcherNotification};
use crate::state::EscrowState;

use async_trait::async_trait;
use ethers::types::{Address, Log};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

/// Watches escrow contract logs on an EVM chain
pub struct EvmWatcher<S: LogSource = WsLogSource> {
    core: Arc<WatcherCore>,
    driver: Arc<EvmDriver<S>>,
    policy: ReconnectPolicy,
}

impl EvmWatcher<WsLogSource> {
    /// Build a watcher for the configured node and contracts
    pub fn from_config(config: &EvmConfig, policy: ReconnectPolicy) -> Self {
        let watcher = Self::new(WsLogSource::new(config.ws_url.clone()), policy);
        for contract in &config.contracts {
            watcher.add_contract(contract.clone());
        }
        watcher
    }
}

impl<S: LogSource> EvmWatcher<S> {
    pub fn new(source: S, policy: ReconnectPolicy) -> Self {
        let core = Arc::new(WatcherCore::new(Chain::Ethereum));
        let driver = Arc::new(EvmDriver {
            source,
            core: core.clone(),
            parser: EvmEventParser::new(),
        });
        Self {
            core,
            driver,
            policy,
        }
    }
}

#[async_trait]
impl<S: LogSource> ChainWatcher for EvmWatcher<S> {
    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    async fn start(&self) -> RelayerResult<()> {
        start_watcher(self.driver.clone(), self.core.clone(), self.policy.clone()).await
    }

    async fn stop(&self) {
        stop_watcher(&self.core).await
    }

    /// Contract references are normalized to lowercase `0x` hex
    fn add_contract(&self, mut contract: EscrowContract) {
        contract.reference = contract.reference.to_lowercase();
        self.core.insert_contract(contract);
    }

    fn remove_contract(&self, reference: &str) -> Option<EscrowContract> {
        self.core.delete_contract(&reference.to_lowercase())
    }

    async fn escrow_state(&self, contract_ref: &str, escrow_id: &str) -> Option<EscrowState> {
        self.core
            .escrow_state(&contract_ref.to_lowercase(), escrow_id)
            .await
    }

    async fn all_escrow_states(&self) -> Vec<EscrowState> {
        self.core.all_escrow_states().await
    }

    async fn connection_status(&self) -> ConnectionStatus {
        self.core.connection_status().await
    }

    fn subscribe(&self) -> broadcast::Receiver<WatcherNotification> {
        self.core.subscribe()
    }
}

struct EvmDriver<S> {
    source: S,
    core: Arc<WatcherCore>,
    parser: EvmEventParser,
}

struct EvmSession {
    /// `None` while there is nothing to watch
    logs: Option<LogStream>,
    contracts: watch::Receiver<u64>,
}

#[async_trait]
impl<S: LogSource> SyncDriver for EvmDriver<S> {
    type Session = EvmSession;

    async fn connect(&self) -> RelayerResult<EvmSession> {
        let contracts = self.core.watch_contracts();

        let addresses: Vec<Address> = self
            .core
            .active_contracts()
            .iter()
            .filter_map(|c| match c.reference.parse::<Address>() {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!("Skipping invalid contract address {}: {}", c.reference, e);
                    None
                }
            })
            .collect();

        if addresses.is_empty() {
            debug!("No active EVM escrow contracts, idling");
            return Ok(EvmSession {
                logs: None,
                contracts,
            });
        }

        // Resume inclusive of the last block; repeated logs are absorbed as duplicates
        let from_block = self.core.last_position().await.map(|p| p.ordinal());
        let filter = LogFilter {
            addresses,
            topics: topics::all(),
            from_block,
        };

        let logs = self.source.subscribe(filter).await?;
        Ok(EvmSession {
            logs: Some(logs),
            contracts,
        })
    }

    async fn run_session(&self, session: EvmSession) -> SessionEnd {
        let EvmSession {
            logs,
            mut contracts,
        } = session;

        let Some(mut logs) = logs else {
            wait_for_change(&mut contracts).await;
            return SessionEnd::Resubscribe;
        };

        loop {
            tokio::select! {
                _ = wait_for_change(&mut contracts) => return SessionEnd::Resubscribe,
                next = logs.next() => match next {
                    Some(Ok(log)) => self.handle_log(log).await,
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => return SessionEnd::Closed,
                }
            }
        }
    }
}

impl<S: LogSource> EvmDriver<S> {
    async fn handle_log(&self, log: Log) {
        if log.removed == Some(true) {
            debug!("Ignoring removed log in tx {:?}", log.transaction_hash);
            return;
        }

        let reference = format_address(&log.address);
        if self.core.matched_contract(&reference).is_none() {
            trace!("Ignoring log from unwatched contract {}", reference);
            return;
        }

        match self.parser.parse_log(&log) {
            Ok(Some(event)) => {
                let block = event.origin_position;
                self.core.ingest(event).await;
                self.core
                    .set_position(ChainPosition::Block { number: block })
                    .await;
            }
            Ok(None) => trace!("Ignoring non-escrow log from {}", reference),
            Err(e) => {
                warn!("Failed to decode log from {}: {}", reference, e);
                crate::metrics::record_decode_error(Chain::Ethereum);
            }
        }
    }
}

/// Resolves on the next contract set change; never if the watcher is gone
async fn wait_for_change(contracts: &mut watch::Receiver<u64>) {
    if contracts.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
