//! Executor that validates releases without submitting them

use super::SettlementExecutor;
use crate::coordination::SettlementData;
use crate::error::{RelayerError, RelayerResult};
use crate::events::Chain;

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Returns a deterministic synthetic transaction id per release
pub struct DryRunExecutor {
    ready: AtomicBool,
    errors: broadcast::Sender<String>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(100);
        Self {
            ready: AtomicBool::new(false),
            errors,
        }
    }

    fn synthetic_tx_id(chain: Chain, data: &SettlementData) -> String {
        let mut hasher = Keccak256::new();
        hasher.update(format!("dry-run:{}:{}:{}", chain, data.source_chain, data.source_tx_id));
        let digest = hex::encode(hasher.finalize());
        match chain {
            Chain::Ethereum => format!("0x{}", digest),
            Chain::Cardano => digest,
        }
    }
}

impl Default for DryRunExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementExecutor for DryRunExecutor {
    async fn initialize(&self) -> RelayerResult<()> {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("Dry-run settlement executor ready; no transactions will be submitted");
        }
        Ok(())
    }

    async fn release_on(&self, chain: Chain, data: SettlementData) -> RelayerResult<String> {
        if !self.is_ready() {
            let err = RelayerError::Execution("executor not initialized".to_string());
            let _ = self.errors.send(err.to_string());
            return Err(err);
        }

        if let Err(e) = data.validate() {
            warn!("Rejected release of escrow {}: {}", data.escrow_id, e);
            return Err(e);
        }

        let tx_id = Self::synthetic_tx_id(chain, &data);
        info!(
            "[dry-run] release escrow {} on {}: {} to {} ({})",
            data.escrow_id, chain, data.amount, data.seller, tx_id
        );
        Ok(tx_id)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn subscribe_errors(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.errors.subscribe())
    }
}
