use crate::coordination::SettlementData;
use crate::error::RelayerResult;
use crate::events::Chain;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Releases escrowed funds on a target chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementExecutor: Send + Sync {
    /// Prepare chain connections and credentials; safe to call more than once
    async fn initialize(&self) -> RelayerResult<()>;

    /// Submit the release on `chain` and return its transaction id.
    ///
    /// Invalid data fails with `RelayerError::Validation` before anything is submitted.
    async fn release_on(&self, chain: Chain, data: SettlementData) -> RelayerResult<String>;

    fn is_ready(&self) -> bool;

    /// Errors the executor hits outside of a `release_on` call
    fn subscribe_errors(&self) -> Option<broadcast::Receiver<String>>;
}
