//! Cross-chain settlement coordination
//!
//! The coordinator:
//! 1. Listens to escrow events from both chain watchers
//! 2. Opens one settlement record per release transaction
//! 3. Drives the settlement executor on the opposite chain, retrying with a fixed delay
//! 4. Publishes the settlement lifecycle to external listeners

pub mod engine;
pub mod ledger;

pub use engine::SettlementCoordinator;
pub use ledger::{SettlementCounts, SettlementData, SettlementRecord};
