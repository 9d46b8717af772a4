//! Settlement transaction submission
//!
//! The coordinator hands release requests to a [`SettlementExecutor`], which owns the chain
//! connections and credentials needed to submit them.

mod dry_run;
mod executor;

pub use dry_run::DryRunExecutor;
pub use executor::SettlementExecutor;

#[cfg(test)]
pub use executor::MockSettlementExecutor;
