//! Escrow state tracking
//!
//! Each watcher owns one [`EscrowStore`]; nothing else mutates it.

mod escrow;
mod store;

pub use escrow::EscrowState;
#[cfg(test)]
pub use escrow::EscrowStatus;
pub use store::EscrowStore;
