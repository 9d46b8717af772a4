//! Normalized escrow events
//!
//! Both watchers decode their chain's raw messages into [`EscrowEvent`] and publish them,
//! together with connection lifecycle changes, as [`WatcherNotification`]s.

pub mod cardano;
pub mod evm;

pub use evm::EvmEventParser;

use crate::state::EscrowState;

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chain families the relayer watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Cardano,
}

impl Chain {
    /// The chain a release observed here gets settled on
    pub fn opposite(&self) -> Chain {
        match self {
            Chain::Ethereum => Chain::Cardano,
            Chain::Cardano => Chain::Ethereum,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Cardano => "cardano",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "evm" => Ok(Chain::Ethereum),
            "cardano" | "ada" => Ok(Chain::Cardano),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

/// Escrow lifecycle event kinds shared by both chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowEventKind {
    Created,
    Funded,
    Released,
    Refunded,
    Disputed,
    Resolved,
    Cancelled,
}

impl EscrowEventKind {
    /// Get event name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            EscrowEventKind::Created => "created",
            EscrowEventKind::Funded => "funded",
            EscrowEventKind::Released => "released",
            EscrowEventKind::Refunded => "refunded",
            EscrowEventKind::Disputed => "disputed",
            EscrowEventKind::Resolved => "resolved",
            EscrowEventKind::Cancelled => "cancelled",
        }
    }

    /// Release-class events trigger cross-chain settlement
    pub fn is_release(&self) -> bool {
        matches!(self, EscrowEventKind::Released)
    }

    /// Events allowed to create a previously unseen escrow
    pub fn is_entry(&self) -> bool {
        matches!(self, EscrowEventKind::Created | EscrowEventKind::Funded)
    }
}

impl fmt::Display for EscrowEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded event fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub buyer: Option<String>,
    pub seller: Option<String>,
    pub amount: U256,
    /// Native asset qualifier (`policy.asset`), Cardano only
    pub asset: Option<String>,
}

/// One escrow event decoded from a raw chain message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub chain: Chain,
    pub kind: EscrowEventKind,
    pub contract_ref: String,
    pub escrow_id: String,
    pub origin_tx_id: String,
    /// Block number (EVM) or slot (Cardano)
    pub origin_position: u64,
    pub observed_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EscrowEvent {
    /// Key identifying this event for duplicate detection
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.origin_tx_id, self.kind.name())
    }
}

/// Chain position a watcher resumes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ChainPosition {
    Block { number: u64 },
    Slot { slot: u64, id: String },
}

impl ChainPosition {
    pub fn ordinal(&self) -> u64 {
        match self {
            ChainPosition::Block { number } => *number,
            ChainPosition::Slot { slot, .. } => *slot,
        }
    }
}

/// Notifications published by a watcher
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum WatcherNotification {
    #[serde(rename = "escrow:event")]
    Event(EscrowEvent),
    #[serde(rename = "escrow:state_change")]
    StateChange(EscrowState),
    #[serde(rename = "connection:open")]
    Connected {
        chain: Chain,
        position: Option<ChainPosition>,
    },
    #[serde(rename = "connection:error")]
    ConnectionError {
        chain: Chain,
        attempt: u32,
        message: String,
    },
    #[serde(rename = "connection:exhausted")]
    ReconnectExhausted { chain: Chain, attempts: u32 },
    /// `point` is `None` for a rollback to origin
    #[serde(rename = "chain:rollback")]
    Rollback {
        chain: Chain,
        point: Option<ChainPosition>,
    },
}

impl WatcherNotification {
    /// Topic name external listeners subscribe to
    pub fn topic(&self) -> &'static str {
        match self {
            WatcherNotification::Event(_) => "escrow:event",
            WatcherNotification::StateChange(_) => "escrow:state_change",
            WatcherNotification::Connected { .. } => "connection:open",
            WatcherNotification::ConnectionError { .. } => "connection:error",
            WatcherNotification::ReconnectExhausted { .. } => "connection:exhausted",
            WatcherNotification::Rollback { .. } => "chain:rollback",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_opposite_and_parse() {
        assert_eq!(Chain::Ethereum.opposite(), Chain::Cardano);
        assert_eq!(Chain::Cardano.opposite(), Chain::Ethereum);
        assert_eq!("EVM".parse::<Chain>().unwrap(), Chain::Ethereum);
        assert_eq!("cardano".parse::<Chain>().unwrap(), Chain::Cardano);
        assert!("solana".parse::<Chain>().is_err());
    }

    #[test]
    fn test_only_release_triggers_settlement() {
        assert!(EscrowEventKind::Released.is_release());
        for kind in [
            EscrowEventKind::Created,
            EscrowEventKind::Funded,
            EscrowEventKind::Refunded,
            EscrowEventKind::Disputed,
            EscrowEventKind::Resolved,
            EscrowEventKind::Cancelled,
        ] {
            assert!(!kind.is_release(), "{} should not settle", kind);
        }
    }

    #[test]
    fn test_notification_serializes_with_topic() {
        let n = WatcherNotification::ReconnectExhausted {
            chain: Chain::Cardano,
            attempts: 10,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["topic"], "connection:exhausted");
        assert_eq!(json["payload"]["chain"], "cardano");
        assert_eq!(n.topic(), "connection:exhausted");
    }
}
