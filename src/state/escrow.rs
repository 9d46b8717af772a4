//! Escrow lifecycle state machine

use crate::events::{EscrowEvent, EscrowEventKind};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Created,
    Funded,
    Disputed,
    Resolved,
    Completed,
    Refunded,
    Cancelled,
}

impl EscrowStatus {
    /// Status an event of `kind` moves an escrow into
    pub fn for_event(kind: EscrowEventKind) -> Self {
        match kind {
            EscrowEventKind::Created => EscrowStatus::Created,
            EscrowEventKind::Funded => EscrowStatus::Funded,
            EscrowEventKind::Disputed => EscrowStatus::Disputed,
            EscrowEventKind::Resolved => EscrowStatus::Resolved,
            EscrowEventKind::Released => EscrowStatus::Completed,
            EscrowEventKind::Refunded => EscrowStatus::Refunded,
            EscrowEventKind::Cancelled => EscrowStatus::Cancelled,
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Completed | EscrowStatus::Refunded | EscrowStatus::Cancelled
        )
    }

    /// Edges of the escrow lifecycle graph
    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (Created, Funded)
                | (Created, Cancelled)
                | (Funded, Disputed)
                | (Funded, Completed)
                | (Funded, Refunded)
                | (Funded, Cancelled)
                | (Disputed, Resolved)
                | (Resolved, Completed)
                | (Resolved, Refunded)
                | (Resolved, Cancelled)
        )
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscrowStatus::Created => "CREATED",
            EscrowStatus::Funded => "FUNDED",
            EscrowStatus::Disputed => "DISPUTED",
            EscrowStatus::Resolved => "RESOLVED",
            EscrowStatus::Completed => "COMPLETED",
            EscrowStatus::Refunded => "REFUNDED",
            EscrowStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Result of applying one event to an escrow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// First entry-class event created the escrow
    Opened(EscrowStatus),
    Advanced {
        from: EscrowStatus,
        to: EscrowStatus,
    },
    /// Additional deposit while already funded
    ToppedUp,
    /// Same event seen before
    Duplicate,
    /// Transition not in the lifecycle graph
    Ignored {
        current: EscrowStatus,
        attempted: EscrowStatus,
    },
    /// Non-entry event for an escrow we never saw created
    Untracked,
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Transition::Opened(_) | Transition::Advanced { .. } | Transition::ToppedUp
        )
    }
}

/// Projected state of one escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowState {
    pub contract_ref: String,
    pub escrow_id: String,
    pub buyer: String,
    pub seller: String,
    pub amount: U256,
    pub asset: Option<String>,
    pub status: EscrowStatus,
    pub total_deposited: U256,
    pub total_released: U256,
    pub total_refunded: U256,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    applied: HashSet<String>,
}

impl EscrowState {
    /// Open a new escrow from an entry-class event
    pub fn open(event: &EscrowEvent) -> Self {
        let now = Utc::now();
        let mut state = Self {
            contract_ref: event.contract_ref.clone(),
            escrow_id: event.escrow_id.clone(),
            buyer: event.payload.buyer.clone().unwrap_or_default(),
            seller: event.payload.seller.clone().unwrap_or_default(),
            amount: event.payload.amount,
            asset: event.payload.asset.clone(),
            status: EscrowStatus::for_event(event.kind),
            total_deposited: U256::zero(),
            total_released: U256::zero(),
            total_refunded: U256::zero(),
            created_at: now,
            updated_at: now,
            applied: HashSet::new(),
        };
        state.accumulate(event);
        state.applied.insert(event.dedup_key());
        state
    }

    /// Apply a later event for the same escrow
    pub fn apply(&mut self, event: &EscrowEvent) -> Transition {
        let key = event.dedup_key();
        if self.applied.contains(&key) {
            return Transition::Duplicate;
        }

        let target = EscrowStatus::for_event(event.kind);
        let transition = if target == self.status && event.kind == EscrowEventKind::Funded {
            Transition::ToppedUp
        } else if self.status.can_transition_to(target) {
            let from = self.status;
            self.status = target;
            Transition::Advanced { from, to: target }
        } else {
            return Transition::Ignored {
                current: self.status,
                attempted: target,
            };
        };

        self.accumulate(event);
        self.fill_parties(event);
        self.applied.insert(key);
        self.updated_at = Utc::now().max(self.created_at);
        transition
    }

    fn accumulate(&mut self, event: &EscrowEvent) {
        let amount = event.payload.amount;
        match event.kind {
            EscrowEventKind::Funded => {
                self.total_deposited = self.total_deposited.saturating_add(amount)
            }
            EscrowEventKind::Released => {
                self.total_released = self.total_released.saturating_add(amount)
            }
            EscrowEventKind::Refunded => {
                self.total_refunded = self.total_refunded.saturating_add(amount)
            }
            _ => {}
        }
    }

    fn fill_parties(&mut self, event: &EscrowEvent) {
        if self.buyer.is_empty() {
            if let Some(buyer) = &event.payload.buyer {
                self.buyer = buyer.clone();
            }
        }
        if self.seller.is_empty() {
            if let Some(seller) = &event.payload.seller {
                self.seller = seller.clone();
            }
        }
        if self.amount.is_zero() {
            self.amount = event.payload.amount;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Chain, EventPayload};

    fn event(kind: EscrowEventKind, tx: &str, amount: u64) -> EscrowEvent {
        EscrowEvent {
            chain: Chain::Ethereum,
            kind,
            contract_ref: "0xcontract".into(),
            escrow_id: "1".into(),
            origin_tx_id: tx.into(),
            origin_position: 1,
            observed_at: Utc::now(),
            payload: EventPayload {
                buyer: Some("0xbuyer".into()),
                seller: Some("addr_test1seller".into()),
                amount: U256::from(amount),
                asset: None,
            },
        }
    }

    #[test]
    fn test_full_lifecycle_with_dispute() {
        let mut state = EscrowState::open(&event(EscrowEventKind::Created, "0x1", 100));
        assert_eq!(state.status, EscrowStatus::Created);
        assert!(state.total_deposited.is_zero());

        assert!(state.apply(&event(EscrowEventKind::Funded, "0x2", 100)).changed());
        assert!(state.apply(&event(EscrowEventKind::Disputed, "0x3", 0)).changed());
        assert!(state.apply(&event(EscrowEventKind::Resolved, "0x4", 0)).changed());
        assert_eq!(
            state.apply(&event(EscrowEventKind::Released, "0x5", 100)),
            Transition::Advanced {
                from: EscrowStatus::Resolved,
                to: EscrowStatus::Completed
            }
        );
        assert_eq!(state.total_deposited, U256::from(100u64));
        assert_eq!(state.total_released, U256::from(100u64));
        assert!(state.status.is_terminal());
        assert!(state.updated_at >= state.created_at);
    }

    #[test]
    fn test_status_never_regresses() {
        let mut state = EscrowState::open(&event(EscrowEventKind::Funded, "0x1", 50));
        state.apply(&event(EscrowEventKind::Released, "0x2", 50));

        let late_funding = state.apply(&event(EscrowEventKind::Funded, "0x3", 50));
        assert_eq!(
            late_funding,
            Transition::Ignored {
                current: EscrowStatus::Completed,
                attempted: EscrowStatus::Funded
            }
        );
        assert_eq!(state.status, EscrowStatus::Completed);
        assert_eq!(state.total_deposited, U256::from(50u64));
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let created = event(EscrowEventKind::Created, "0x1", 10);
        let funded = event(EscrowEventKind::Funded, "0x2", 10);

        let mut once = EscrowState::open(&created);
        once.apply(&funded);

        let mut twice = EscrowState::open(&created);
        assert_eq!(twice.apply(&created), Transition::Duplicate);
        twice.apply(&funded);
        assert_eq!(twice.apply(&funded), Transition::Duplicate);

        assert_eq!(once.status, twice.status);
        assert_eq!(once.total_deposited, twice.total_deposited);
        assert_eq!(once.total_released, twice.total_released);
    }

    #[test]
    fn test_top_up_from_new_transaction_adds_deposit() {
        let mut state = EscrowState::open(&event(EscrowEventKind::Funded, "0x1", 10));
        assert_eq!(
            state.apply(&event(EscrowEventKind::Funded, "0x2", 15)),
            Transition::ToppedUp
        );
        assert_eq!(state.status, EscrowStatus::Funded);
        assert_eq!(state.total_deposited, U256::from(25u64));
    }

    #[test]
    fn test_dispute_requires_funding_first() {
        let mut state = EscrowState::open(&event(EscrowEventKind::Created, "0x1", 10));
        assert!(!state.apply(&event(EscrowEventKind::Disputed, "0x2", 0)).changed());
        assert!(!state.apply(&event(EscrowEventKind::Released, "0x3", 10)).changed());
        assert!(state.apply(&event(EscrowEventKind::Cancelled, "0x4", 0)).changed());
        assert_eq!(state.status, EscrowStatus::Cancelled);
    }

    #[test]
    fn test_every_allowed_edge_moves_forward() {
        use EscrowStatus::*;
        let rank = |s: EscrowStatus| match s {
            Created => 0,
            Funded => 1,
            Disputed => 2,
            Resolved => 3,
            Completed | Refunded | Cancelled => 4,
        };
        let all = [
            Created, Funded, Disputed, Resolved, Completed, Refunded, Cancelled,
        ];
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    assert!(rank(to) > rank(from), "{} -> {} regresses", from, to);
                }
            }
            if from.is_terminal() {
                assert!(all.iter().all(|to| !from.can_transition_to(*to)));
            }
        }
    }
}
