//! In-memory escrow state store owned by a single watcher

use super::escrow::{EscrowState, Transition};
#[cfg(test)]
use super::escrow::EscrowStatus;
use crate::events::EscrowEvent;

use std::collections::HashMap;
use tracing::{debug, trace};

/// Escrow states keyed by (contract reference, escrow id)
#[derive(Debug, Default)]
pub struct EscrowStore {
    states: HashMap<(String, String), EscrowState>,
}

impl EscrowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event and return the transition plus a snapshot when the state changed
    pub fn apply(&mut self, event: &EscrowEvent) -> (Transition, Option<EscrowState>) {
        let key = (event.contract_ref.clone(), event.escrow_id.clone());

        if !self.states.contains_key(&key) {
            if !event.kind.is_entry() {
                debug!(
                    "Dropping {} for untracked escrow {} on {}",
                    event.kind, event.escrow_id, event.contract_ref
                );
                return (Transition::Untracked, None);
            }
            let state = EscrowState::open(event);
            let transition = Transition::Opened(state.status);
            self.states.insert(key, state.clone());
            return (transition, Some(state));
        }

        let Some(state) = self.states.get_mut(&key) else {
            return (Transition::Untracked, None);
        };
        let transition = state.apply(event);

        trace!(
            "Escrow {} on {}: {:?}",
            event.escrow_id,
            event.contract_ref,
            transition
        );

        let snapshot = transition.changed().then(|| state.clone());
        (transition, snapshot)
    }

    pub fn get(&self, contract_ref: &str, escrow_id: &str) -> Option<&EscrowState> {
        self.states
            .get(&(contract_ref.to_string(), escrow_id.to_string()))
    }

    /// Snapshot of every tracked escrow
    pub fn snapshot(&self) -> Vec<EscrowState> {
        self.states.values().cloned().collect()
    }

    #[cfg(test)]
    pub fn count_by_status(&self, status: EscrowStatus) -> usize {
        self.states.values().filter(|s| s.status == status).count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
