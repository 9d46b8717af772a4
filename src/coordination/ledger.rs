//! Settlement records and the ledger the coordinator keeps them in

use crate::error::{RelayerError, RelayerResult};
use crate::events::{Chain, EscrowEvent};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Deterministic record id for a release observed on `chain` in `tx_id`
pub fn settlement_id(chain: Chain, tx_id: &str) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(format!("{}:{}", chain, tx_id).as_bytes());
    format!("stl_{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Retrying,
    Completed,
    Failed,
}

impl SettlementStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Completed | SettlementStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Retrying => "retrying",
            SettlementStatus::Completed => "completed",
            SettlementStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the executor needs to release funds on the opposite chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementData {
    pub escrow_id: String,
    pub buyer: String,
    pub seller: String,
    pub amount: U256,
    pub source_tx_id: String,
    pub source_chain: Chain,
}

impl SettlementData {
    pub fn from_event(event: &EscrowEvent) -> Self {
        Self {
            escrow_id: event.escrow_id.clone(),
            buyer: event.payload.buyer.clone().unwrap_or_default(),
            seller: event.payload.seller.clone().unwrap_or_default(),
            amount: event.payload.amount,
            source_tx_id: event.origin_tx_id.clone(),
            source_chain: event.chain,
        }
    }

    pub fn validate(&self) -> RelayerResult<()> {
        let missing = [
            ("escrow id", &self.escrow_id),
            ("buyer", &self.buyer),
            ("seller", &self.seller),
            ("source tx id", &self.source_tx_id),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        if let Some((field, _)) = missing {
            return Err(RelayerError::Validation(format!("{} is empty", field)));
        }
        if self.amount.is_zero() {
            return Err(RelayerError::Validation("amount must be positive".to_string()));
        }
        Ok(())
    }
}

/// One cross-chain settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: String,
    pub source_chain: Chain,
    pub target_chain: Chain,
    pub source_tx_id: String,
    pub target_tx_id: Option<String>,
    pub status: SettlementStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub data: SettlementData,
}

impl SettlementRecord {
    pub fn new(data: SettlementData) -> Self {
        let now = Utc::now();
        Self {
            id: settlement_id(data.source_chain, &data.source_tx_id),
            source_chain: data.source_chain,
            target_chain: data.source_chain.opposite(),
            source_tx_id: data.source_tx_id.clone(),
            target_tx_id: None,
            status: SettlementStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            data,
        }
    }

    /// Count a new execution attempt
    pub fn begin_attempt(&mut self) {
        self.attempt_count += 1;
        self.status = SettlementStatus::Retrying;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, target_tx_id: String) {
        let now = Utc::now();
        self.status = SettlementStatus::Completed;
        self.target_tx_id = Some(target_tx_id);
        self.completed_at = Some(now);
        self.updated_at = now;
        self.error = None;
    }

    pub fn fail(&mut self, error: impl ToString) {
        self.status = SettlementStatus::Failed;
        self.error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Fail on data the executor refused; the refused call does not count as an attempt
    pub fn reject(&mut self, error: impl ToString) {
        self.attempt_count = self.attempt_count.saturating_sub(1);
        self.fail(error);
    }

    /// Record a failed attempt that will be retried
    pub fn defer(&mut self, error: impl ToString) {
        self.error = Some(error.to_string());
        self.updated_at = Utc::now();
    }
}

/// Settlement counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementCounts {
    pub pending: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Settlement records keyed by id
#[derive(Debug, Default)]
pub struct Ledger {
    records: HashMap<String, SettlementRecord>,
    /// Records with an executor call whose result has not come back
    in_flight: HashSet<String>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: SettlementRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&SettlementRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SettlementRecord> {
        self.records.get_mut(id)
    }

    /// All records, oldest first
    pub fn all(&self) -> Vec<SettlementRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Count a new attempt on a non-terminal record and mark its call in flight
    pub fn begin_attempt(&mut self, id: &str) -> Option<SettlementRecord> {
        let record = self.records.get_mut(id)?;
        if record.status.is_terminal() {
            return None;
        }
        record.begin_attempt();
        self.in_flight.insert(id.to_string());
        Some(record.clone())
    }

    /// Clear the in-flight mark of a returned call and update its record
    pub fn finish_attempt(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut SettlementRecord),
    ) -> Option<SettlementRecord> {
        self.in_flight.remove(id);
        let record = self.records.get_mut(id)?;
        f(record);
        Some(record.clone())
    }

    /// Fail every record whose call was in flight when its result channel went away.
    ///
    /// The release may have landed on chain, so these need an operator, not a resubmit.
    pub fn abandon_in_flight(&mut self) -> Vec<SettlementRecord> {
        let mut abandoned = Vec::new();
        for id in std::mem::take(&mut self.in_flight) {
            if let Some(record) = self.records.get_mut(&id) {
                if !record.status.is_terminal() {
                    record.fail(format!(
                        "outcome unknown: attempt {} was in flight when the coordinator stopped; \
                         check the target chain before retrying",
                        record.attempt_count
                    ));
                    abandoned.push(record.clone());
                }
            }
        }
        abandoned
    }

    /// Ids of records that still need an attempt and have none in flight
    pub fn unfinished(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| !r.status.is_terminal() && !self.in_flight.contains(&r.id))
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn counts(&self) -> SettlementCounts {
        let mut counts = SettlementCounts {
            total: self.records.len(),
            ..Default::default()
        };
        for record in self.records.values() {
            match record.status {
                SettlementStatus::Pending => counts.pending += 1,
                SettlementStatus::Retrying => counts.retrying += 1,
                SettlementStatus::Completed => counts.completed += 1,
                SettlementStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
