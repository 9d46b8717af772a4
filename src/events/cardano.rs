//! Cardano chain-sync message types (Ogmios v6 JSON shapes) and escrow classification helpers

use super::{ChainPosition, EscrowEventKind};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Chain point used for intersections and rollbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPoint", into = "RawPoint")]
pub enum Point {
    Origin,
    Specific { slot: u64, id: String },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawPoint {
    Named(String),
    Specific { slot: u64, id: String },
}

impl TryFrom<RawPoint> for Point {
    type Error = String;

    fn try_from(raw: RawPoint) -> Result<Self, Self::Error> {
        match raw {
            RawPoint::Named(name) if name == "origin" => Ok(Point::Origin),
            RawPoint::Named(other) => Err(format!("unknown point: {}", other)),
            RawPoint::Specific { slot, id } => Ok(Point::Specific { slot, id }),
        }
    }
}

impl From<Point> for RawPoint {
    fn from(point: Point) -> Self {
        match point {
            Point::Origin => RawPoint::Named("origin".to_string()),
            Point::Specific { slot, id } => RawPoint::Specific { slot, id },
        }
    }
}

impl Point {
    pub fn slot(&self) -> u64 {
        match self {
            Point::Origin => 0,
            Point::Specific { slot, .. } => *slot,
        }
    }

    pub fn to_position(&self) -> Option<ChainPosition> {
        match self {
            Point::Origin => None,
            Point::Specific { slot, id } => Some(ChainPosition::Slot {
                slot: *slot,
                id: id.clone(),
            }),
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Origin => f.write_str("origin"),
            Point::Specific { slot, id } => write!(f, "{}@{}", slot, id),
        }
    }
}

/// Outcome of `findIntersection`
#[derive(Debug, Clone, PartialEq)]
pub enum IntersectionResponse {
    Found(Point),
    NotFound,
}

/// Outcome of `nextBlock`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum NextBlockResponse {
    #[serde(rename = "forward")]
    RollForward { block: Block },
    #[serde(rename = "backward")]
    RollBackward { point: Point },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(default)]
    pub slot: u64,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub redeemers: Vec<Redeemer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct TxInput {
    pub transaction: TxRef,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct TxRef {
    pub id: String,
}

/// Reference to one transaction output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OutputRef {
    pub tx_id: String,
    pub index: u32,
}

impl From<&TxInput> for OutputRef {
    fn from(input: &TxInput) -> Self {
        OutputRef {
            tx_id: input.transaction.id.clone(),
            index: input.index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TxOutput {
    pub address: String,
    #[serde(default)]
    pub value: Value,
    pub datum: Option<String>,
    #[serde(rename = "datumHash")]
    pub datum_hash: Option<String>,
}

impl TxOutput {
    pub fn has_datum(&self) -> bool {
        self.datum.is_some() || self.datum_hash.is_some()
    }
}

/// Multi-asset value: `{"ada": {"lovelace": n}, "<policy>": {"<asset>": qty}}`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Value(pub BTreeMap<String, BTreeMap<String, u64>>);

impl Value {
    pub fn lovelace(&self) -> u64 {
        self.0
            .get("ada")
            .and_then(|ada| ada.get("lovelace"))
            .copied()
            .unwrap_or(0)
    }

    /// Summed quantity of every asset under `policy`, if any is present
    pub fn policy_quantity(&self, policy: &str) -> Option<u64> {
        self.0
            .get(policy)
            .map(|assets| assets.values().fold(0u64, |acc, q| acc.saturating_add(*q)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Redeemer {
    pub validator: RedeemerPointer,
    /// Hex-encoded CBOR Plutus data
    pub redeemer: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RedeemerPointer {
    pub purpose: String,
    pub index: u32,
}

/// Escrow validator actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowRedeemer {
    Fund,
    Release,
    Refund,
    Dispute,
    Resolve,
}

impl EscrowRedeemer {
    /// Decode the constructor index of a Plutus `Constr` from its CBOR hex.
    ///
    /// Constructors 0..=6 are CBOR tags 121..=127 (`d879`..`d87f`).
    pub fn from_plutus_hex(data: &str) -> Option<Self> {
        let bytes = hex::decode(data.trim_start_matches("0x")).ok()?;
        if bytes.len() < 2 || bytes[0] != 0xd8 {
            return None;
        }
        match bytes[1].checked_sub(121)? {
            0 => Some(EscrowRedeemer::Fund),
            1 => Some(EscrowRedeemer::Release),
            2 => Some(EscrowRedeemer::Refund),
            3 => Some(EscrowRedeemer::Dispute),
            4 => Some(EscrowRedeemer::Resolve),
            _ => None,
        }
    }

    pub fn event_kind(&self) -> EscrowEventKind {
        match self {
            EscrowRedeemer::Fund => EscrowEventKind::Funded,
            EscrowRedeemer::Release => EscrowEventKind::Released,
            EscrowRedeemer::Refund => EscrowEventKind::Refunded,
            EscrowRedeemer::Dispute => EscrowEventKind::Disputed,
            EscrowRedeemer::Resolve => EscrowEventKind::Resolved,
        }
    }
}

impl Transaction {
    /// Spend redeemer attached to `input`, if the transaction carries one.
    ///
    /// Spend redeemer indices point into the inputs sorted by (tx id, index).
    pub fn spend_redeemer(&self, input: &TxInput) -> Option<EscrowRedeemer> {
        let mut sorted: Vec<&TxInput> = self.inputs.iter().collect();
        sorted.sort();
        let position = sorted.iter().position(|i| *i == input)? as u32;

        self.redeemers
            .iter()
            .find(|r| r.validator.purpose == "spend" && r.validator.index == position)
            .and_then(|r| EscrowRedeemer::from_plutus_hex(&r.redeemer))
    }
}

/// Classify a new output paying a watched script address
pub fn classify_output(output: &TxOutput) -> EscrowEventKind {
    if output.has_datum() {
        EscrowEventKind::Created
    } else {
        EscrowEventKind::Funded
    }
}

/// Classify the spend of a tracked escrow output
pub fn classify_spend(tx: &Transaction, input: &TxInput) -> EscrowEventKind {
    tx.spend_redeemer(input)
        .map(|r| r.event_kind())
        .unwrap_or(EscrowEventKind::Released)
}
