//! Escrow contract log decoding for EVM chains

use super::{Chain, EscrowEvent, EscrowEventKind, EventPayload};
use crate::error::{RelayerError, RelayerResult};

use chrono::Utc;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    pub const ESCROW_CREATED_SIG: &str = "EscrowCreated(uint256,address,string,uint256)";
    pub const ESCROW_FUNDED_SIG: &str = "EscrowFunded(uint256,address,uint256)";
    pub const ESCROW_RELEASED_SIG: &str = "EscrowReleased(uint256,address,string,uint256)";
    pub const ESCROW_REFUNDED_SIG: &str = "EscrowRefunded(uint256,address,uint256)";
    pub const ESCROW_DISPUTED_SIG: &str = "EscrowDisputed(uint256,address)";
    pub const ESCROW_RESOLVED_SIG: &str = "EscrowResolved(uint256,address)";
    pub const ESCROW_CANCELLED_SIG: &str = "EscrowCancelled(uint256)";

    fn signature_topic(signature: &str) -> H256 {
        H256::from(keccak256(signature.as_bytes()))
    }

    lazy_static! {
        pub static ref ESCROW_CREATED: H256 = signature_topic(ESCROW_CREATED_SIG);
        pub static ref ESCROW_FUNDED: H256 = signature_topic(ESCROW_FUNDED_SIG);
        pub static ref ESCROW_RELEASED: H256 = signature_topic(ESCROW_RELEASED_SIG);
        pub static ref ESCROW_REFUNDED: H256 = signature_topic(ESCROW_REFUNDED_SIG);
        pub static ref ESCROW_DISPUTED: H256 = signature_topic(ESCROW_DISPUTED_SIG);
        pub static ref ESCROW_RESOLVED: H256 = signature_topic(ESCROW_RESOLVED_SIG);
        pub static ref ESCROW_CANCELLED: H256 = signature_topic(ESCROW_CANCELLED_SIG);
    }

    /// Every topic0 the watcher subscribes to
    pub fn all() -> Vec<H256> {
        vec![
            *ESCROW_CREATED,
            *ESCROW_FUNDED,
            *ESCROW_RELEASED,
            *ESCROW_REFUNDED,
            *ESCROW_DISPUTED,
            *ESCROW_RESOLVED,
            *ESCROW_CANCELLED,
        ]
    }
}

/// Render an address the way contract references are keyed
pub fn format_address(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Event parser for the escrow contract ABI
#[derive(Debug, Clone, Default)]
pub struct EvmEventParser;

impl EvmEventParser {
    pub fn new() -> Self {
        Self
    }

    /// Map a topic0 onto an escrow event kind
    pub fn kind_for_topic(topic: &H256) -> Option<EscrowEventKind> {
        let kind = if topic == &*topics::ESCROW_CREATED {
            EscrowEventKind::Created
        } else if topic == &*topics::ESCROW_FUNDED {
            EscrowEventKind::Funded
        } else if topic == &*topics::ESCROW_RELEASED {
            EscrowEventKind::Released
        } else if topic == &*topics::ESCROW_REFUNDED {
            EscrowEventKind::Refunded
        } else if topic == &*topics::ESCROW_DISPUTED {
            EscrowEventKind::Disputed
        } else if topic == &*topics::ESCROW_RESOLVED {
            EscrowEventKind::Resolved
        } else if topic == &*topics::ESCROW_CANCELLED {
            EscrowEventKind::Cancelled
        } else {
            return None;
        };
        Some(kind)
    }

    /// Parse a log entry into an EscrowEvent.
    ///
    /// Returns `Ok(None)` for logs whose signature is not part of the escrow ABI.
    pub fn parse_log(&self, log: &Log) -> RelayerResult<Option<EscrowEvent>> {
        let Some(kind) = log.topics.first().and_then(Self::kind_for_topic) else {
            return Ok(None);
        };

        let block_number = log
            .block_number
            .map(|b| b.as_u64())
            .ok_or_else(|| RelayerError::Decode("log without block number".to_string()))?;
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| RelayerError::Decode("log without transaction hash".to_string()))?;

        // Indexed parameters
        let escrow_id = log
            .topics
            .get(1)
            .map(|t| U256::from_big_endian(t.as_bytes()))
            .ok_or_else(|| RelayerError::Decode(format!("{} log missing escrowId", kind)))?;
        let party = log
            .topics
            .get(2)
            .map(|t| format_address(&Address::from_slice(&t.as_bytes()[12..32])));

        let payload = match kind {
            EscrowEventKind::Created | EscrowEventKind::Released => {
                let tokens = decode_data(&[ParamType::String, ParamType::Uint(256)], &log.data)?;
                EventPayload {
                    buyer: party,
                    seller: Some(token_string(&tokens[0])?),
                    amount: token_uint(&tokens[1])?,
                    asset: None,
                }
            }
            EscrowEventKind::Funded | EscrowEventKind::Refunded => {
                let tokens = decode_data(&[ParamType::Uint(256)], &log.data)?;
                EventPayload {
                    buyer: party,
                    amount: token_uint(&tokens[0])?,
                    ..Default::default()
                }
            }
            EscrowEventKind::Disputed
            | EscrowEventKind::Resolved
            | EscrowEventKind::Cancelled => EventPayload::default(),
        };

        Ok(Some(EscrowEvent {
            chain: Chain::Ethereum,
            kind,
            contract_ref: format_address(&log.address),
            escrow_id: escrow_id.to_string(),
            origin_tx_id: format!("{:#x}", tx_hash),
            origin_position: block_number,
            observed_at: Utc::now(),
            payload,
        }))
    }
}

fn decode_data(types: &[ParamType], data: &[u8]) -> RelayerResult<Vec<Token>> {
    abi::decode(types, data).map_err(|e| RelayerError::Decode(format!("log data: {}", e)))
}

fn token_string(token: &Token) -> RelayerResult<String> {
    match token {
        Token::String(s) => Ok(s.clone()),
        other => Err(RelayerError::Decode(format!("expected string, got {:?}", other))),
    }
}

fn token_uint(token: &Token) -> RelayerResult<U256> {
    match token {
        Token::Uint(v) => Ok(*v),
        other => Err(RelayerError::Decode(format!("expected uint, got {:?}", other))),
    }
}

/// Log builders shared by the EVM tests
#[cfg(test)]
pub(crate) mod test_logs {
    use super::*;
    use ethers::types::{Bytes, U64};

    pub fn address(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn topic_for(kind: EscrowEventKind) -> H256 {
        match kind {
            EscrowEventKind::Created => *topics::ESCROW_CREATED,
            EscrowEventKind::Funded => *topics::ESCROW_FUNDED,
            EscrowEventKind::Released => *topics::ESCROW_RELEASED,
            EscrowEventKind::Refunded => *topics::ESCROW_REFUNDED,
            EscrowEventKind::Disputed => *topics::ESCROW_DISPUTED,
            EscrowEventKind::Resolved => *topics::ESCROW_RESOLVED,
            EscrowEventKind::Cancelled => *topics::ESCROW_CANCELLED,
        }
    }

    /// Build a log as the escrow contract would emit it
    pub fn escrow_log(
        contract: Address,
        kind: EscrowEventKind,
        escrow_id: u64,
        buyer: Address,
        seller: &str,
        amount: u64,
        tx_hash: H256,
        block: u64,
    ) -> Log {
        let mut topics = vec![topic_for(kind), H256::from_low_u64_be(escrow_id)];
        if kind != EscrowEventKind::Cancelled {
            topics.push(H256::from(buyer));
        }

        let data = match kind {
            EscrowEventKind::Created | EscrowEventKind::Released => abi::encode(&[
                Token::String(seller.to_string()),
                Token::Uint(U256::from(amount)),
            ]),
            EscrowEventKind::Funded | EscrowEventKind::Refunded => {
                abi::encode(&[Token::Uint(U256::from(amount))])
            }
            _ => Vec::new(),
        };

        Log {
            address: contract,
            topics,
            data: Bytes::from(data),
            block_number: Some(U64::from(block)),
            transaction_hash: Some(tx_hash),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_logs::*;
    use super::*;

    #[test]
    fn test_topics_are_distinct_keccak_hashes() {
        let all = topics::all();
        assert_eq!(all.len(), 7);
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(
            *topics::ESCROW_CREATED,
            H256::from(ethers::utils::keccak256(topics::ESCROW_CREATED_SIG))
        );
    }

    #[test]
    fn test_parse_release_log() {
        let log = escrow_log(
            address(0x11),
            EscrowEventKind::Released,
            1,
            address(0xaa),
            "addr_test1qzseller",
            1_000_000,
            H256::repeat_byte(0xee),
            42,
        );

        let event = EvmEventParser::new().parse_log(&log).unwrap().unwrap();
        assert_eq!(event.chain, Chain::Ethereum);
        assert_eq!(event.kind, EscrowEventKind::Released);
        assert_eq!(event.escrow_id, "1");
        assert_eq!(event.contract_ref, format_address(&address(0x11)));
        assert_eq!(event.origin_position, 42);
        assert_eq!(event.origin_tx_id, format!("{:#x}", H256::repeat_byte(0xee)));
        assert_eq!(event.payload.buyer, Some(format_address(&address(0xaa))));
        assert_eq!(event.payload.seller.as_deref(), Some("addr_test1qzseller"));
        assert_eq!(event.payload.amount, U256::from(1_000_000u64));
    }

    #[test]
    fn test_parse_funded_log_has_no_seller() {
        let log = escrow_log(
            address(0x11),
            EscrowEventKind::Funded,
            7,
            address(0xbb),
            "",
            500,
            H256::repeat_byte(0x01),
            3,
        );

        let event = EvmEventParser::new().parse_log(&log).unwrap().unwrap();
        assert_eq!(event.kind, EscrowEventKind::Funded);
        assert_eq!(event.escrow_id, "7");
        assert_eq!(event.payload.seller, None);
        assert_eq!(event.payload.amount, U256::from(500u64));
    }

    #[test]
    fn test_unknown_signature_is_dropped() {
        let mut log = escrow_log(
            address(0x11),
            EscrowEventKind::Cancelled,
            1,
            address(0),
            "",
            0,
            H256::zero(),
            1,
        );
        log.topics[0] = H256::repeat_byte(0x99);

        assert!(EvmEventParser::new().parse_log(&log).unwrap().is_none());
    }

    #[test]
    fn test_truncated_data_is_decode_error() {
        let mut log = escrow_log(
            address(0x11),
            EscrowEventKind::Created,
            1,
            address(0xaa),
            "seller",
            10,
            H256::zero(),
            1,
        );
        log.data = ethers::types::Bytes::from(vec![0u8; 16]);

        let err = EvmEventParser::new().parse_log(&log).unwrap_err();
        assert!(matches!(err, RelayerError::Decode(_)));
    }
}
