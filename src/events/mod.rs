//! Escrow factory event decoding
//!
//! `SrcEscrowCreated` is decoded exactly once, at the watcher boundary, into
//! [`EscrowCreated`]. Everything downstream works on the typed value.

use crate::chain::RawEvent;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{
    DestinationParties, LifecycleState, SourceParties, SwapId, SwapRecord,
};

use chrono::{DateTime, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::to_checksum;
use serde::Serialize;

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use lazy_static::lazy_static;

    pub const SRC_ESCROW_CREATED_SIGNATURE: &str = "SrcEscrowCreated((bytes32,bytes32,uint256,uint256,uint256,uint256,uint256,uint256),(uint256,uint256,uint256,uint256,uint256))";

    lazy_static! {
        pub static ref SRC_ESCROW_CREATED: H256 =
            H256::from(ethers::utils::keccak256(SRC_ESCROW_CREATED_SIGNATURE));
    }
}

/// Decoded `SrcEscrowCreated` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscrowCreated {
    pub order_hash: H256,
    pub hashlock: H256,
    pub source: SourceParties,
    pub destination: DestinationParties,
    pub block_number: u64,
    pub tx_hash: H256,
}

impl EscrowCreated {
    pub fn id(&self) -> SwapId {
        format!("{:?}", self.order_hash)
    }

    /// Fresh ledger record for a first sighting
    pub fn into_record(self, detected_at: DateTime<Utc>) -> SwapRecord {
        SwapRecord {
            id: self.id(),
            hashlock: self.hashlock,
            preimage: None,
            source: self.source,
            destination: self.destination,
            state: LifecycleState::Detected,
            attempts: 0,
            last_error: None,
            abandon_reason: None,
            detected_at,
            state_entered_at: detected_at,
            processed_at: None,
            source_block: self.block_number,
            source_tx_ref: format!("{:?}", self.tx_hash),
            dest_recipient: None,
            dest_tx_ref: None,
            claim_tx_ref: None,
            withdraw_tx_ref: None,
        }
    }
}

fn src_immutables_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::FixedBytes(32),
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
    ])
}

fn dst_complement_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
    ])
}

/// Decode a raw factory log into [`EscrowCreated`]
pub fn decode_escrow_created(event: &RawEvent) -> RelayerResult<EscrowCreated> {
    match event.topics.first() {
        Some(topic) if topic == &*topics::SRC_ESCROW_CREATED => {}
        Some(topic) => {
            return Err(RelayerError::Decode(format!(
                "unexpected topic {:?} in tx {:?}",
                topic, event.tx_hash
            )))
        }
        None => {
            return Err(RelayerError::Decode(format!(
                "log without topics in tx {:?}",
                event.tx_hash
            )))
        }
    }

    let tokens = abi::decode(&[src_immutables_type(), dst_complement_type()], &event.data)
        .map_err(|e| RelayerError::Decode(format!("tx {:?}: {}", event.tx_hash, e)))?;

    let mut tokens = tokens.into_iter();
    let src = tuple(tokens.next(), 8, "srcImmutables")?;
    let dst = tuple(tokens.next(), 5, "dstImmutablesComplement")?;

    let order_hash = fixed32(&src[0], "orderHash")?;
    let hashlock = fixed32(&src[1], "hashlock")?;
    if order_hash.is_zero() {
        return Err(RelayerError::Decode("zero orderHash".to_string()));
    }
    if hashlock.is_zero() {
        return Err(RelayerError::Decode(format!(
            "zero hashlock for order {:?}",
            order_hash
        )));
    }

    let source = SourceParties {
        maker: address(&src[2], "maker")?,
        taker: address(&src[3], "taker")?,
        token: address(&src[4], "token")?,
        amount: positive(&src[5], "amount")?,
        safety_deposit: uint(&src[6], "safetyDeposit")?,
        timelocks: uint(&src[7], "timelocks")?,
    };

    let chain_id = uint(&dst[4], "chainId")?;
    if chain_id > U256::from(u64::MAX) {
        return Err(RelayerError::Decode(format!(
            "destination chainId {} out of range",
            chain_id
        )));
    }

    let destination = DestinationParties {
        chain_id: chain_id.as_u64(),
        maker: address(&dst[0], "dst.maker")?,
        amount: positive(&dst[1], "dst.amount")?,
        token: address(&dst[2], "dst.token")?,
        safety_deposit: uint(&dst[3], "dst.safetyDeposit")?,
    };

    Ok(EscrowCreated {
        order_hash,
        hashlock,
        source,
        destination,
        block_number: event.block_number,
        tx_hash: event.tx_hash,
    })
}

fn tuple(token: Option<Token>, len: usize, name: &str) -> RelayerResult<Vec<Token>> {
    match token {
        Some(Token::Tuple(fields)) if fields.len() == len => Ok(fields),
        _ => Err(RelayerError::Decode(format!("malformed {}", name))),
    }
}

fn fixed32(token: &Token, name: &str) -> RelayerResult<H256> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => Ok(H256::from_slice(bytes)),
        _ => Err(RelayerError::Decode(format!("malformed {}", name))),
    }
}

fn uint(token: &Token, name: &str) -> RelayerResult<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| RelayerError::Decode(format!("malformed {}", name)))
}

fn positive(token: &Token, name: &str) -> RelayerResult<U256> {
    let value = uint(token, name)?;
    if value.is_zero() {
        return Err(RelayerError::Decode(format!("zero {}", name)));
    }
    Ok(value)
}

/// The factory packs addresses into uint256; the low 160 bits carry the address.
fn address(token: &Token, name: &str) -> RelayerResult<String> {
    let value = uint(token, name)?;
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    Ok(to_checksum(&Address::from_slice(&word[12..]), None))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::types::Bytes;

    pub(crate) struct EventFixture {
        pub order_hash: H256,
        pub hashlock: H256,
        pub maker: Address,
        pub amount: U256,
        pub dst_amount: U256,
        pub dst_chain_id: U256,
        pub block_number: u64,
    }

    impl EventFixture {
        pub(crate) fn new(order_byte: u8, hashlock: H256) -> Self {
            Self {
                order_hash: H256::repeat_byte(order_byte),
                hashlock,
                maker: Address::repeat_byte(0x11),
                amount: U256::from(1_000_000u64),
                dst_amount: U256::from(990_000u64),
                dst_chain_id: U256::from(888u64),
                block_number: 42,
            }
        }

        pub(crate) fn raw(&self) -> RawEvent {
            let addr = |a: Address| Token::Uint(U256::from_big_endian(a.as_bytes()));
            let data = abi::encode(&[
                Token::Tuple(vec![
                    Token::FixedBytes(self.order_hash.as_bytes().to_vec()),
                    Token::FixedBytes(self.hashlock.as_bytes().to_vec()),
                    addr(self.maker),
                    addr(Address::repeat_byte(0x22)),
                    addr(Address::repeat_byte(0x33)),
                    Token::Uint(self.amount),
                    Token::Uint(U256::from(1_000u64)),
                    Token::Uint(U256::from(7u64)),
                ]),
                Token::Tuple(vec![
                    addr(self.maker),
                    Token::Uint(self.dst_amount),
                    addr(Address::repeat_byte(0x44)),
                    Token::Uint(U256::from(1_000u64)),
                    Token::Uint(self.dst_chain_id),
                ]),
            ]);

            RawEvent {
                block_number: self.block_number,
                log_index: 0,
                tx_hash: H256::repeat_byte(0xee),
                topics: vec![*topics::SRC_ESCROW_CREATED],
                data: Bytes::from(data),
            }
        }
    }

    #[test]
    fn test_decode_src_escrow_created() {
        let hashlock = H256::repeat_byte(0x99);
        let decoded = decode_escrow_created(&EventFixture::new(0x01, hashlock).raw()).unwrap();

        assert_eq!(decoded.id(), format!("0x{}", "01".repeat(32)));
        assert_eq!(decoded.hashlock, hashlock);
        assert_eq!(decoded.source.amount, U256::from(1_000_000u64));
        assert_eq!(decoded.source.timelocks, U256::from(7u64));
        assert_eq!(
            decoded.source.maker,
            to_checksum(&Address::repeat_byte(0x11), None)
        );
        assert_eq!(decoded.destination.chain_id, 888);
        assert_eq!(decoded.destination.amount, U256::from(990_000u64));
        assert_eq!(decoded.block_number, 42);
    }

    #[test]
    fn test_into_record_starts_detected() {
        let decoded =
            decode_escrow_created(&EventFixture::new(0x01, H256::repeat_byte(0x99)).raw()).unwrap();
        let now = Utc::now();
        let record = decoded.into_record(now);
        assert_eq!(record.state, LifecycleState::Detected);
        assert_eq!(record.detected_at, now);
        assert!(record.preimage.is_none());
        assert_eq!(record.source_tx_ref, format!("0x{}", "ee".repeat(32)));
    }

    #[test]
    fn test_rejects_wrong_topic() {
        let mut raw = EventFixture::new(0x01, H256::repeat_byte(0x99)).raw();
        raw.topics = vec![H256::repeat_byte(0x12)];
        assert!(matches!(decode_escrow_created(&raw), Err(RelayerError::Decode(_))));
    }

    #[test]
    fn test_rejects_truncated_data() {
        let mut raw = EventFixture::new(0x01, H256::repeat_byte(0x99)).raw();
        raw.data = Bytes::from(raw.data[..100].to_vec());
        assert!(matches!(decode_escrow_created(&raw), Err(RelayerError::Decode(_))));
    }

    #[test]
    fn test_rejects_zero_fields() {
        let zero_hashlock = EventFixture::new(0x01, H256::zero()).raw();
        assert!(decode_escrow_created(&zero_hashlock).is_err());

        let mut zero_amount = EventFixture::new(0x01, H256::repeat_byte(0x99));
        zero_amount.dst_amount = U256::zero();
        assert!(decode_escrow_created(&zero_amount.raw()).is_err());

        let mut huge_chain = EventFixture::new(0x01, H256::repeat_byte(0x99));
        huge_chain.dst_chain_id = U256::MAX;
        assert!(decode_escrow_created(&huge_chain.raw()).is_err());
    }
}
