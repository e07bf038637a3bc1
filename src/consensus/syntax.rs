// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use num_traits::Zero;
use thiserror::Error;

use super::{BlockSyntaxValidator, MessageSyntaxValidator};
use crate::blocks::BlockHeader;
use crate::clock::ChainEpochClock;
use crate::message::{SignedMessage, UnsignedMessage};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("block {0} has nil ticket")]
    NilTicket(cid::Cid),
    #[error("block {0} has negative epoch")]
    NegativeEpoch(cid::Cid),
    #[error("block {cid} has wrong timestamp: {actual} != {expected}")]
    WrongTimestamp {
        cid: cid::Cid,
        expected: u64,
        actual: u64,
    },
    #[error("message has no gas limit")]
    NoGasLimit,
    #[error("message transfers negative value")]
    NegativeValue,
    #[error("message has negative gas price")]
    NegativeGasPrice,
    #[error("signed message carries an empty signature")]
    EmptySignature,
}

/// Header checks that need nothing beyond the header itself and the epoch
/// clock.
#[derive(Clone, Copy)]
pub struct DefaultBlockSyntaxValidator {
    clock: ChainEpochClock,
}

impl DefaultBlockSyntaxValidator {
    pub fn new(clock: ChainEpochClock) -> Self {
        Self { clock }
    }
}

impl BlockSyntaxValidator for DefaultBlockSyntaxValidator {
    fn validate_block_syntax(&self, header: &BlockHeader) -> Result<(), SyntaxError> {
        if header.ticket().is_none() {
            return Err(SyntaxError::NilTicket(*header.cid()));
        }
        if header.epoch() < 0 {
            return Err(SyntaxError::NegativeEpoch(*header.cid()));
        }
        let expected = self.clock.timestamp_for_epoch(header.epoch());
        if header.timestamp() != expected {
            return Err(SyntaxError::WrongTimestamp {
                cid: *header.cid(),
                expected,
                actual: header.timestamp(),
            });
        }
        Ok(())
    }
}

/// Message checks independent of chain state: field bounds only, no
/// signature or nonce verification.
#[derive(Clone, Copy, Default)]
pub struct DefaultMessageSyntaxValidator;

impl MessageSyntaxValidator for DefaultMessageSyntaxValidator {
    fn validate_unsigned_message_syntax(&self, msg: &UnsignedMessage) -> Result<(), SyntaxError> {
        if msg.gas_limit <= 0 {
            return Err(SyntaxError::NoGasLimit);
        }
        if msg.value < num_bigint::BigInt::zero() {
            return Err(SyntaxError::NegativeValue);
        }
        if msg.gas_fee_cap < num_bigint::BigInt::zero()
            || msg.gas_premium < num_bigint::BigInt::zero()
        {
            return Err(SyntaxError::NegativeGasPrice);
        }
        Ok(())
    }

    fn validate_signed_message_syntax(&self, msg: &SignedMessage) -> Result<(), SyntaxError> {
        self.validate_unsigned_message_syntax(msg.message())?;
        if msg.signature.is_empty() {
            return Err(SyntaxError::EmptySignature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::blocks::Ticket;
    use crate::crypto::{Signature, VRFProof};
    use num_bigint::BigInt;

    fn clock() -> ChainEpochClock {
        ChainEpochClock::new(1_000_000)
    }

    fn valid_header() -> BlockHeader {
        BlockHeader::builder()
            .miner_address(Address::new_id(1))
            .ticket(Some(Ticket::new(VRFProof::new(vec![1]))))
            .epoch(2)
            .timestamp(clock().timestamp_for_epoch(2))
            .build_and_validate()
            .unwrap()
    }

    #[test]
    fn accepts_aligned_header() {
        let v = DefaultBlockSyntaxValidator::new(clock());
        assert_eq!(v.validate_block_syntax(&valid_header()), Ok(()));
    }

    #[test]
    fn rejects_nil_ticket() {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(1))
            .epoch(2)
            .timestamp(clock().timestamp_for_epoch(2))
            .build_and_validate()
            .unwrap();
        let v = DefaultBlockSyntaxValidator::new(clock());
        assert_eq!(
            v.validate_block_syntax(&header),
            Err(SyntaxError::NilTicket(*header.cid()))
        );
    }

    #[test]
    fn rejects_misaligned_timestamp() {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(1))
            .ticket(Some(Ticket::new(VRFProof::new(vec![1]))))
            .epoch(2)
            .timestamp(clock().timestamp_for_epoch(2) + 3)
            .build_and_validate()
            .unwrap();
        let v = DefaultBlockSyntaxValidator::new(clock());
        assert!(matches!(
            v.validate_block_syntax(&header),
            Err(SyntaxError::WrongTimestamp { .. })
        ));
    }

    #[test]
    fn message_bounds() {
        let v = DefaultMessageSyntaxValidator;
        let mut msg = UnsignedMessage {
            from: Address::new_id(1),
            to: Address::new_id(2),
            sequence: 0,
            value: BigInt::from(1),
            gas_limit: 10,
            gas_fee_cap: BigInt::from(1),
            gas_premium: BigInt::from(1),
            method: 0,
            params: Vec::new(),
        };
        assert_eq!(v.validate_unsigned_message_syntax(&msg), Ok(()));
        msg.gas_limit = 0;
        assert_eq!(
            v.validate_unsigned_message_syntax(&msg),
            Err(SyntaxError::NoGasLimit)
        );

        let signed = SignedMessage::new(
            UnsignedMessage {
                gas_limit: 5,
                ..msg.clone()
            },
            Signature::new_secp256k1(Vec::new()),
        );
        assert_eq!(
            v.validate_signed_message_syntax(&signed),
            Err(SyntaxError::EmptySignature)
        );
    }
}
