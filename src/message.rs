// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain messages in their unsigned and signed forms.

use cid::Cid;
use fvm_ipld_encoding::tuple::*;

use crate::address::Address;
use crate::crypto::Signature;
use crate::utils::cid::CidCborExt;
use crate::vm::TokenAmount;

/// Limit on the total number of messages a single block may include across
/// both message kinds.
pub const BLOCK_MESSAGE_LIMIT: usize = 10_000;

/// A message before signing. BLS-carried messages stay in this form; their
/// signatures are aggregated into the block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct UnsignedMessage {
    pub from: Address,
    pub to: Address,
    pub sequence: u64,
    pub value: TokenAmount,
    pub gas_limit: i64,
    pub gas_fee_cap: TokenAmount,
    pub gas_premium: TokenAmount,
    pub method: u64,
    #[serde(with = "serde_bytes")]
    pub params: Vec<u8>,
}

impl UnsignedMessage {
    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        Cid::from_cbor_blake2b256(self)
    }

    /// Bytes a signer commits to.
    pub fn to_signing_bytes(&self) -> Result<Vec<u8>, fvm_ipld_encoding::Error> {
        Ok(self.cid()?.to_bytes())
    }

    /// Maximum funds the message can draw from the sender.
    pub fn required_funds(&self) -> TokenAmount {
        &self.value + &self.gas_fee_cap * self.gas_limit
    }
}

/// A message carrying its own secp256k1 signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedMessage {
    pub message: UnsignedMessage,
    pub signature: Signature,
}

impl SignedMessage {
    pub fn new(message: UnsignedMessage, signature: Signature) -> Self {
        Self { message, signature }
    }

    pub fn message(&self) -> &UnsignedMessage {
        &self.message
    }

    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        Cid::from_cbor_blake2b256(self)
    }
}

/// Collects the CIDs of a message list, preserving order.
pub fn message_cids<'a, M>(messages: M) -> Result<Vec<Cid>, fvm_ipld_encoding::Error>
where
    M: IntoIterator<Item = &'a UnsignedMessage>,
{
    messages.into_iter().map(|m| m.cid()).collect()
}

/// Collects the CIDs of a signed message list, preserving order.
pub fn signed_message_cids<'a, M>(messages: M) -> Result<Vec<Cid>, fvm_ipld_encoding::Error>
where
    M: IntoIterator<Item = &'a SignedMessage>,
{
    messages.into_iter().map(|m| m.cid()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_encoding::{from_slice, to_vec};
    use num_bigint::BigInt;

    fn message(sequence: u64) -> UnsignedMessage {
        UnsignedMessage {
            from: Address::new_id(1),
            to: Address::new_id(2),
            sequence,
            value: BigInt::from(10),
            gas_limit: 100,
            gas_fee_cap: BigInt::from(1),
            gas_premium: BigInt::from(1),
            method: 0,
            params: Vec::new(),
        }
    }

    #[test]
    fn cbor_round_trip() {
        let msg = message(4);
        let bz = to_vec(&msg).unwrap();
        assert_eq!(from_slice::<UnsignedMessage>(&bz).unwrap(), msg);
    }

    #[test]
    fn cid_tracks_content() {
        assert_eq!(message(1).cid().unwrap(), message(1).cid().unwrap());
        assert_ne!(message(1).cid().unwrap(), message(2).cid().unwrap());
    }

    #[test]
    fn required_funds_cover_value_and_gas() {
        let msg = message(0);
        assert_eq!(msg.required_funds(), BigInt::from(10 + 100));
    }
}
