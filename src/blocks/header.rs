// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::Ordering;
use std::fmt;

use cid::Cid;
use derive_builder::Builder;
use fvm_ipld_encoding::DAG_CBOR;
use multihash_codetable::{Code, MultihashDigest};
use num_bigint::BigInt;
use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::Deserialize;

use super::{BeaconEntry, ElectionProof, Error, Ticket, TipsetKey};
use crate::address::Address;
use crate::clock::ChainEpoch;
use crate::crypto::Signature;

/// Position of the parents field in the serialized header tuple. Graph
/// traversal selectors recurse through this index.
pub const BLOCK_PARENTS_FIELD_INDEX: u64 = 4;
/// Position of the messages root in the serialized header tuple.
pub const BLOCK_MESSAGES_FIELD_INDEX: u64 = 9;

/// Header of a block.
///
/// Built via [`BlockHeader::builder`]; `build_and_validate` fills the CID and
/// byte caches, after which the header is immutable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Builder)]
#[builder(name = "BlockHeaderBuilder")]
pub struct BlockHeader {
    // MINER INFO
    /// Address of the miner actor that mined this block.
    #[builder(default)]
    miner_address: Address,

    // CONSENSUS
    /// The ticket submitted with this block.
    #[builder(default)]
    ticket: Option<Ticket>,
    /// Election proof of the mining win that produced this block.
    #[builder(default)]
    election_proof: Option<ElectionProof>,
    /// Beacon rounds observed since the parent block.
    #[builder(default)]
    beacon_entries: Vec<BeaconEntry>,

    // CHAIN LINKING
    /// The set of parents this block was based on. Typically one, but can be
    /// several when there were multiple winners in the parent epoch.
    #[builder(default)]
    parents: TipsetKey,
    /// Aggregate chain weight of the parent set.
    #[builder(default)]
    weight: BigInt,
    /// Epoch this block was mined in.
    #[builder(default)]
    epoch: ChainEpoch,

    // STATE
    /// Root of the state after applying the parent tipset.
    #[builder(default)]
    state_root: Cid,
    /// Root of the receipts produced by the parent tipset.
    #[builder(default)]
    message_receipts: Cid,
    /// CID of the `TxMeta` linking this block's message lists.
    #[builder(default)]
    messages: Cid,

    // SIGNATURES
    /// Aggregate of the BLS message signatures included in this block.
    #[builder(default)]
    bls_aggregate: Option<Signature>,
    /// Seconds since the Unix epoch at which this block was created.
    #[builder(default)]
    timestamp: u64,
    /// The miner's signature over the header.
    #[builder(default)]
    signature: Option<Signature>,

    // CACHE
    #[builder(default, setter(skip))]
    cached_cid: Cid,
    #[builder(default, setter(skip))]
    cached_bytes: Vec<u8>,
}

impl BlockHeader {
    pub fn builder() -> BlockHeaderBuilder {
        BlockHeaderBuilder::default()
    }

    pub fn miner_address(&self) -> &Address {
        &self.miner_address
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    pub fn election_proof(&self) -> Option<&ElectionProof> {
        self.election_proof.as_ref()
    }

    pub fn beacon_entries(&self) -> &[BeaconEntry] {
        &self.beacon_entries
    }

    pub fn parents(&self) -> &TipsetKey {
        &self.parents
    }

    pub fn weight(&self) -> &BigInt {
        &self.weight
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.epoch
    }

    pub fn state_root(&self) -> &Cid {
        &self.state_root
    }

    pub fn message_receipts(&self) -> &Cid {
        &self.message_receipts
    }

    pub fn messages(&self) -> &Cid {
        &self.messages
    }

    pub fn bls_aggregate(&self) -> Option<&Signature> {
        self.bls_aggregate.as_ref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// CID of the header. Filled at construction time.
    pub fn cid(&self) -> &Cid {
        &self.cached_cid
    }

    /// Serialized bytes of the header. Filled at construction time.
    pub fn cached_bytes(&self) -> &[u8] {
        &self.cached_bytes
    }

    fn update_cache(&mut self) -> Result<(), Error> {
        self.cached_bytes = fvm_ipld_encoding::to_vec(self)?;
        self.cached_cid = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&self.cached_bytes));
        Ok(())
    }
}

impl BlockHeaderBuilder {
    pub fn build_and_validate(&self) -> Result<BlockHeader, Error> {
        let mut header = self
            .build()
            .map_err(|e| Error::InvalidTipset(e.to_string()))?;
        header.update_cache()?;
        Ok(header)
    }
}

impl ser::Serialize for BlockHeader {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (
            &self.miner_address,
            &self.ticket,
            &self.election_proof,
            &self.beacon_entries,
            &self.parents,
            &self.weight,
            &self.epoch,
            &self.state_root,
            &self.message_receipts,
            &self.messages,
            &self.bls_aggregate,
            &self.timestamp,
            &self.signature,
        )
            .serialize(serializer)
    }
}

impl<'de> de::Deserialize<'de> for BlockHeader {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (
            miner_address,
            ticket,
            election_proof,
            beacon_entries,
            parents,
            weight,
            epoch,
            state_root,
            message_receipts,
            messages,
            bls_aggregate,
            timestamp,
            signature,
        ) = Deserialize::deserialize(deserializer)?;

        let mut header = BlockHeader {
            miner_address,
            ticket,
            election_proof,
            beacon_entries,
            parents,
            weight,
            epoch,
            state_root,
            message_receipts,
            messages,
            bls_aggregate,
            timestamp,
            signature,
            cached_cid: Cid::default(),
            cached_bytes: Vec::new(),
        };
        header.update_cache().map_err(de::Error::custom)?;
        Ok(header)
    }
}

impl PartialOrd for BlockHeader {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockHeader {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cached_bytes.cmp(&other.cached_bytes)
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHeader: {}", self.cid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_header_encoding() {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(12))
            .epoch(3)
            .weight(BigInt::from(100))
            .timestamp(1_234_567_980)
            .ticket(Some(Ticket::new(crate::crypto::VRFProof::new(vec![1, 2]))))
            .build_and_validate()
            .unwrap();

        let bz = fvm_ipld_encoding::to_vec(&header).unwrap();
        let decoded: BlockHeader = fvm_ipld_encoding::from_slice(&bz).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.cid(), header.cid());
    }

    #[test]
    fn cid_is_cached_at_construction() {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(1))
            .build_and_validate()
            .unwrap();
        assert_ne!(header.cid(), &Cid::default());
        assert!(!header.cached_bytes().is_empty());
    }
}
