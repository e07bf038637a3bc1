// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::Cid;
use num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Block, BlockHeader, Error, Ticket};
use crate::clock::ChainEpoch;

/// A set of CIDs forming a unique key for a tipset.
///
/// Equal keys will have equivalent iteration order. The CIDs are kept in the
/// order the canonical block ordering produces them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TipsetKey {
    pub cids: Vec<Cid>,
}

impl TipsetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self { cids }
    }

    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }

    /// An empty key. Only the genesis tipset has empty parents.
    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }
}

impl fmt::Display for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, cid) in self.cids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{cid}")?;
        }
        write!(f, "}}")
    }
}

impl Serialize for TipsetKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.cids.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TipsetKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let cids: Vec<Cid> = Deserialize::deserialize(deserializer)?;
        Ok(TipsetKey { cids })
    }
}

/// An immutable set of blocks at the same epoch with the same parent set.
///
/// Blocks in a tipset are canonically ordered by ticket, with ties broken by
/// the block CID bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tipset {
    blocks: Vec<BlockHeader>,
    key: TipsetKey,
}

#[allow(clippy::len_without_is_empty)]
impl Tipset {
    /// Builds a new tipset from a collection of block headers.
    ///
    /// A valid tipset is a non-empty collection of blocks with distinct
    /// miners that all specify identical parents, weight, epoch, state root
    /// and receipts root.
    pub fn new(headers: Vec<BlockHeader>) -> Result<Self, Error> {
        let first = headers.first().ok_or(Error::NoBlocks)?.clone();

        for header in headers.iter().skip(1) {
            if header.parents() != first.parents() {
                return Err(Error::InvalidTipset("parent cids are not equal".into()));
            }
            if header.weight() != first.weight() {
                return Err(Error::InvalidTipset("weights are not equal".into()));
            }
            if header.epoch() != first.epoch() {
                return Err(Error::InvalidTipset("epochs are not equal".into()));
            }
            if header.state_root() != first.state_root() {
                return Err(Error::InvalidTipset("state roots are not equal".into()));
            }
            if header.message_receipts() != first.message_receipts() {
                return Err(Error::InvalidTipset("receipt roots are not equal".into()));
            }
            if headers
                .iter()
                .filter(|h| h.miner_address() == header.miner_address())
                .count()
                > 1
            {
                return Err(Error::InvalidTipset(format!(
                    "duplicate miner address {}",
                    header.miner_address()
                )));
            }
        }

        let mut sorted = headers;
        sorted.sort_by(|a, b| {
            let ticket = |h: &BlockHeader| h.ticket().cloned().unwrap_or_default();
            ticket(a)
                .cmp(&ticket(b))
                .then_with(|| a.cid().to_bytes().cmp(&b.cid().to_bytes()))
        });

        let cids = sorted.iter().map(|h| *h.cid()).collect();
        Ok(Self {
            blocks: sorted,
            key: TipsetKey::new(cids),
        })
    }

    pub fn blocks(&self) -> &[BlockHeader] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<BlockHeader> {
        self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn key(&self) -> &TipsetKey {
        &self.key
    }

    pub fn cids(&self) -> &[Cid] {
        self.key.cids()
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.blocks[0].epoch()
    }

    pub fn parents(&self) -> &TipsetKey {
        self.blocks[0].parents()
    }

    /// Root of the state after applying this tipset's parent.
    pub fn parent_state(&self) -> &Cid {
        self.blocks[0].state_root()
    }

    /// Root of the receipts produced by this tipset's parent.
    pub fn parent_receipts(&self) -> &Cid {
        self.blocks[0].message_receipts()
    }

    /// The aggregate chain weight of the parent set, as declared by the
    /// headers.
    pub fn weight(&self) -> &BigInt {
        self.blocks[0].weight()
    }

    /// Smallest ticket of all blocks in the tipset.
    pub fn min_ticket(&self) -> Option<&Ticket> {
        self.blocks[0].ticket()
    }

    /// Smallest timestamp of all blocks in the tipset.
    pub fn min_timestamp(&self) -> u64 {
        self.blocks
            .iter()
            .map(BlockHeader::timestamp)
            .min()
            .expect("tipset is non-empty")
    }

    /// True if `self` directly extends `possible_parent`.
    pub fn is_child_of(&self, possible_parent: &Tipset) -> bool {
        self.parents() == possible_parent.key()
    }

    /// Breaks weight ties between tipsets of equal weight: the tipset with
    /// the smallest minimum ticket wins; equal tickets fall back to block
    /// count.
    pub fn break_weight_tie(&self, other: &Tipset) -> bool {
        match (self.min_ticket(), other.min_ticket()) {
            (Some(a), Some(b)) if a != b => a < b,
            _ => self.len() > other.len(),
        }
    }
}

/// A tipset with the full message lists of every block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTipset {
    blocks: Vec<Block>,
    key: TipsetKey,
}

impl FullTipset {
    pub fn new(mut blocks: Vec<Block>) -> Result<Self, Error> {
        let tipset = Tipset::new(blocks.iter().map(|b| b.header().clone()).collect())?;
        // Blocks follow the canonical header ordering, so positional data
        // like message inclusion tables lines up across representations.
        blocks.sort_by_key(|block| {
            tipset
                .cids()
                .iter()
                .position(|c| c == block.cid())
                .expect("every block is part of the key")
        });
        Ok(Self {
            key: tipset.key().clone(),
            blocks,
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn key(&self) -> &TipsetKey {
        &self.key
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.blocks[0].header().epoch()
    }

    pub fn weight(&self) -> &BigInt {
        self.blocks[0].header().weight()
    }

    pub fn parent_state(&self) -> &Cid {
        self.blocks[0].header().state_root()
    }

    /// Drops the message lists, leaving the canonical tipset.
    pub fn to_tipset(&self) -> Result<Tipset, Error> {
        Tipset::new(self.blocks.iter().map(|b| b.header().clone()).collect())
    }

    pub fn into_tipset(self) -> Result<Tipset, Error> {
        Tipset::new(self.blocks.into_iter().map(Block::into_header).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::crypto::VRFProof;

    fn header(miner: u64, ticket: u64) -> BlockHeader {
        BlockHeader::builder()
            .miner_address(Address::new_id(miner))
            .ticket(Some(Ticket::new(VRFProof::new(vec![ticket as u8]))))
            .build_and_validate()
            .unwrap()
    }

    #[test]
    fn empty_tipset_is_rejected() {
        assert_eq!(Tipset::new(vec![]), Err(Error::NoBlocks));
    }

    #[test]
    fn duplicate_miner_is_rejected() {
        let err = Tipset::new(vec![header(1, 1), header(1, 2)]).unwrap_err();
        assert!(matches!(err, Error::InvalidTipset(_)));
    }

    #[test]
    fn blocks_sort_by_ticket() {
        let ts = Tipset::new(vec![header(1, 9), header(2, 3), header(3, 5)]).unwrap();
        let tickets: Vec<u8> = ts
            .blocks()
            .iter()
            .map(|h| h.ticket().unwrap().vrfproof.as_bytes()[0])
            .collect();
        assert_eq!(tickets, vec![3, 5, 9]);
        assert_eq!(ts.cids()[0], *ts.blocks()[0].cid());
    }

    #[test]
    fn tie_break_prefers_smaller_ticket() {
        let a = Tipset::new(vec![header(1, 1)]).unwrap();
        let b = Tipset::new(vec![header(2, 2)]).unwrap();
        assert!(a.break_weight_tie(&b));
        assert!(!b.break_weight_tie(&a));
    }
}
