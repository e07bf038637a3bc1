// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;

use super::Error;
use crate::blocks::{Tipset, TipsetKey};
use crate::clock::ChainEpoch;

/// The value tracked per validated tipset: the tipset itself, the root of
/// the state after applying its messages to the parent state, and the root
/// of the receipts those messages produced.
#[derive(Clone, Debug, PartialEq)]
pub struct TipsetMetadata {
    pub tipset: Arc<Tipset>,
    pub tipset_state_root: Cid,
    pub tipset_receipts_root: Cid,
}

/// Tracks tipsets and their state by tipset key, with a secondary index by
/// (parents, epoch) so sibling tipsets of a proposed head can be found for
/// widening.
#[derive(Default)]
pub struct TipIndex {
    metadata_by_key: HashMap<TipsetKey, TipsetMetadata>,
    keys_by_parents: HashMap<(TipsetKey, ChainEpoch), Vec<TipsetKey>>,
}

impl TipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records metadata for a tipset. After this call the entry can be
    /// looked up by the tipset's key, and the tipset participates in sibling
    /// queries for its (parents, epoch) slot.
    pub fn put(&mut self, meta: TipsetMetadata) -> Result<(), Error> {
        if meta.tipset.len() == 0 {
            return Err(Error::Blockchain(crate::blocks::Error::NoBlocks));
        }
        let key = meta.tipset.key().clone();
        let slot = (meta.tipset.parents().clone(), meta.tipset.epoch());

        let siblings = self.keys_by_parents.entry(slot).or_default();
        if !siblings.contains(&key) {
            siblings.push(key.clone());
        }
        self.metadata_by_key.insert(key, meta);
        Ok(())
    }

    pub fn get(&self, key: &TipsetKey) -> Result<&TipsetMetadata, Error> {
        self.metadata_by_key
            .get(key)
            .ok_or_else(|| Error::UndefinedKey(key.to_string()))
    }

    pub fn has(&self, key: &TipsetKey) -> bool {
        self.metadata_by_key.contains_key(key)
    }

    pub fn get_tipset(&self, key: &TipsetKey) -> Result<Arc<Tipset>, Error> {
        Ok(self.get(key)?.tipset.clone())
    }

    pub fn get_tipset_state_root(&self, key: &TipsetKey) -> Result<Cid, Error> {
        Ok(self.get(key)?.tipset_state_root)
    }

    pub fn get_tipset_receipts_root(&self, key: &TipsetKey) -> Result<Cid, Error> {
        Ok(self.get(key)?.tipset_receipts_root)
    }

    /// All recorded tipsets sharing `(parents, epoch)`, the input included if
    /// recorded.
    pub fn siblings(&self, parents: &TipsetKey, epoch: ChainEpoch) -> Vec<TipsetMetadata> {
        self.keys_by_parents
            .get(&(parents.clone(), epoch))
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.metadata_by_key.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::blocks::{BlockHeader, Ticket};
    use crate::crypto::VRFProof;
    use crate::utils::cid::CidCborExt;

    fn meta(miner: u64, parents: TipsetKey, epoch: ChainEpoch) -> TipsetMetadata {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(miner))
            .ticket(Some(Ticket::new(VRFProof::new(vec![miner as u8]))))
            .parents(parents)
            .epoch(epoch)
            .build_and_validate()
            .unwrap();
        TipsetMetadata {
            tipset: Arc::new(Tipset::new(vec![header]).unwrap()),
            tipset_state_root: Cid::from_cbor_blake2b256(&("state", miner)).unwrap(),
            tipset_receipts_root: Cid::from_cbor_blake2b256(&("receipts", miner)).unwrap(),
        }
    }

    #[test]
    fn put_then_get_roots() {
        let mut index = TipIndex::new();
        let m = meta(1, TipsetKey::default(), 1);
        index.put(m.clone()).unwrap();

        let key = m.tipset.key();
        assert!(index.has(key));
        assert_eq!(
            index.get_tipset_state_root(key).unwrap(),
            m.tipset_state_root
        );
        assert_eq!(
            index.get_tipset_receipts_root(key).unwrap(),
            m.tipset_receipts_root
        );
    }

    #[test]
    fn missing_key_errors() {
        let index = TipIndex::new();
        assert!(matches!(
            index.get(&TipsetKey::default()),
            Err(Error::UndefinedKey(_))
        ));
    }

    #[test]
    fn siblings_share_parents_and_epoch() {
        let mut index = TipIndex::new();
        let parents = TipsetKey::new(vec![Cid::from_cbor_blake2b256(&"p").unwrap()]);
        let a = meta(1, parents.clone(), 5);
        let b = meta(2, parents.clone(), 5);
        let other = meta(3, parents.clone(), 6);
        index.put(a.clone()).unwrap();
        index.put(b.clone()).unwrap();
        index.put(other).unwrap();

        let siblings = index.siblings(&parents, 5);
        assert_eq!(siblings.len(), 2);
        assert!(siblings.contains(&a));
        assert!(siblings.contains(&b));
    }

    #[test]
    fn put_is_idempotent_per_key() {
        let mut index = TipIndex::new();
        let parents = TipsetKey::default();
        let m = meta(1, parents.clone(), 2);
        index.put(m.clone()).unwrap();
        index.put(m).unwrap();
        assert_eq!(index.siblings(&parents, 2).len(), 1);
    }
}
