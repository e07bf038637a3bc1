// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{from_slice, to_vec, CborStore};
use parking_lot::RwLock;
use tracing::debug;

use super::{Error, TipIndex, TipsetMetadata};
use crate::blocks::{BeaconEntry, BlockHeader, Tipset, TipsetKey};
use crate::db::SettingsStore;

/// Settings key pointing at the current heaviest tipset.
pub const HEAD_KEY: &str = "head";

/// Key-space prefix under which per-tipset state and receipts roots are
/// persisted, keyed by tipset key.
const TIPSET_META_PREFIX: &str = "meta/";

fn meta_key(key: &TipsetKey) -> String {
    format!("{TIPSET_META_PREFIX}{key}")
}

/// Provides and stores validated tipsets and their state roots, and tracks
/// the heaviest known head.
///
/// The head pointer is only mutated by the syncer, which serializes updates
/// behind its head lock; the store itself stays lock-cheap.
pub struct ChainStore<DB> {
    db: Arc<DB>,
    genesis: BlockHeader,
    genesis_tipset: Arc<Tipset>,
    heaviest: RwLock<Arc<Tipset>>,
    tip_index: RwLock<TipIndex>,
}

impl<DB> ChainStore<DB>
where
    DB: Blockstore + SettingsStore,
{
    /// Opens a store over `db` rooted at the given genesis header. The
    /// genesis tipset is persisted and indexed with its own state root (an
    /// empty genesis tipset leaves state untouched), establishing the
    /// invariant that every parent the syncer asks about has both roots.
    pub fn new(db: Arc<DB>, genesis: BlockHeader) -> Result<Self, Error> {
        db.put_cbor(&genesis, multihash_codetable::Code::Blake2b256)
            .map_err(|e| Error::Other(e.to_string()))?;
        let genesis_tipset = Arc::new(Tipset::new(vec![genesis.clone()])?);

        let mut tip_index = TipIndex::new();
        tip_index.put(TipsetMetadata {
            tipset: genesis_tipset.clone(),
            tipset_state_root: *genesis.state_root(),
            tipset_receipts_root: *genesis.message_receipts(),
        })?;

        let heaviest = match SettingsStore::read_bin(db.as_ref(), HEAD_KEY)? {
            Some(bz) => {
                let key: TipsetKey = from_slice(&bz)?;
                Arc::new(load_tipset(db.as_ref(), &key)?)
            }
            None => {
                SettingsStore::write_bin(db.as_ref(), HEAD_KEY, &to_vec(genesis_tipset.key())?)?;
                genesis_tipset.clone()
            }
        };

        Ok(Self {
            db,
            genesis,
            genesis_tipset,
            heaviest: RwLock::new(heaviest),
            tip_index: RwLock::new(tip_index),
        })
    }

    pub fn blockstore(&self) -> &Arc<DB> {
        &self.db
    }

    pub fn genesis_block(&self) -> &BlockHeader {
        &self.genesis
    }

    pub fn genesis_tipset(&self) -> Arc<Tipset> {
        self.genesis_tipset.clone()
    }

    /// The current best-chain head.
    pub fn heaviest_tipset(&self) -> Arc<Tipset> {
        self.heaviest.read().clone()
    }

    /// Replaces the head. Headers are persisted first so the head always
    /// points at a stored tipset. Weight ordering is the caller's contract.
    pub fn set_head(&self, ts: Arc<Tipset>) -> Result<(), Error> {
        super::super::persist_objects(self.db.as_ref(), ts.blocks())?;
        SettingsStore::write_bin(self.db.as_ref(), HEAD_KEY, &to_vec(ts.key())?)?;
        debug!(head = %ts.key(), epoch = ts.epoch(), "head updated");
        *self.heaviest.write() = ts;
        Ok(())
    }

    /// Loads the tipset identified by `key`, preferring the validated index
    /// over raw header loads.
    pub fn tipset_from_keys(&self, key: &TipsetKey) -> Result<Arc<Tipset>, Error> {
        if let Ok(ts) = self.tip_index.read().get_tipset(key) {
            return Ok(ts);
        }
        Ok(Arc::new(load_tipset(self.db.as_ref(), key)?))
    }

    /// Records the state and receipts roots produced by validating a
    /// tipset. Written exactly once per tipset by the syncer; headers are
    /// persisted alongside so the tipset stays loadable, and the roots go
    /// into their own key-space so they survive a restart.
    pub fn put_tipset_metadata(&self, meta: TipsetMetadata) -> Result<(), Error> {
        super::super::persist_objects(self.db.as_ref(), meta.tipset.blocks())?;
        SettingsStore::write_bin(
            self.db.as_ref(),
            &meta_key(meta.tipset.key()),
            &to_vec(&(meta.tipset_state_root, meta.tipset_receipts_root))?,
        )?;
        self.tip_index.write().put(meta)
    }

    /// True when the tipset has been validated and its roots recorded.
    pub fn has_tipset_and_state(&self, key: &TipsetKey) -> bool {
        if self.tip_index.read().has(key) {
            return true;
        }
        matches!(
            SettingsStore::read_bin(self.db.as_ref(), &meta_key(key)),
            Ok(Some(_))
        )
    }

    fn persisted_roots(&self, key: &TipsetKey) -> Result<(Cid, Cid), Error> {
        let bz = SettingsStore::read_bin(self.db.as_ref(), &meta_key(key))?
            .ok_or_else(|| Error::UndefinedKey(key.to_string()))?;
        Ok(from_slice(&bz)?)
    }

    /// True when any validated tipset shares `ts`'s parents and epoch.
    pub fn has_sibling_state(&self, ts: &Tipset) -> bool {
        !self.sibling_state(ts).is_empty()
    }

    /// All validated tipsets sharing `ts`'s parents and epoch.
    pub fn sibling_state(&self, ts: &Tipset) -> Vec<TipsetMetadata> {
        self.tip_index.read().siblings(ts.parents(), ts.epoch())
    }

    pub fn tipset_state_root(&self, key: &TipsetKey) -> Result<Cid, Error> {
        match self.tip_index.read().get_tipset_state_root(key) {
            Ok(root) => Ok(root),
            Err(_) => Ok(self.persisted_roots(key)?.0),
        }
    }

    pub fn tipset_receipts_root(&self, key: &TipsetKey) -> Result<Cid, Error> {
        match self.tip_index.read().get_tipset_receipts_root(key) {
            Ok(root) => Ok(root),
            Err(_) => Ok(self.persisted_roots(key)?.1),
        }
    }

    /// Most recent beacon entry at or before `ts`.
    pub fn latest_beacon_entry(&self, ts: &Tipset) -> Result<BeaconEntry, Error> {
        super::super::latest_beacon_entry(self.db.as_ref(), ts)
    }
}

fn load_tipset<DB: Blockstore>(db: &DB, key: &TipsetKey) -> Result<Tipset, Error> {
    let headers = key
        .cids()
        .iter()
        .map(|c| {
            db.get_cbor::<BlockHeader>(c)
                .map_err(|e| Error::Other(e.to_string()))?
                .ok_or_else(|| Error::NotFound(format!("block header {c}")))
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(Tipset::new(headers)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::blocks::Ticket;
    use crate::crypto::VRFProof;
    use crate::db::MemoryDB;
    use crate::utils::cid::CidCborExt;

    fn genesis() -> BlockHeader {
        BlockHeader::builder()
            .miner_address(Address::new_id(0))
            .state_root(Cid::from_cbor_blake2b256(&"genesis state").unwrap())
            .message_receipts(Cid::from_cbor_blake2b256(&"genesis receipts").unwrap())
            .build_and_validate()
            .unwrap()
    }

    fn child_of(parent: &Tipset, miner: u64) -> Tipset {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(miner))
            .ticket(Some(Ticket::new(VRFProof::new(vec![miner as u8]))))
            .parents(parent.key().clone())
            .epoch(parent.epoch() + 1)
            .state_root(*parent.parent_state())
            .message_receipts(*parent.parent_receipts())
            .build_and_validate()
            .unwrap();
        Tipset::new(vec![header]).unwrap()
    }

    #[test]
    fn head_starts_at_genesis() {
        let store = ChainStore::new(Arc::new(MemoryDB::default()), genesis()).unwrap();
        assert_eq!(store.heaviest_tipset().key(), store.genesis_tipset().key());
    }

    #[test]
    fn genesis_roots_are_seeded() {
        let gen = genesis();
        let store = ChainStore::new(Arc::new(MemoryDB::default()), gen.clone()).unwrap();
        let key = store.genesis_tipset().key().clone();
        assert_eq!(store.tipset_state_root(&key).unwrap(), *gen.state_root());
        assert_eq!(
            store.tipset_receipts_root(&key).unwrap(),
            *gen.message_receipts()
        );
    }

    #[test]
    fn set_head_persists_and_survives_reopen() {
        let db = Arc::new(MemoryDB::default());
        let gen = genesis();
        let store = ChainStore::new(db.clone(), gen.clone()).unwrap();
        let next = Arc::new(child_of(&store.genesis_tipset(), 1));
        store.set_head(next.clone()).unwrap();
        assert_eq!(store.heaviest_tipset().key(), next.key());

        let reopened = ChainStore::new(db, gen).unwrap();
        assert_eq!(reopened.heaviest_tipset().key(), next.key());
    }

    #[test]
    fn metadata_round_trip() {
        let store = ChainStore::new(Arc::new(MemoryDB::default()), genesis()).unwrap();
        let ts = Arc::new(child_of(&store.genesis_tipset(), 1));
        let state = Cid::from_cbor_blake2b256(&"state").unwrap();
        let receipts = Cid::from_cbor_blake2b256(&"receipts").unwrap();
        store
            .put_tipset_metadata(TipsetMetadata {
                tipset: ts.clone(),
                tipset_state_root: state,
                tipset_receipts_root: receipts,
            })
            .unwrap();

        assert!(store.has_tipset_and_state(ts.key()));
        assert_eq!(store.tipset_state_root(ts.key()).unwrap(), state);
        assert_eq!(store.tipset_receipts_root(ts.key()).unwrap(), receipts);
        // headers were persisted with the metadata
        assert_eq!(store.tipset_from_keys(ts.key()).unwrap().key(), ts.key());
    }

    #[test]
    fn metadata_survives_reopen() {
        let db = Arc::new(MemoryDB::default());
        let gen = genesis();
        let state = Cid::from_cbor_blake2b256(&"state").unwrap();
        let receipts = Cid::from_cbor_blake2b256(&"receipts").unwrap();
        let ts = {
            let store = ChainStore::new(db.clone(), gen.clone()).unwrap();
            let ts = Arc::new(child_of(&store.genesis_tipset(), 1));
            store
                .put_tipset_metadata(TipsetMetadata {
                    tipset: ts.clone(),
                    tipset_state_root: state,
                    tipset_receipts_root: receipts,
                })
                .unwrap();
            ts
        };

        let reopened = ChainStore::new(db, gen).unwrap();
        assert!(reopened.has_tipset_and_state(ts.key()));
        assert_eq!(reopened.tipset_state_root(ts.key()).unwrap(), state);
        assert_eq!(reopened.tipset_receipts_root(ts.key()).unwrap(), receipts);
    }

    #[test]
    fn sibling_state_sees_same_slot() {
        let store = ChainStore::new(Arc::new(MemoryDB::default()), genesis()).unwrap();
        let gen_ts = store.genesis_tipset();
        let a = Arc::new(child_of(&gen_ts, 1));
        let b = Arc::new(child_of(&gen_ts, 2));
        for ts in [&a, &b] {
            store
                .put_tipset_metadata(TipsetMetadata {
                    tipset: ts.clone(),
                    tipset_state_root: Cid::default(),
                    tipset_receipts_root: Cid::default(),
                })
                .unwrap();
        }
        assert!(store.has_sibling_state(&a));
        assert_eq!(store.sibling_state(&a).len(), 2);
    }
}
