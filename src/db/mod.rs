// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Content store adapters.
//!
//! All chain objects live behind the [`fvm_ipld_blockstore::Blockstore`]
//! trait (opaque CBOR blobs keyed by CID). [`SettingsStore`] adds the small
//! named-key space used for the head pointer.

use std::collections::HashMap;

use anyhow::Result;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use parking_lot::RwLock;

/// Named-key binary storage next to the blockstore, used for mutable
/// pointers such as the chain head.
pub trait SettingsStore: Send + Sync {
    fn read_bin(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn write_bin(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// A thread-safe in-memory database.
#[derive(Debug, Default)]
pub struct MemoryDB {
    blockchain_db: RwLock<HashMap<Cid, Vec<u8>>>,
    settings_db: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every block into `other`. Used to flush a scratch store into
    /// the main store once a fetched batch is complete.
    pub fn copy_to(&self, other: &impl Blockstore) -> Result<()> {
        for (k, v) in self.blockchain_db.read().iter() {
            other.put_keyed(k, v)?;
        }
        Ok(())
    }

    /// Number of blocks held.
    pub fn len(&self) -> usize {
        self.blockchain_db.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blockchain_db.read().is_empty()
    }
}

impl Blockstore for MemoryDB {
    fn get(&self, k: &Cid) -> Result<Option<Vec<u8>>> {
        Ok(self.blockchain_db.read().get(k).cloned())
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> Result<()> {
        self.blockchain_db.write().insert(*k, block.to_vec());
        Ok(())
    }

    fn has(&self, k: &Cid) -> Result<bool> {
        Ok(self.blockchain_db.read().contains_key(k))
    }
}

impl SettingsStore for MemoryDB {
    fn read_bin(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.settings_db.read().get(key).cloned())
    }

    fn write_bin(&self, key: &str, value: &[u8]) -> Result<()> {
        self.settings_db.write().insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_encoding::CborStore;
    use multihash_codetable::Code;

    #[test]
    fn blockstore_round_trip() {
        let db = MemoryDB::default();
        let cid = db.put_cbor(&"value", Code::Blake2b256).unwrap();
        assert!(db.has(&cid).unwrap());
        assert_eq!(db.get_cbor::<String>(&cid).unwrap().unwrap(), "value");
    }

    #[test]
    fn settings_round_trip() {
        let db = MemoryDB::default();
        assert!(db.read_bin("head").unwrap().is_none());
        db.write_bin("head", &[1, 2, 3]).unwrap();
        assert_eq!(db.read_bin("head").unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn copy_to_moves_all_blocks() {
        let scratch = MemoryDB::default();
        let main = MemoryDB::default();
        let a = scratch.put_cbor(&1u64, Code::Blake2b256).unwrap();
        let b = scratch.put_cbor(&2u64, Code::Blake2b256).unwrap();
        scratch.copy_to(&main).unwrap();
        assert!(main.has(&a).unwrap());
        assert!(main.has(&b).unwrap());
    }
}
