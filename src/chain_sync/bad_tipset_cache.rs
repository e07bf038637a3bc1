// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use nonzero_ext::nonzero;
use parking_lot::Mutex;

use crate::blocks::{Tipset, TipsetKey};

/// Thread-safe cache of tipset keys known to be invalid.
///
/// Checked before fetching toward a proposed head and before walking to a
/// parent, to avoid re-validating chains that already failed. Entries are
/// only ever added during a run; the LRU bound is the only eviction.
#[derive(Debug)]
pub struct BadTipsetCache {
    cache: Mutex<LruCache<TipsetKey, String>>,
}

impl Default for BadTipsetCache {
    fn default() -> Self {
        Self::new(nonzero!(1usize << 15))
    }
}

impl BadTipsetCache {
    pub fn new(cap: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Marks a tipset bad for the given reason.
    pub fn put(&self, key: TipsetKey, reason: String) {
        self.cache.lock().put(key, reason);
    }

    /// Marks every tipset of a rejected chain bad with the same reason.
    pub fn add_chain(&self, tips: &[Arc<Tipset>], reason: &str) {
        let mut cache = self.cache.lock();
        for ts in tips {
            cache.put(ts.key().clone(), reason.to_owned());
        }
    }

    /// Returns the reason the tipset was marked bad, refreshing its LRU
    /// position.
    pub fn get(&self, key: &TipsetKey) -> Option<String> {
        self.cache.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &TipsetKey) -> bool {
        self.cache.lock().peek(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::blocks::{BlockHeader, Ticket};
    use crate::crypto::VRFProof;

    fn tipset(i: u64) -> Arc<Tipset> {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(i))
            .ticket(Some(Ticket::new(VRFProof::new(vec![i as u8]))))
            .epoch(i as i64)
            .build_and_validate()
            .unwrap();
        Arc::new(Tipset::new(vec![header]).unwrap())
    }

    #[test]
    fn put_and_contains() {
        let cache = BadTipsetCache::default();
        let ts = tipset(1);
        assert!(!cache.contains(ts.key()));
        cache.put(ts.key().clone(), "invalid state root".into());
        assert!(cache.contains(ts.key()));
        assert_eq!(cache.get(ts.key()).unwrap(), "invalid state root");
    }

    #[test]
    fn add_chain_taints_every_tipset() {
        let cache = BadTipsetCache::default();
        let chain: Vec<_> = (0..4).map(tipset).collect();
        cache.add_chain(&chain, "fork past finality");
        for ts in &chain {
            assert!(cache.contains(ts.key()));
        }
    }

    #[test]
    fn bounded_capacity_evicts_oldest() {
        let cache = BadTipsetCache::new(NonZeroUsize::new(2).unwrap());
        let (a, b, c) = (tipset(1), tipset(2), tipset(3));
        cache.put(a.key().clone(), "a".into());
        cache.put(b.key().clone(), "b".into());
        cache.put(c.key().clone(), "c".into());
        assert!(!cache.contains(a.key()));
        assert!(cache.contains(b.key()));
        assert!(cache.contains(c.key()));
    }
}
