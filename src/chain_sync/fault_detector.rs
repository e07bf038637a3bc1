// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;

use cid::Cid;
use parking_lot::Mutex;
use tracing::warn;

use crate::address::Address;
use crate::blocks::{BlockHeader, Tipset, TipsetKey};
use crate::clock::ChainEpoch;

/// Evidence that one miner signed two different blocks at the same height
/// off the same parent tipset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusFault {
    pub miner: Address,
    pub epoch: ChainEpoch,
    pub parent: TipsetKey,
    pub block_a: Cid,
    pub block_b: Cid,
}

/// Watches validated blocks for consensus faults and emits them on an
/// outbound channel. Routing of faults is a policy decision left to the
/// channel's consumer; this type never acts on them.
pub struct ConsensusFaultDetector {
    seen: Mutex<HashMap<(Address, ChainEpoch, TipsetKey), Cid>>,
    fault_tx: flume::Sender<ConsensusFault>,
    /// Entries older than this many epochs behind the newest observation are
    /// pruned.
    retention: ChainEpoch,
}

impl ConsensusFaultDetector {
    pub fn new(fault_tx: flume::Sender<ConsensusFault>, retention: ChainEpoch) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            fault_tx,
            retention,
        }
    }

    /// Records a validated block. When the same (miner, epoch, parent) slot
    /// was already filled by a different block, a fault is emitted before
    /// the call returns.
    pub fn check_block(&self, block: &BlockHeader, parent: &Tipset) {
        let slot = (
            block.miner_address().clone(),
            block.epoch(),
            parent.key().clone(),
        );
        let mut seen = self.seen.lock();
        if let Some(existing) = seen.get(&slot).copied() {
            if existing != *block.cid() {
                let fault = ConsensusFault {
                    miner: slot.0,
                    epoch: slot.1,
                    parent: slot.2,
                    block_a: existing,
                    block_b: *block.cid(),
                };
                warn!(
                    miner = %fault.miner,
                    epoch = fault.epoch,
                    "consensus fault detected"
                );
                if self.fault_tx.send(fault).is_err() {
                    warn!("consensus fault dropped: no consumer on the fault channel");
                }
            }
            return;
        }
        seen.insert(slot, *block.cid());
        let horizon = block.epoch().saturating_sub(self.retention);
        seen.retain(|(_, epoch, _), _| *epoch >= horizon);
    }
}
