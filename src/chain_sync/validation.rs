// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::{SystemTime, UNIX_EPOCH};

use fvm_ipld_blockstore::Blockstore;
use thiserror::Error;

use super::bad_tipset_cache::BadTipsetCache;
use crate::blocks::FullTipset;
use crate::chain;
use crate::clock::{ChainEpoch, ChainEpochClock};
use crate::message::{message_cids, signed_message_cids};

/// Epochs a proposed head may run ahead of the local clock before it is
/// dropped instead of queued.
pub const MAX_HEIGHT_DRIFT: ChainEpoch = 5;

#[derive(Debug, Error)]
pub enum TipsetValidationError {
    #[error("Tipset has no blocks")]
    NoBlocks,
    #[error("Tipset epoch {0} is too far ahead of the local epoch {1}")]
    EpochTooLarge(ChainEpoch, ChainEpoch),
    #[error("Tipset is marked bad: {0}")]
    Bad(String),
    #[error("Invalid message root: expected {expected}, computed {computed}")]
    InvalidRoots {
        expected: cid::Cid,
        computed: cid::Cid,
    },
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Structural checks a tipset must pass before it becomes a sync target.
/// These are cheap; the full mining checks run later in the syncer.
pub struct TipsetValidator<'a>(pub &'a FullTipset);

impl TipsetValidator<'_> {
    pub fn validate<DB: Blockstore>(
        &self,
        store: &DB,
        bad_tipsets: &BadTipsetCache,
        clock: &ChainEpochClock,
    ) -> Result<(), TipsetValidationError> {
        let ts = self.0;
        if ts.blocks().is_empty() {
            return Err(TipsetValidationError::NoBlocks);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let local_epoch = clock.epoch_at_time(now);
        if ts.epoch() > local_epoch + MAX_HEIGHT_DRIFT {
            return Err(TipsetValidationError::EpochTooLarge(ts.epoch(), local_epoch));
        }

        if let Some(reason) = bad_tipsets.get(ts.key()) {
            return Err(TipsetValidationError::Bad(reason));
        }

        // Every block must commit to exactly the messages it carries.
        for block in ts.blocks() {
            let bls_cids = message_cids(block.bls_msgs())
                .map_err(|e| TipsetValidationError::Encoding(e.to_string()))?;
            let secp_cids = signed_message_cids(block.secp_msgs())
                .map_err(|e| TipsetValidationError::Encoding(e.to_string()))?;
            let computed = chain::compute_msg_meta(store, &bls_cids, &secp_cids)
                .map_err(|e| TipsetValidationError::Encoding(e.to_string()))?;
            if &computed != block.header().messages() {
                return Err(TipsetValidationError::InvalidRoots {
                    expected: *block.header().messages(),
                    computed,
                });
            }
        }

        Ok(())
    }
}
