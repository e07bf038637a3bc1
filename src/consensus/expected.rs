// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use tracing::warn;

use super::{ChainSelector, ConsensusError, FullBlockValidator, ProofVerifier};
use crate::blocks::{BlockHeader, FullTipset, Tipset};
use crate::chain::{ChainStore, Weight};
use crate::clock::{ChainEpochClock, ALLOWABLE_CLOCK_DRIFT};
use crate::db::SettingsStore;
use crate::vm::{Interpreter, Receipt};

/// Expected-consensus validation: the mining checks over parent state plus
/// the state transition, with cryptography behind a [`ProofVerifier`] and
/// execution behind an [`Interpreter`].
pub struct ExpectedConsensus<DB, I, V> {
    store: Arc<ChainStore<DB>>,
    interpreter: I,
    verifier: V,
    clock: ChainEpochClock,
}

impl<DB, I, V> ExpectedConsensus<DB, I, V> {
    pub fn new(store: Arc<ChainStore<DB>>, interpreter: I, verifier: V, clock: ChainEpochClock) -> Self {
        Self {
            store,
            interpreter,
            verifier,
            clock,
        }
    }
}

impl<DB, I, V> ExpectedConsensus<DB, I, V>
where
    DB: Blockstore + SettingsStore,
    I: Interpreter,
    V: ProofVerifier,
{
    fn validate_block_mining(
        &self,
        header: &BlockHeader,
        parent: &Tipset,
        parent_weight: &Weight,
        parent_receipts_root: &Cid,
    ) -> Result<(), ConsensusError> {
        // All optional fields must be present past genesis.
        if header.ticket().is_none() {
            return Err(ConsensusError::BlockWithoutTicket);
        }
        let election_proof = header
            .election_proof()
            .ok_or(ConsensusError::BlockWithoutElectionProof)?;
        if header.signature().is_none() {
            return Err(ConsensusError::BlockWithoutSignature);
        }
        if header.bls_aggregate().is_none() {
            return Err(ConsensusError::BlockWithoutBlsAggregate);
        }

        if header.epoch() <= parent.epoch() {
            return Err(ConsensusError::Validation(format!(
                "block epoch {} is not after parent epoch {}",
                header.epoch(),
                parent.epoch()
            )));
        }
        if header.parents() != parent.key() {
            return Err(ConsensusError::Validation(format!(
                "block parents {} do not link to the validated parent {}",
                header.parents(),
                parent.key()
            )));
        }

        // Timestamps are pinned to the epoch clock.
        let expected_timestamp = self.clock.timestamp_for_epoch(header.epoch());
        if header.timestamp() != expected_timestamp {
            return Err(ConsensusError::Validation(format!(
                "block had the wrong timestamp: {} != {}",
                header.timestamp(),
                expected_timestamp
            )));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if header.timestamp() > now + ALLOWABLE_CLOCK_DRIFT {
            return Err(ConsensusError::TimeTravellingBlock(now, header.timestamp()));
        } else if header.timestamp() > now {
            warn!(
                "Got block from the future, but within clock drift threshold, {} > {}",
                header.timestamp(),
                now
            );
        }

        if header.weight() != parent_weight {
            return Err(ConsensusError::Validation(format!(
                "Parent weight doesn't match: {} (header), {} (computed)",
                header.weight(),
                parent_weight
            )));
        }
        if header.message_receipts() != parent_receipts_root {
            return Err(ConsensusError::Validation(format!(
                "Parent receipt root did not match computed root: {} (header), {} (computed)",
                header.message_receipts(),
                parent_receipts_root
            )));
        }

        if election_proof.win_count < 1 {
            return Err(ConsensusError::Validation(
                "Block is not claiming to be a winner".into(),
            ));
        }

        let prev_beacon = self.store.latest_beacon_entry(parent)?;
        self.verifier
            .verify_beacon_entries(&prev_beacon, header.beacon_entries())
            .map_err(ConsensusError::Validation)?;
        let beacon_base = header.beacon_entries().last().unwrap_or(&prev_beacon);
        self.verifier
            .verify_election_proof(header, beacon_base)
            .map_err(ConsensusError::Validation)?;
        self.verifier
            .verify_ticket(header, beacon_base)
            .map_err(ConsensusError::Validation)?;
        self.verifier
            .verify_block_signature(header)
            .map_err(ConsensusError::Validation)?;

        Ok(())
    }
}

#[async_trait]
impl<DB, I, V> FullBlockValidator for ExpectedConsensus<DB, I, V>
where
    DB: Blockstore + SettingsStore + Send + Sync + 'static,
    I: Interpreter,
    V: ProofVerifier,
{
    async fn validate_mining(
        &self,
        parent: &Tipset,
        next: &FullTipset,
        parent_weight: &Weight,
        parent_receipts_root: &Cid,
    ) -> Result<(), ConsensusError> {
        for block in next.blocks() {
            self.validate_block_mining(block.header(), parent, parent_weight, parent_receipts_root)?;
        }
        Ok(())
    }

    async fn run_state_transition(
        &self,
        next: &FullTipset,
        parent_state_root: &Cid,
    ) -> Result<(Cid, Vec<Receipt>), ConsensusError> {
        if next.parent_state() != parent_state_root {
            return Err(ConsensusError::Validation(format!(
                "Parent state root did not match computed state: {} (header), {} (computed)",
                next.parent_state(),
                parent_state_root
            )));
        }
        Ok(self.interpreter.apply_tipset(next, parent_state_root).await?)
    }
}

/// The heaviest-chain rule over the protocol weight function.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaviestSelector;

impl ChainSelector for HeaviestSelector {
    fn weight(&self, ts: &Tipset) -> Result<Weight, ConsensusError> {
        Ok(crate::chain::weight(ts))
    }

    fn is_heavier(&self, a: &Tipset, b: &Tipset) -> Result<bool, ConsensusError> {
        let (wa, wb) = (self.weight(a)?, self.weight(b)?);
        if wa != wb {
            return Ok(wa > wb);
        }
        Ok(a.break_weight_tie(b))
    }
}
