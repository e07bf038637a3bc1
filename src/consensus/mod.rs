// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Consensus seams used by the syncer.
//!
//! The syncer is written against these traits; the concrete expected
//! consensus lives in [`expected`] and delegates the cryptography and the
//! actor engine to external collaborators.

mod expected;
mod syntax;

pub use expected::{ExpectedConsensus, HeaviestSelector};
pub use syntax::{DefaultBlockSyntaxValidator, DefaultMessageSyntaxValidator, SyntaxError};

use async_trait::async_trait;
use cid::Cid;
use thiserror::Error;

use crate::blocks::{BeaconEntry, BlockHeader, FullTipset, Tipset};
use crate::chain::Weight;
use crate::message::{SignedMessage, UnsignedMessage};
use crate::vm::{InterpreterError, Receipt};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Processing error: {0}")]
    Calculation(String),
    #[error("Block must have a ticket")]
    BlockWithoutTicket,
    #[error("Block must have an election proof")]
    BlockWithoutElectionProof,
    #[error("Block must have a signature")]
    BlockWithoutSignature,
    #[error("Block without BLS aggregate signature")]
    BlockWithoutBlsAggregate,
    #[error("Block received from the future: now = {0}, block = {1}")]
    TimeTravellingBlock(u64, u64),
    #[error("Chain store error: {0}")]
    ChainStore(#[from] crate::chain::Error),
    #[error("Interpreter error: {0}")]
    Interpreter(#[from] InterpreterError),
}

/// Evaluates tipset messages and produces the resulting states; validates
/// the consensus rules of a proposed tipset against its parent.
#[async_trait]
pub trait FullBlockValidator: Send + Sync {
    /// Verifies the mining rules of every block in `next` on top of
    /// `parent`: election proofs, ticket VRFs, beacon entries, timestamps,
    /// signatures and parent references.
    async fn validate_mining(
        &self,
        parent: &Tipset,
        next: &FullTipset,
        parent_weight: &Weight,
        parent_receipts_root: &Cid,
    ) -> Result<(), ConsensusError>;

    /// Applies the messages of `next` to `parent_state_root`, returning the
    /// new state root and the receipts. Errors when the transition is
    /// invalid.
    async fn run_state_transition(
        &self,
        next: &FullTipset,
        parent_state_root: &Cid,
    ) -> Result<(Cid, Vec<Receipt>), ConsensusError>;
}

/// Chooses the heaviest of two chains.
pub trait ChainSelector: Send + Sync {
    /// Weight of a tipset.
    fn weight(&self, ts: &Tipset) -> Result<Weight, ConsensusError>;

    /// True if tipset `a` is strictly heavier than tipset `b`.
    fn is_heavier(&self, a: &Tipset, b: &Tipset) -> Result<bool, ConsensusError>;
}

/// External cryptography. Everything the mining checks cannot compute
/// themselves is delegated here: VRFs, BLS aggregates, beacon signatures and
/// block signatures.
pub trait ProofVerifier: Send + Sync {
    fn verify_block_signature(&self, header: &BlockHeader) -> Result<(), String>;
    fn verify_election_proof(
        &self,
        header: &BlockHeader,
        beacon_base: &BeaconEntry,
    ) -> Result<(), String>;
    fn verify_ticket(&self, header: &BlockHeader, beacon_base: &BeaconEntry)
        -> Result<(), String>;
    fn verify_beacon_entries(
        &self,
        prev: &BeaconEntry,
        entries: &[BeaconEntry],
    ) -> Result<(), String>;
}

/// Pure syntactic validation of block headers, independent of any chain
/// state.
pub trait BlockSyntaxValidator: Send + Sync {
    fn validate_block_syntax(&self, header: &BlockHeader) -> Result<(), SyntaxError>;
}

/// Pure syntactic validation of messages.
pub trait MessageSyntaxValidator: Send + Sync {
    fn validate_unsigned_message_syntax(&self, msg: &UnsignedMessage) -> Result<(), SyntaxError>;
    fn validate_signed_message_syntax(&self, msg: &SignedMessage) -> Result<(), SyntaxError>;
}

/// The block and message validators handed to the fetcher as one unit.
#[derive(Clone)]
pub struct WrappedSyntaxValidator<B, M> {
    pub block: B,
    pub message: M,
}
