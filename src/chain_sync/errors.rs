// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use thiserror::Error;

use super::exchange::ExchangeError;
use super::fetcher::FetchError;
use super::validation::TipsetValidationError;
use crate::consensus::ConsensusError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No blocks for tipset")]
    NoBlocks,
    /// The proposed head is lighter than the current one.
    #[error("do not sync to a target with less weight than the current head")]
    TargetWeightTooLow,
    #[error("do not sync to a target that has already been synced")]
    AlreadySynced,
    #[error("input chain contains a cached bad tipset: {0}")]
    BadTipset(String),
    /// The fork point lies beyond the finality window.
    #[error("fork longer than threshold")]
    ForkTooLong,
    /// The remote chain links back to a different genesis. Not retried.
    #[error("synced chain forked at genesis, refusing to sync: {0}")]
    ForkAtGenesis(String),
    /// Local state is corrupted; aborts the subsystem.
    #[error("the chain store is in an unexpected state: {0}")]
    UnexpectedStoreState(String),
    #[error("msgincl length didnt match tipset size")]
    MessageInclusionMismatch,
    #[error("block {0} has too many messages ({1})")]
    TooManyMessages(Cid, usize),
    #[error("messages didnt match message root in header")]
    MessageRootMismatch,
    #[error("message inclusion index {0} out of range")]
    MessageIndexOutOfRange(u64),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    ChainStore(#[from] crate::chain::Error),
    #[error(transparent)]
    Blockchain(#[from] crate::blocks::Error),
    #[error(transparent)]
    TipsetValidation(#[from] TipsetValidationError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Cancellation is propagated unchanged and never logged as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Fetch(FetchError::Cancelled)
        )
    }

    /// Fatal errors abort the subsystem instead of only failing the target.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedStoreState(_) | Error::ForkAtGenesis(_)
        )
    }
}
