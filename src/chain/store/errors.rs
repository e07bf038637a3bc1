// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

use crate::blocks::Error as BlkErr;

/// Chain error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Tipset metadata was requested for an unknown key
    #[error("Invalid tipset: {0}")]
    UndefinedKey(String),
    /// Key not found in the database
    #[error("{0} not found")]
    NotFound(String),
    /// Error originating constructing blockchain structures
    #[error(transparent)]
    Blockchain(#[from] BlkErr),
    /// Error originating from encoding arbitrary data
    #[error("{0}")]
    Encoding(String),
    /// AMT error
    #[error("State error: {0}")]
    State(String),
    /// Other chain error
    #[error("{0}")]
    Other(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Error {
        Error::Encoding(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Error {
        Error::Other(e.to_string())
    }
}
