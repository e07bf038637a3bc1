// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Tipset contained no blocks.
    #[error("No blocks for tipset")]
    NoBlocks,
    /// Blocks passed to the tipset constructor were inconsistent.
    #[error("Invalid tipset: {0}")]
    InvalidTipset(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    /// Error originating from encoding arbitrary data.
    #[error("{0}")]
    Encoding(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Error {
        Error::Encoding(e.to_string())
    }
}
