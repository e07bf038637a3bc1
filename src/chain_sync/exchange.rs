// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Block-range exchange RPC, consumed for bulk retrieval during large
//! catch-ups. The transport lives outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use fvm_ipld_encoding::tuple::*;
use thiserror::Error;

use crate::blocks::{Tipset, TipsetKey};
use crate::message::{SignedMessage, UnsignedMessage};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange request failed: {0}")]
    Request(String),
    #[error("exchange response was malformed: {0}")]
    Malformed(String),
}

/// Messages of a tipset in compacted form: one array per message kind, plus
/// per-block index tables naming which array entries each block includes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct CompactedMessages {
    pub bls_msgs: Vec<UnsignedMessage>,
    pub bls_msg_includes: Vec<Vec<u64>>,
    pub secp_msgs: Vec<SignedMessage>,
    pub secp_msg_includes: Vec<Vec<u64>>,
}

/// Client of the block-range exchange protocol.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Fetches up to `count` tipsets ending at `key`, in reverse-height
    /// order (`key`'s tipset first).
    async fn get_blocks(&self, key: &TipsetKey, count: usize)
        -> Result<Vec<Tipset>, ExchangeError>;

    /// Fetches the compacted messages of the given tipsets, aligned
    /// index-wise with the input.
    async fn get_chain_messages(
        &self,
        tipsets: &[Arc<Tipset>],
    ) -> Result<Vec<CompactedMessages>, ExchangeError>;
}
