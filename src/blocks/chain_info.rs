// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use libp2p::PeerId;
use num_bigint::BigInt;

use super::TipsetKey;
use crate::clock::ChainEpoch;

/// What a peer told us about its chain head, either through the hello
/// handshake or by gossiping a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
    /// Peer that originated the information.
    pub source: PeerId,
    /// Peer that relayed it to us.
    pub sender: PeerId,
    /// Key of the claimed head tipset.
    pub head: TipsetKey,
    pub height: ChainEpoch,
    pub weight: BigInt,
}

impl ChainInfo {
    pub fn new(
        source: PeerId,
        sender: PeerId,
        head: TipsetKey,
        height: ChainEpoch,
        weight: BigInt,
    ) -> Self {
        Self {
            source,
            sender,
            head,
            height,
            weight,
        }
    }
}
