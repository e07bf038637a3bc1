// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;

/// The result of a round of the randomness beacon, carried in block headers
/// so the chain commits to the beacon history it used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct BeaconEntry {
    round: u64,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl BeaconEntry {
    pub fn new(round: u64, data: Vec<u8>) -> Self {
        Self { round, data }
    }

    /// Round of the beacon this entry was produced in.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Signed randomness of the round.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
