// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;

use crate::crypto::VRFProof;

/// Proof that a miner won one or more elections in an epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ElectionProof {
    /// Number of reward units won in this round.
    pub win_count: i64,
    /// The miner's VRF evaluation over the election randomness.
    pub vrfproof: VRFProof,
}
