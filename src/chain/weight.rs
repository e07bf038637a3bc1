// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use num_bigint::BigInt;
use num_integer::Integer;

use crate::blocks::Tipset;

pub type Weight = BigInt;

// Constants for weight calculation
/// The ratio of weight contributed by short-term vs long-term factors in a
/// given round.
const W_RATIO_NUM: u64 = 1;
const W_RATIO_DEN: u64 = 2;
/// Expected number of blocks per epoch.
const BLOCKS_PER_EPOCH: u64 = 5;
/// Fixed-point base contribution of one epoch.
const W_EPOCH_BASE: u64 = 1;

/// Returns the weight of the chain up to and including `ts`.
///
/// Each epoch adds a fixed base term plus a share proportional to the blocks
/// the tipset includes, in the same 2^8 fixed-point form the consensus
/// protocol mandates. Strictly monotonic in the chain length, so the
/// heaviest-chain rule always makes progress.
pub fn weight(ts: &Tipset) -> Weight {
    let mut out = ts.weight().clone();
    out += BigInt::from(W_EPOCH_BASE) << 8;

    let mut election_weight: BigInt = BigInt::from(W_EPOCH_BASE * W_RATIO_NUM) << 8;
    election_weight *= ts.len();
    out += election_weight.div_floor(&BigInt::from(BLOCKS_PER_EPOCH * W_RATIO_DEN));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::blocks::{BlockHeader, Ticket};
    use crate::crypto::VRFProof;

    fn tipset(parent_weight: u64, blocks: u64) -> Tipset {
        let headers = (0..blocks)
            .map(|i| {
                BlockHeader::builder()
                    .miner_address(Address::new_id(i))
                    .ticket(Some(Ticket::new(VRFProof::new(vec![i as u8]))))
                    .weight(BigInt::from(parent_weight))
                    .build_and_validate()
                    .unwrap()
            })
            .collect();
        Tipset::new(headers).unwrap()
    }

    #[test]
    fn weight_grows_with_chain_length() {
        let ts = tipset(0, 1);
        assert!(weight(&ts) > *ts.weight());
    }

    #[test]
    fn more_blocks_weigh_more() {
        assert!(weight(&tipset(100, 3)) > weight(&tipset(100, 1)));
    }
}
