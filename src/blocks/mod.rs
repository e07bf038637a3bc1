// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod beacon_entries;
mod block;
mod chain_info;
mod election_proof;
mod errors;
mod gossip_block;
mod header;
mod ticket;
mod tipset;

pub use beacon_entries::BeaconEntry;
pub use block::{Block, TxMeta};
pub use chain_info::ChainInfo;
pub use election_proof::ElectionProof;
pub use errors::Error;
pub use gossip_block::GossipBlock;
pub use header::{
    BlockHeader, BlockHeaderBuilder, BLOCK_MESSAGES_FIELD_INDEX, BLOCK_PARENTS_FIELD_INDEX,
};
pub use ticket::Ticket;
pub use tipset::{FullTipset, Tipset, TipsetKey};
