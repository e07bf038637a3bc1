// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod chain_store;
mod errors;
mod tip_index;

pub use chain_store::{ChainStore, HEAD_KEY};
pub use errors::Error;
pub use tip_index::{TipIndex, TipsetMetadata};
