// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;

use super::BlockHeader;
use crate::message::{SignedMessage, UnsignedMessage};

/// A block header together with the full message lists it commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub bls_messages: Vec<UnsignedMessage>,
    pub secp_messages: Vec<SignedMessage>,
}

impl Block {
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn into_header(self) -> BlockHeader {
        self.header
    }

    pub fn bls_msgs(&self) -> &[UnsignedMessage] {
        &self.bls_messages
    }

    pub fn secp_msgs(&self) -> &[SignedMessage] {
        &self.secp_messages
    }

    pub fn cid(&self) -> &Cid {
        self.header.cid()
    }
}

/// Links the two per-block message list roots; the object the header's
/// messages CID points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct TxMeta {
    pub bls_message_root: Cid,
    pub secp_message_root: Cid,
}
