// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::DAG_CBOR;
use multihash_codetable::{Code, MultihashDigest};

/// Extension methods for constructing content identifiers of serializable
/// objects.
pub trait CidCborExt {
    /// Returns the CID of the DAG-CBOR encoding of `obj`, hashed with
    /// Blake2b-256.
    fn from_cbor_blake2b256<S: serde::ser::Serialize>(
        obj: &S,
    ) -> Result<Cid, fvm_ipld_encoding::Error>;
}

impl CidCborExt for Cid {
    fn from_cbor_blake2b256<S: serde::ser::Serialize>(
        obj: &S,
    ) -> Result<Cid, fvm_ipld_encoding::Error> {
        let bytes = fvm_ipld_encoding::to_vec(obj)?;
        Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_equal_objects() {
        let a = Cid::from_cbor_blake2b256(&(1u64, "x")).unwrap();
        let b = Cid::from_cbor_blake2b256(&(1u64, "x")).unwrap();
        let c = Cid::from_cbor_blake2b256(&(2u64, "x")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
