// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Signature and VRF data types.
//!
//! These are carriers only. Actual key operations (BLS aggregation, VRF
//! evaluation, secp recovery) live outside this crate and are reached
//! through the [`crate::consensus::ProofVerifier`] seam.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignatureType {
    Secp256k1 = 1,
    Bls = 2,
}

/// An opaque signature: the signature type prefixed to the raw bytes on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub sig_type: SignatureType,
    pub bytes: Vec<u8>,
}

impl Signature {
    pub fn new_secp256k1(bytes: Vec<u8>) -> Self {
        Self {
            sig_type: SignatureType::Secp256k1,
            bytes,
        }
    }

    pub fn new_bls(bytes: Vec<u8>) -> Self {
        Self {
            sig_type: SignatureType::Bls,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut bz = Vec::with_capacity(self.bytes.len() + 1);
        bz.push(self.sig_type as u8);
        bz.extend_from_slice(&self.bytes);
        serde_bytes::Bytes::new(&bz).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bz: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        let (&first, rest) = bz
            .split_first()
            .ok_or_else(|| serde::de::Error::custom("signature bytes were empty"))?;
        let sig_type = match first {
            1 => SignatureType::Secp256k1,
            2 => SignatureType::Bls,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unknown signature type {other}"
                )))
            }
        };
        Ok(Signature {
            sig_type,
            bytes: rest.to_vec(),
        })
    }
}

/// The output of a verifiable random function evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VRFProof(pub Vec<u8>);

impl VRFProof {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for VRFProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for VRFProof {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VRFProof {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bz: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(VRFProof(bz.into_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_encoding::{from_slice, to_vec};

    #[test]
    fn signature_round_trip() {
        let sig = Signature::new_bls(vec![1, 2, 3]);
        let bz = to_vec(&sig).unwrap();
        assert_eq!(from_slice::<Signature>(&bz).unwrap(), sig);
    }

    #[test]
    fn vrf_proof_ordering_is_bytewise() {
        assert!(VRFProof::new(vec![0, 1]) < VRFProof::new(vec![0, 2]));
        assert!(VRFProof::new(vec![1]) < VRFProof::new(vec![1, 0]));
    }
}
