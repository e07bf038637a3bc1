// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Compact miner and account addresses.
//!
//! Addresses are CBOR-encoded as a single byte string: one protocol byte
//! followed by the protocol-specific payload.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Payload length of a secp256k1 key-hash address.
pub const PAYLOAD_HASH_LEN: usize = 20;
/// Payload length of a BLS public-key address.
pub const BLS_PUB_LEN: usize = 48;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown address protocol {0}")]
    UnknownProtocol(u8),
    #[error("invalid address payload length {0}")]
    InvalidPayload(usize),
    #[error("address bytes were empty")]
    Empty,
}

/// Address type indicator, prefixed to the payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Protocol {
    Id = 0,
    Secp256k1 = 1,
    Bls = 3,
}

impl Protocol {
    fn from_byte(b: u8) -> Result<Self, AddressError> {
        match b {
            0 => Ok(Protocol::Id),
            1 => Ok(Protocol::Secp256k1),
            3 => Ok(Protocol::Bls),
            other => Err(AddressError::UnknownProtocol(other)),
        }
    }
}

/// Identifier of an on-chain actor. ID addresses are compact references
/// assigned at actor creation; key addresses hash or embed public keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    protocol: Protocol,
    payload: Vec<u8>,
}

impl Address {
    pub fn new_id(id: u64) -> Self {
        Self {
            protocol: Protocol::Id,
            payload: id.to_be_bytes().to_vec(),
        }
    }

    pub fn new_secp256k1(key_hash: [u8; PAYLOAD_HASH_LEN]) -> Self {
        Self {
            protocol: Protocol::Secp256k1,
            payload: key_hash.to_vec(),
        }
    }

    pub fn new_bls(pub_key: &[u8; BLS_PUB_LEN]) -> Self {
        Self {
            protocol: Protocol::Bls,
            payload: pub_key.to_vec(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes the address to its wire form: protocol byte + payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bz = Vec::with_capacity(self.payload.len() + 1);
        bz.push(self.protocol as u8);
        bz.extend_from_slice(&self.payload);
        bz
    }

    pub fn from_bytes(bz: &[u8]) -> Result<Self, AddressError> {
        let (&first, payload) = bz.split_first().ok_or(AddressError::Empty)?;
        let protocol = Protocol::from_byte(first)?;
        let expected = match protocol {
            Protocol::Id => 8,
            Protocol::Secp256k1 => PAYLOAD_HASH_LEN,
            Protocol::Bls => BLS_PUB_LEN,
        };
        if payload.len() != expected {
            return Err(AddressError::InvalidPayload(payload.len()));
        }
        Ok(Self {
            protocol,
            payload: payload.to_vec(),
        })
    }

    /// Returns the actor ID for ID addresses.
    pub fn id(&self) -> Option<u64> {
        if self.protocol == Protocol::Id {
            let mut bz = [0u8; 8];
            bz.copy_from_slice(&self.payload);
            Some(u64::from_be_bytes(bz))
        } else {
            None
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::new_id(0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            // ID addresses print as their numeric form, key addresses as hex.
            Protocol::Id => write!(f, "t0{}", self.id().unwrap_or_default()),
            Protocol::Secp256k1 => write!(f, "t1{}", hex_str(&self.payload)),
            Protocol::Bls => write!(f, "t3{}", hex_str(&self.payload)),
        }
    }
}

fn hex_str(bz: &[u8]) -> String {
    bz.iter().map(|b| format!("{b:02x}")).collect()
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::Bytes::new(&self.to_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bz: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        Address::from_bytes(&bz).map_err(serde::de::Error::custom)
    }
}
