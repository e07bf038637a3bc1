// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain persistence: the store, tipset metadata, and helpers for the
//! message and receipt structures hanging off block headers.

pub mod store;
pub mod weight;

pub use store::{ChainStore, Error, TipIndex, TipsetMetadata, HEAD_KEY};
pub use weight::{weight, Weight};

use cid::Cid;
use fvm_ipld_amt::Amtv0;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::CborStore;
use multihash_codetable::Code;

use crate::blocks::{BeaconEntry, BlockHeader, Tipset, TxMeta};
use crate::message::{SignedMessage, UnsignedMessage};
use crate::vm::Receipt;

/// How many ancestors to search for the most recent beacon entry before
/// giving up.
const BEACON_LOOKBACK_TIPSETS: usize = 20;

/// Persists a batch of CBOR objects, keyed by their Blake2b-256 CIDs.
pub fn persist_objects<DB, T>(db: &DB, objects: &[T]) -> Result<(), Error>
where
    DB: Blockstore,
    T: serde::Serialize,
{
    for obj in objects {
        db.put_cbor(obj, Code::Blake2b256)
            .map_err(|e| Error::Other(e.to_string()))?;
    }
    Ok(())
}

/// Computes the message root committed to by a block header: the CID of a
/// [`TxMeta`] over the two message-CID arrays, each stored as an AMT.
pub fn compute_msg_meta<DB: Blockstore>(
    db: &DB,
    bls_cids: &[Cid],
    secp_cids: &[Cid],
) -> Result<Cid, Error> {
    let bls_root = Amtv0::new_from_iter(db, bls_cids.iter().cloned())
        .map_err(|e| Error::State(e.to_string()))?;
    let secp_root = Amtv0::new_from_iter(db, secp_cids.iter().cloned())
        .map_err(|e| Error::State(e.to_string()))?;

    let meta = TxMeta {
        bls_message_root: bls_root,
        secp_message_root: secp_root,
    };
    db.put_cbor(&meta, Code::Blake2b256)
        .map_err(|e| Error::Other(e.to_string()))
}

/// Reads the CID values of a message AMT in index order.
pub fn read_amt_cids<DB: Blockstore>(db: &DB, root: &Cid) -> Result<Vec<Cid>, Error> {
    let amt: Amtv0<Cid, _> = Amtv0::load(root, db).map_err(|e| Error::State(e.to_string()))?;
    let mut cids = Vec::new();
    amt.for_each(|_, cid| {
        cids.push(*cid);
        Ok(())
    })
    .map_err(|e| Error::State(e.to_string()))?;
    Ok(cids)
}

/// Loads the full message lists a block header commits to.
pub fn block_messages<DB: Blockstore>(
    db: &DB,
    header: &BlockHeader,
) -> Result<(Vec<UnsignedMessage>, Vec<SignedMessage>), Error> {
    let meta: TxMeta = db
        .get_cbor(header.messages())
        .map_err(|e| Error::Other(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("message meta {}", header.messages())))?;

    let bls_cids = read_amt_cids(db, &meta.bls_message_root)?;
    let secp_cids = read_amt_cids(db, &meta.secp_message_root)?;

    let bls_msgs = bls_cids
        .iter()
        .map(|c| {
            db.get_cbor(c)
                .map_err(|e| Error::Other(e.to_string()))?
                .ok_or_else(|| Error::NotFound(format!("bls message {c}")))
        })
        .collect::<Result<Vec<UnsignedMessage>, Error>>()?;
    let secp_msgs = secp_cids
        .iter()
        .map(|c| {
            db.get_cbor(c)
                .map_err(|e| Error::Other(e.to_string()))?
                .ok_or_else(|| Error::NotFound(format!("secp message {c}")))
        })
        .collect::<Result<Vec<SignedMessage>, Error>>()?;

    Ok((bls_msgs, secp_msgs))
}

/// Persists receipts as an AMT and returns its root.
pub fn store_receipts<DB: Blockstore>(db: &DB, receipts: &[Receipt]) -> Result<Cid, Error> {
    Amtv0::new_from_iter(db, receipts.iter().cloned()).map_err(|e| Error::State(e.to_string()))
}

/// Finds the most recent beacon entry at or before `ts`, walking back
/// through ancestors. Reaching genesis yields the zero entry.
pub fn latest_beacon_entry<DB: Blockstore>(db: &DB, ts: &Tipset) -> Result<BeaconEntry, Error> {
    let mut cursor = ts.clone();
    for _ in 0..BEACON_LOOKBACK_TIPSETS {
        if let Some(entry) = cursor.blocks()[0].beacon_entries().last() {
            return Ok(entry.clone());
        }
        if cursor.parents().is_empty() {
            return Ok(BeaconEntry::default());
        }
        let headers = cursor
            .parents()
            .cids()
            .iter()
            .map(|c| {
                db.get_cbor(c)
                    .map_err(|e| Error::Other(e.to_string()))?
                    .ok_or_else(|| Error::NotFound(format!("block header {c}")))
            })
            .collect::<Result<Vec<BlockHeader>, Error>>()?;
        cursor = Tipset::new(headers)?;
    }
    Err(Error::Other(format!(
        "no beacon entry in the {BEACON_LOOKBACK_TIPSETS} tipsets behind {}",
        ts.key()
    )))
}
