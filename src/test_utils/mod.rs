// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deterministic chain construction for tests.
//!
//! [`ChainBuilder`] plays the role of the remote network in unit tests: it
//! builds chains with a fake state transition, serves exchange requests over
//! them, and can copy any of its objects into another store to emulate a
//! serving peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::blocks::{
    BeaconEntry, BlockHeader, Block, ElectionProof, FullTipset, Ticket, Tipset, TipsetKey, TxMeta,
};
use crate::chain::{self, weight};
use crate::chain_sync::exchange::{CompactedMessages, ExchangeClient, ExchangeError};
use crate::chain_sync::fetcher::{FetchError, Fetcher, PeerTracker};
use crate::clock::ChainEpochClock;
use crate::consensus::ProofVerifier;
use crate::crypto::{Signature, VRFProof};
use crate::db::MemoryDB;
use crate::message::{message_cids, signed_message_cids, SignedMessage, UnsignedMessage};
use crate::utils::cid::CidCborExt;
use crate::vm::{Interpreter, InterpreterError, Receipt};

/// Genesis timestamp used by every test chain.
pub const TEST_GENESIS_TIME: u64 = 1_234_567_890;

/// The state root the fake transition assigns to a tipset applied on
/// `parent_root`. Shared between [`FakeInterpreter`] and [`ChainBuilder`] so
/// built headers always match validation.
pub fn fake_state_transition(parent_root: &Cid, key: &TipsetKey) -> Cid {
    Cid::from_cbor_blake2b256(&(parent_root, key)).expect("fake state root is encodable")
}

/// Interpreter producing deterministic state roots and no receipts.
pub struct FakeInterpreter;

#[async_trait]
impl Interpreter for FakeInterpreter {
    async fn apply_tipset(
        &self,
        ts: &FullTipset,
        parent_state_root: &Cid,
    ) -> Result<(Cid, Vec<Receipt>), InterpreterError> {
        Ok((fake_state_transition(parent_state_root, ts.key()), Vec::new()))
    }
}

/// Proof verifier that accepts everything.
pub struct MockVerifier;

impl ProofVerifier for MockVerifier {
    fn verify_block_signature(&self, _header: &BlockHeader) -> Result<(), String> {
        Ok(())
    }
    fn verify_election_proof(
        &self,
        _header: &BlockHeader,
        _beacon_base: &BeaconEntry,
    ) -> Result<(), String> {
        Ok(())
    }
    fn verify_ticket(
        &self,
        _header: &BlockHeader,
        _beacon_base: &BeaconEntry,
    ) -> Result<(), String> {
        Ok(())
    }
    fn verify_beacon_entries(
        &self,
        _prev: &BeaconEntry,
        _entries: &[BeaconEntry],
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Fixed candidate peer list.
pub struct FakePeerTracker {
    peers: Vec<PeerId>,
}

impl FakePeerTracker {
    pub fn new(peers: Vec<PeerId>) -> Self {
        Self { peers }
    }
}

impl PeerTracker for FakePeerTracker {
    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }
}

/// Builds deterministic chains rooted at a fixed genesis.
pub struct ChainBuilder {
    db: Arc<MemoryDB>,
    clock: ChainEpochClock,
    genesis: Arc<Tipset>,
    tipsets: Mutex<HashMap<TipsetKey, Arc<FullTipset>>>,
    /// Per tipset: (state root after applying it, receipts root it produced).
    state: Mutex<HashMap<TipsetKey, (Cid, Cid)>>,
    ticket_salt: AtomicU64,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        let db = Arc::new(MemoryDB::default());
        let clock = ChainEpochClock::new(TEST_GENESIS_TIME);

        let empty_meta =
            chain::compute_msg_meta(db.as_ref(), &[], &[]).expect("empty meta is encodable");
        let empty_receipts =
            chain::store_receipts(db.as_ref(), &[]).expect("empty receipts are encodable");
        let genesis_state = Cid::from_cbor_blake2b256(&"genesis state").unwrap();

        let genesis_header = BlockHeader::builder()
            .miner_address(Address::new_id(0))
            .ticket(Some(Ticket::new(VRFProof::new(b"genesis ticket".to_vec()))))
            .election_proof(Some(ElectionProof {
                win_count: 1,
                vrfproof: VRFProof::new(b"genesis election".to_vec()),
            }))
            .epoch(0)
            .timestamp(TEST_GENESIS_TIME)
            .state_root(genesis_state)
            .message_receipts(empty_receipts)
            .messages(empty_meta)
            .bls_aggregate(Some(Signature::new_bls(vec![1])))
            .signature(Some(Signature::new_secp256k1(vec![1])))
            .build_and_validate()
            .expect("genesis header is valid");
        chain::persist_objects(db.as_ref(), std::slice::from_ref(&genesis_header))
            .expect("persisting genesis");

        let genesis = Arc::new(Tipset::new(vec![genesis_header.clone()]).unwrap());
        let genesis_full = Arc::new(
            FullTipset::new(vec![Block {
                header: genesis_header,
                bls_messages: Vec::new(),
                secp_messages: Vec::new(),
            }])
            .unwrap(),
        );

        let mut tipsets = HashMap::new();
        tipsets.insert(genesis.key().clone(), genesis_full);
        let mut state = HashMap::new();
        // An empty genesis tipset leaves the genesis state untouched.
        state.insert(genesis.key().clone(), (genesis_state, empty_receipts));

        Self {
            db,
            clock,
            genesis,
            tipsets: Mutex::new(tipsets),
            state: Mutex::new(state),
            ticket_salt: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> Arc<MemoryDB> {
        self.db.clone()
    }

    pub fn clock(&self) -> ChainEpochClock {
        self.clock
    }

    pub fn genesis(&self) -> Arc<Tipset> {
        self.genesis.clone()
    }

    pub fn tipset(&self, key: &TipsetKey) -> Option<Arc<FullTipset>> {
        self.tipsets.lock().get(key).cloned()
    }

    /// State root after applying the given tipset.
    pub fn state_after(&self, key: &TipsetKey) -> Option<Cid> {
        self.state.lock().get(key).map(|(s, _)| *s)
    }

    pub fn new_signed_message(&self, from: u64, sequence: u64) -> SignedMessage {
        SignedMessage::new(
            self.new_unsigned_message(from, sequence),
            Signature::new_secp256k1(vec![from as u8, sequence as u8, 1]),
        )
    }

    pub fn new_unsigned_message(&self, from: u64, sequence: u64) -> UnsignedMessage {
        UnsignedMessage {
            from: Address::new_id(from),
            to: Address::new_id(1),
            sequence,
            value: 1.into(),
            gas_limit: 1000,
            gas_fee_cap: 1.into(),
            gas_premium: 1.into(),
            method: 0,
            params: Vec::new(),
        }
    }

    /// Builds one tipset of `num_blocks` sibling blocks on `parent`, each
    /// block carrying `msgs_per_block` messages of both kinds.
    pub fn build_on(
        &self,
        parent: &Tipset,
        num_blocks: usize,
        msgs_per_block: usize,
    ) -> Arc<Tipset> {
        let (parent_state, parent_receipts) = *self
            .state
            .lock()
            .get(parent.key())
            .expect("parent was built by this builder");
        let epoch = parent.epoch() + 1;
        let parent_weight = weight(parent);

        let mut blocks = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            let salt = self.ticket_salt.fetch_add(1, Ordering::Relaxed);
            let bls_messages: Vec<_> = (0..msgs_per_block)
                .map(|s| self.new_unsigned_message(200 + i as u64, salt + s as u64))
                .collect();
            let secp_messages: Vec<_> = (0..msgs_per_block)
                .map(|s| self.new_signed_message(100 + i as u64, salt + s as u64))
                .collect();

            chain::persist_objects(self.db.as_ref(), &bls_messages).unwrap();
            chain::persist_objects(self.db.as_ref(), &secp_messages).unwrap();
            let bls_cids = message_cids(&bls_messages).unwrap();
            let secp_cids = signed_message_cids(&secp_messages).unwrap();
            let meta = chain::compute_msg_meta(self.db.as_ref(), &bls_cids, &secp_cids).unwrap();

            // Globally unique miner ids keep sibling unions valid tipsets.
            let header = BlockHeader::builder()
                .miner_address(Address::new_id(1000 + salt))
                .ticket(Some(Ticket::new(VRFProof::new(
                    format!("===={salt}=====").into_bytes(),
                ))))
                .election_proof(Some(ElectionProof {
                    win_count: 1,
                    vrfproof: VRFProof::new(format!("election{salt}").into_bytes()),
                }))
                .parents(parent.key().clone())
                .weight(parent_weight.clone())
                .epoch(epoch)
                .state_root(parent_state)
                .message_receipts(parent_receipts)
                .messages(meta)
                .timestamp(self.clock.timestamp_for_epoch(epoch))
                .bls_aggregate(Some(Signature::new_bls(vec![salt as u8])))
                .signature(Some(Signature::new_secp256k1(vec![salt as u8])))
                .build_and_validate()
                .unwrap();
            chain::persist_objects(self.db.as_ref(), std::slice::from_ref(&header)).unwrap();

            blocks.push(Block {
                header,
                bls_messages,
                secp_messages,
            });
        }

        let full = Arc::new(FullTipset::new(blocks).unwrap());
        let ts = Arc::new(full.to_tipset().unwrap());

        let state_after = fake_state_transition(&parent_state, ts.key());
        let receipts_after = chain::store_receipts(self.db.as_ref(), &[]).unwrap();
        self.state
            .lock()
            .insert(ts.key().clone(), (state_after, receipts_after));
        self.tipsets.lock().insert(ts.key().clone(), full);
        ts
    }

    /// Builds a chain of `count` single-block tipsets on `parent`, returning
    /// the new head.
    pub fn build_many_on(
        &self,
        count: usize,
        parent: &Tipset,
        msgs_per_block: usize,
    ) -> Arc<Tipset> {
        let mut head = Arc::new(parent.clone());
        for _ in 0..count {
            head = self.build_on(&head, 1, msgs_per_block);
        }
        head
    }

    /// The chain from `head` back to genesis, head first.
    pub fn chain_from(&self, head: &Tipset) -> Vec<Arc<Tipset>> {
        let mut out = Vec::new();
        let mut cursor = Arc::new(head.clone());
        loop {
            out.push(cursor.clone());
            if cursor.parents().is_empty() {
                return out;
            }
            let parent = self
                .tipset(cursor.parents())
                .expect("chain was built by this builder");
            cursor = Arc::new(parent.to_tipset().unwrap());
        }
    }

    /// Copies the objects of the tipset at `key` into `dest`: headers and,
    /// when requested, message metas, AMT nodes and message bodies.
    pub fn copy_tipset_objects(
        &self,
        key: &TipsetKey,
        dest: &MemoryDB,
        with_messages: bool,
    ) -> anyhow::Result<()> {
        for cid in key.cids() {
            self.copy_object(cid, dest)?;
            if with_messages {
                self.copy_message_tree(cid, dest)?;
            }
        }
        Ok(())
    }

    /// Copies the message meta, AMT roots and message bodies referenced by a
    /// block header into `dest`.
    pub fn copy_message_tree(&self, block_cid: &Cid, dest: &MemoryDB) -> anyhow::Result<()> {
        use fvm_ipld_encoding::CborStore;
        let header: BlockHeader = self
            .db
            .get_cbor(block_cid)?
            .ok_or_else(|| anyhow::anyhow!("unknown block {block_cid}"))?;
        self.copy_object(header.messages(), dest)?;
        let meta: TxMeta = self
            .db
            .get_cbor(header.messages())?
            .ok_or_else(|| anyhow::anyhow!("unknown message meta"))?;
        self.copy_object(&meta.bls_message_root, dest)?;
        self.copy_object(&meta.secp_message_root, dest)?;
        for root in [&meta.bls_message_root, &meta.secp_message_root] {
            for cid in chain::read_amt_cids(self.db.as_ref(), root)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?
            {
                self.copy_object(&cid, dest)?;
            }
        }
        Ok(())
    }

    pub fn copy_object(&self, cid: &Cid, dest: &MemoryDB) -> anyhow::Result<()> {
        if let Some(bytes) = self.db.get(cid)? {
            dest.put_keyed(cid, &bytes)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for ChainBuilder {
    async fn get_blocks(
        &self,
        key: &TipsetKey,
        count: usize,
    ) -> Result<Vec<Tipset>, ExchangeError> {
        let mut out = Vec::new();
        let mut cursor = key.clone();
        while out.len() < count {
            let full = self
                .tipset(&cursor)
                .ok_or_else(|| ExchangeError::Request(format!("unknown tipset {cursor}")))?;
            let ts = full
                .to_tipset()
                .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
            cursor = ts.parents().clone();
            let at_genesis = cursor.is_empty();
            out.push(ts);
            if at_genesis {
                break;
            }
        }
        Ok(out)
    }

    async fn get_chain_messages(
        &self,
        tipsets: &[Arc<Tipset>],
    ) -> Result<Vec<CompactedMessages>, ExchangeError> {
        tipsets
            .iter()
            .map(|ts| {
                let full = self
                    .tipset(ts.key())
                    .ok_or_else(|| ExchangeError::Request(format!("unknown tipset {}", ts.key())))?;
                let mut compacted = CompactedMessages::default();
                for block in full.blocks() {
                    let bls_start = compacted.bls_msgs.len() as u64;
                    compacted.bls_msgs.extend_from_slice(block.bls_msgs());
                    compacted
                        .bls_msg_includes
                        .push((bls_start..compacted.bls_msgs.len() as u64).collect());

                    let secp_start = compacted.secp_msgs.len() as u64;
                    compacted.secp_msgs.extend_from_slice(block.secp_msgs());
                    compacted
                        .secp_msg_includes
                        .push((secp_start..compacted.secp_msgs.len() as u64).collect());
                }
                Ok(compacted)
            })
            .collect()
    }
}

/// Fetcher that serves straight out of a [`ChainBuilder`], copying objects
/// into the destination store the way a graph exchange transport would.
pub struct FakeFetcher {
    builder: Arc<ChainBuilder>,
    dest: Arc<MemoryDB>,
}

impl FakeFetcher {
    pub fn new(builder: Arc<ChainBuilder>, dest: Arc<MemoryDB>) -> Self {
        Self { builder, dest }
    }

    fn fetch_inner(
        &self,
        key: &TipsetKey,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
        with_messages: bool,
    ) -> Result<Vec<Tipset>, FetchError> {
        let mut out = Vec::new();
        let mut cursor = key.clone();
        loop {
            let full = self
                .builder
                .tipset(&cursor)
                .ok_or(FetchError::ExhaustedPeers(cursor.clone()))?;
            self.builder
                .copy_tipset_objects(&cursor, self.dest.as_ref(), with_messages)
                .map_err(|e| FetchError::InvalidBlock {
                    cid: cursor.cids()[0],
                    reason: e.to_string(),
                })?;
            let ts = full.to_tipset()?;
            cursor = ts.parents().clone();
            let finished = done(&ts) || cursor.is_empty();
            out.push(ts);
            if finished {
                return Ok(out);
            }
        }
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch_tipsets(
        &self,
        _cancel: &CancellationToken,
        key: &TipsetKey,
        _origin: PeerId,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
    ) -> Result<Vec<Tipset>, FetchError> {
        self.fetch_inner(key, done, true)
    }

    async fn fetch_tipset_headers(
        &self,
        _cancel: &CancellationToken,
        key: &TipsetKey,
        _origin: PeerId,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
    ) -> Result<Vec<Tipset>, FetchError> {
        self.fetch_inner(key, done, false)
    }
}
