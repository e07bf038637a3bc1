// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Recursive graph fetcher.
//!
//! Retrieves block headers and per-block message lists from peers through a
//! selector-driven graph exchange protocol, falling back through untried
//! peers and recovering partial progress at the last complete tipset.


use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::CborStore;
use libp2p::PeerId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::FORK_LENGTH_THRESHOLD;
use crate::blocks::{
    BlockHeader, Tipset, TipsetKey, TxMeta, BLOCK_MESSAGES_FIELD_INDEX, BLOCK_PARENTS_FIELD_INDEX,
};
use crate::chain;
use crate::consensus::{
    BlockSyntaxValidator, MessageSyntaxValidator, WrappedSyntaxValidator,
};
use crate::message::{SignedMessage, UnsignedMessage};

/// Extension tag carried by every chain-sync graph request. Serving peers
/// validate only requests bearing it.
pub const CHAINSYNC_PROTOCOL_EXTENSION: &str = "chainsync";

/// Depth limit when descending message AMTs.
const AMT_RECURSION_DEPTH: u64 = 10;

/// Traversal description sent with a graph exchange request. Mirrors the
/// IPLD selector shapes the protocol defines; the transport is responsible
/// for the wire form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Match the current node without exploring further.
    Matcher,
    /// Explore every field of the current node.
    ExploreAll(Box<Selector>),
    /// Explore one field by tuple position.
    ExploreIndex { index: u64, next: Box<Selector> },
    /// Explore the fields in `[start, end)` by tuple position.
    ExploreRange {
        start: u64,
        end: u64,
        next: Box<Selector>,
    },
    /// Repeat the sequence up to `limit` levels deep.
    ExploreRecursive { limit: u64, sequence: Box<Selector> },
    /// Try each branch at the current node.
    ExploreUnion(Vec<Selector>),
    /// Jump back to the nearest enclosing `ExploreRecursive`.
    ExploreRecursiveEdge,
}

/// Descends a message meta node into both AMT roots, exploring internal
/// child pointers (index 1) and leaf values (index 2).
fn amt_selector() -> Selector {
    Selector::ExploreIndex {
        index: 2,
        next: Box::new(Selector::ExploreRecursive {
            limit: AMT_RECURSION_DEPTH,
            sequence: Box::new(Selector::ExploreUnion(vec![
                Selector::ExploreIndex {
                    index: 1,
                    next: Box::new(Selector::ExploreAll(Box::new(
                        Selector::ExploreRecursiveEdge,
                    ))),
                },
                Selector::ExploreIndex {
                    index: 2,
                    next: Box::new(Selector::ExploreAll(Box::new(Selector::Matcher))),
                },
            ])),
        }),
    }
}

/// Fetches a single block plus its message root and both message AMTs.
pub fn layer1_selector() -> Selector {
    Selector::ExploreIndex {
        index: BLOCK_MESSAGES_FIELD_INDEX,
        next: Box::new(Selector::ExploreRange {
            start: 0,
            end: 2,
            next: Box::new(amt_selector()),
        }),
    }
}

/// Header-only form of the layer-1 fetch.
pub fn headers_layer1_selector() -> Selector {
    Selector::Matcher
}

/// Walks `levels` parent links, pulling every ancestor block and its message
/// structures along the way.
pub fn recursive_selector(levels: u64) -> Selector {
    Selector::ExploreRecursive {
        limit: levels,
        sequence: Box::new(Selector::ExploreIndex {
            index: BLOCK_PARENTS_FIELD_INDEX,
            next: Box::new(Selector::ExploreUnion(vec![
                Selector::ExploreAll(Box::new(Selector::ExploreIndex {
                    index: BLOCK_MESSAGES_FIELD_INDEX,
                    next: Box::new(Selector::ExploreRange {
                        start: 0,
                        end: 2,
                        next: Box::new(amt_selector()),
                    }),
                })),
                Selector::ExploreIndex {
                    index: 0,
                    next: Box::new(Selector::ExploreRecursiveEdge),
                },
            ])),
        }),
    }
}

/// Header-only form of the recursive fetch.
pub fn recursive_headers_selector(levels: u64) -> Selector {
    Selector::ExploreRecursive {
        limit: levels,
        sequence: Box::new(Selector::ExploreIndex {
            index: BLOCK_PARENTS_FIELD_INDEX,
            next: Box::new(Selector::ExploreUnion(vec![
                Selector::ExploreAll(Box::new(Selector::Matcher)),
                Selector::ExploreIndex {
                    index: 0,
                    next: Box::new(Selector::ExploreRecursiveEdge),
                },
            ])),
        }),
    }
}

#[derive(Debug, Error)]
pub enum GraphExchangeError {
    /// The peer closed the request mid-stream. Treated exactly like a
    /// failure by the fetcher.
    #[error("peer hung up before the request completed")]
    Hangup,
    #[error("graph exchange request failed: {0}")]
    Failed(String),
}

/// The graph exchange transport. One outstanding request per call; fetched
/// blocks stream into the fetcher's store as they arrive, so partial
/// progress survives a failed request.
#[async_trait]
pub trait GraphExchange: Send + Sync {
    async fn request(
        &self,
        peer: PeerId,
        root: Cid,
        selector: Selector,
    ) -> Result<(), GraphExchangeError>;
}

/// Ranked candidate peers for sync requests, best first.
pub trait PeerTracker: Send + Sync {
    fn peers(&self) -> Vec<PeerId>;
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Stable error surface: upper layers match on this text to tell peer
    /// exhaustion from validation failure.
    #[error("fetching tipset: {0}: Unable to find any untried peers")]
    ExhaustedPeers(TipsetKey),
    #[error("invalid block {cid}: {reason}")]
    InvalidBlock { cid: Cid, reason: String },
    #[error("fetched data (cid {cid}) could not be decoded as an AMT: {reason}")]
    UndecodableAmt { cid: Cid, reason: String },
    #[error("invalid messages for message collection (cid {cid}): {reason}")]
    InvalidMessages { cid: Cid, reason: String },
    #[error("building tipset from fetched blocks failed: {0}")]
    Blocks(#[from] crate::blocks::Error),
    #[error("fetch reached the genesis tipset without satisfying its target")]
    WalkedPastGenesis,
    #[error("operation cancelled")]
    Cancelled,
}

/// Networked block fetching service for tipset chains.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches tipsets from `key` back to (and including) the first tipset
    /// satisfying `done`, returning them in traversal order, head-most
    /// first. Message structures of every returned tipset are persisted to
    /// the fetcher's store.
    async fn fetch_tipsets(
        &self,
        cancel: &CancellationToken,
        key: &TipsetKey,
        origin: PeerId,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
    ) -> Result<Vec<Tipset>, FetchError>;

    /// As [`Fetcher::fetch_tipsets`], but headers only: message bodies are
    /// neither fetched nor validated.
    async fn fetch_tipset_headers(
        &self,
        cancel: &CancellationToken,
        key: &TipsetKey,
        origin: PeerId,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
    ) -> Result<Vec<Tipset>, FetchError>;
}

/// The peers tried for one fetch call: the originating peer first, then the
/// tracker's candidates, each at most once. Validation failures are
/// remembered so exhaustion can surface the real cause.
struct PeerTrials<PT> {
    tracker: Arc<PT>,
    current: PeerId,
    tried: HashSet<PeerId>,
    recorded_invalid: Option<FetchError>,
}

impl<PT: PeerTracker> PeerTrials<PT> {
    fn new(origin: PeerId, tracker: Arc<PT>) -> Self {
        let mut tried = HashSet::new();
        tried.insert(origin);
        Self {
            tracker,
            current: origin,
            tried,
            recorded_invalid: None,
        }
    }

    fn current(&self) -> PeerId {
        self.current
    }

    fn next_peer(&mut self) -> Result<(), ()> {
        for peer in self.tracker.peers() {
            if self.tried.insert(peer) {
                trace!(%peer, "rotating fetch to fallback peer");
                self.current = peer;
                return Ok(());
            }
        }
        Err(())
    }

    fn record_invalid(&mut self, err: FetchError) {
        debug!(peer = %self.current, error = %err, "fetched object failed validation");
        self.recorded_invalid = Some(err);
    }

    /// The terminal error once no untried peers remain.
    fn exhausted_error(&mut self, key: TipsetKey) -> FetchError {
        self.recorded_invalid
            .take()
            .unwrap_or(FetchError::ExhaustedPeers(key))
    }
}

enum TipsetLoad {
    Complete(Tipset),
    /// CIDs of the blocks that are absent or were rejected, to be
    /// re-requested from the next peer.
    Incomplete(Vec<Cid>),
}

/// Fetcher over a graph exchange transport.
pub struct GraphSyncFetcher<DB, GX, PT, B, M> {
    exchange: Arc<GX>,
    store: Arc<DB>,
    validator: WrappedSyntaxValidator<B, M>,
    peer_tracker: Arc<PT>,
}

impl<DB, GX, PT, B, M> GraphSyncFetcher<DB, GX, PT, B, M>
where
    DB: Blockstore + Send + Sync,
    GX: GraphExchange,
    PT: PeerTracker,
    B: BlockSyntaxValidator,
    M: MessageSyntaxValidator,
{
    pub fn new(
        exchange: Arc<GX>,
        store: Arc<DB>,
        validator: WrappedSyntaxValidator<B, M>,
        peer_tracker: Arc<PT>,
    ) -> Self {
        Self {
            exchange,
            store,
            validator,
            peer_tracker,
        }
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        key: &TipsetKey,
        origin: PeerId,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
        headers_only: bool,
    ) -> Result<Vec<Tipset>, FetchError> {
        let mut trials = PeerTrials::new(origin, self.peer_tracker.clone());
        let starting = self
            .fetch_first_tipset(cancel, key, &mut trials, headers_only)
            .await?;
        self.fetch_remaining(cancel, starting, &mut trials, done, headers_only)
            .await
    }

    /// Fetches the target tipset itself with layer-1 requests, one per
    /// still-missing block CID, rotating peers until the tipset is complete.
    async fn fetch_first_tipset(
        &self,
        cancel: &CancellationToken,
        key: &TipsetKey,
        trials: &mut PeerTrials<PT>,
        headers_only: bool,
    ) -> Result<Tipset, FetchError> {
        let selector = if headers_only {
            headers_layer1_selector()
        } else {
            layer1_selector()
        };
        let mut remaining: Vec<Cid> = key.cids().to_vec();
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            self.issue_requests(trials.current(), &remaining, &selector)
                .await;
            match self.load_and_verify_tipset(key, headers_only, trials)? {
                TipsetLoad::Complete(ts) => return Ok(ts),
                TipsetLoad::Incomplete(missing) => {
                    remaining = missing;
                    if trials.next_peer().is_err() {
                        return Err(trials.exhausted_error(key.clone()));
                    }
                }
            }
        }
    }

    /// Walks backward from the starting tipset, issuing recursive requests
    /// anchored at the last complete tipset. Recursion depths escalate
    /// 1, 4, 16, 64 and then double, bounded by the fork window; a partial
    /// round keeps its depth and retries from the failure point with the
    /// next peer.
    async fn fetch_remaining(
        &self,
        cancel: &CancellationToken,
        starting: Tipset,
        trials: &mut PeerTrials<PT>,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
        headers_only: bool,
    ) -> Result<Vec<Tipset>, FetchError> {
        let mut out = vec![starting];
        let mut is_done = done(&out[0]);
        let mut depth: u64 = 1;

        while !is_done {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            // A graph query starts from a single block; anchor at the first
            // block of the deepest complete tipset and recurse through its
            // parent links.
            let anchor_cid = *out.last().expect("out is never empty").blocks()[0].cid();
            let selector = if headers_only {
                recursive_headers_selector(depth)
            } else {
                recursive_selector(depth)
            };
            if let Err(e) = self
                .exchange
                .request(trials.current(), anchor_cid, selector)
                .await
            {
                debug!(peer = %trials.current(), error = %e, "recursive graph request failed");
            }

            let mut incomplete_at: Option<TipsetKey> = None;
            for _ in 0..depth {
                let parent_key = out.last().expect("out is never empty").parents().clone();
                if parent_key.is_empty() {
                    return Err(FetchError::WalkedPastGenesis);
                }
                match self.load_and_verify_tipset(&parent_key, headers_only, trials)? {
                    TipsetLoad::Complete(ts) => {
                        out.push(ts);
                        if done(out.last().expect("just pushed")) {
                            is_done = true;
                            break;
                        }
                    }
                    TipsetLoad::Incomplete(_) => {
                        incomplete_at = Some(parent_key);
                        break;
                    }
                }
            }

            if let Some(key) = incomplete_at {
                if trials.next_peer().is_err() {
                    return Err(trials.exhausted_error(key));
                }
            } else if !is_done {
                depth = next_recursion_depth(depth);
            }
        }
        Ok(out)
    }

    async fn issue_requests(&self, peer: PeerId, cids: &[Cid], selector: &Selector) {
        let requests = cids.iter().map(|cid| {
            let exchange = self.exchange.clone();
            let selector = selector.clone();
            let cid = *cid;
            async move {
                if let Err(e) = exchange.request(peer, cid, selector).await {
                    debug!(%peer, %cid, error = %e, "graph request failed");
                }
            }
        });
        futures::future::join_all(requests).await;
    }

    /// Loads the tipset for `key` out of the store, syntax-validating every
    /// block and (unless headers-only) decoding and validating its message
    /// structures. Blocks that are absent or rejected come back as the
    /// incomplete set.
    fn load_and_verify_tipset(
        &self,
        key: &TipsetKey,
        headers_only: bool,
        trials: &mut PeerTrials<PT>,
    ) -> Result<TipsetLoad, FetchError> {
        let mut headers = Vec::with_capacity(key.cids().len());
        let mut incomplete = Vec::new();

        for cid in key.cids() {
            let header: BlockHeader = match self.store.get_cbor(cid) {
                Ok(Some(header)) => header,
                Ok(None) => {
                    incomplete.push(*cid);
                    continue;
                }
                Err(e) => {
                    trials.record_invalid(FetchError::InvalidBlock {
                        cid: *cid,
                        reason: e.to_string(),
                    });
                    incomplete.push(*cid);
                    continue;
                }
            };
            if let Err(e) = self.validator.block.validate_block_syntax(&header) {
                trials.record_invalid(FetchError::InvalidBlock {
                    cid: *cid,
                    reason: e.to_string(),
                });
                incomplete.push(*cid);
                continue;
            }
            if !headers_only && !self.load_block_messages(&header, trials) {
                incomplete.push(*cid);
                continue;
            }
            headers.push(header);
        }

        if incomplete.is_empty() {
            Ok(TipsetLoad::Complete(Tipset::new(headers)?))
        } else {
            Ok(TipsetLoad::Incomplete(incomplete))
        }
    }

    /// True when both message AMTs of the block are fully present, decode
    /// cleanly, and every message passes syntax validation.
    fn load_block_messages(&self, header: &BlockHeader, trials: &mut PeerTrials<PT>) -> bool {
        let store = self.store.as_ref();
        let meta_cid = header.messages();
        let meta: TxMeta = match store.get_cbor(meta_cid) {
            Ok(Some(meta)) => meta,
            Ok(None) => return false,
            Err(e) => {
                trials.record_invalid(FetchError::UndecodableAmt {
                    cid: *meta_cid,
                    reason: e.to_string(),
                });
                return false;
            }
        };

        for root in [&meta.bls_message_root, &meta.secp_message_root] {
            match store.has(root) {
                Ok(true) => {}
                _ => return false,
            }
        }

        let bls_cids = match chain::read_amt_cids(store, &meta.bls_message_root) {
            Ok(cids) => cids,
            Err(e) => {
                trials.record_invalid(FetchError::UndecodableAmt {
                    cid: meta.bls_message_root,
                    reason: e.to_string(),
                });
                return false;
            }
        };
        let secp_cids = match chain::read_amt_cids(store, &meta.secp_message_root) {
            Ok(cids) => cids,
            Err(e) => {
                trials.record_invalid(FetchError::UndecodableAmt {
                    cid: meta.secp_message_root,
                    reason: e.to_string(),
                });
                return false;
            }
        };

        for cid in &bls_cids {
            let msg: UnsignedMessage = match store.get_cbor(cid) {
                Ok(Some(msg)) => msg,
                Ok(None) => return false,
                Err(e) => {
                    trials.record_invalid(FetchError::InvalidMessages {
                        cid: *cid,
                        reason: e.to_string(),
                    });
                    return false;
                }
            };
            if let Err(e) = self.validator.message.validate_unsigned_message_syntax(&msg) {
                trials.record_invalid(FetchError::InvalidMessages {
                    cid: *meta_cid,
                    reason: e.to_string(),
                });
                return false;
            }
        }
        for cid in &secp_cids {
            let msg: SignedMessage = match store.get_cbor(cid) {
                Ok(Some(msg)) => msg,
                Ok(None) => return false,
                Err(e) => {
                    trials.record_invalid(FetchError::InvalidMessages {
                        cid: *cid,
                        reason: e.to_string(),
                    });
                    return false;
                }
            };
            if let Err(e) = self.validator.message.validate_signed_message_syntax(&msg) {
                trials.record_invalid(FetchError::InvalidMessages {
                    cid: *meta_cid,
                    reason: e.to_string(),
                });
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl<DB, GX, PT, B, M> Fetcher for GraphSyncFetcher<DB, GX, PT, B, M>
where
    DB: Blockstore + Send + Sync,
    GX: GraphExchange,
    PT: PeerTracker,
    B: BlockSyntaxValidator,
    M: MessageSyntaxValidator,
{
    async fn fetch_tipsets(
        &self,
        cancel: &CancellationToken,
        key: &TipsetKey,
        origin: PeerId,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
    ) -> Result<Vec<Tipset>, FetchError> {
        self.fetch(cancel, key, origin, done, false).await
    }

    async fn fetch_tipset_headers(
        &self,
        cancel: &CancellationToken,
        key: &TipsetKey,
        origin: PeerId,
        done: &(dyn for<'a> Fn(&'a Tipset) -> bool + Send + Sync),
    ) -> Result<Vec<Tipset>, FetchError> {
        self.fetch(cancel, key, origin, done, true).await
    }
}

/// Escalation schedule for recursive fetches.
fn next_recursion_depth(depth: u64) -> u64 {
    let next = if depth < 64 { depth * 4 } else { depth * 2 };
    next.min(FORK_LENGTH_THRESHOLD)
}
