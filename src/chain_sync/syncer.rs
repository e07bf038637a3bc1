// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The per-target sync algorithm.
//!
//! Given a proposed head, walk back to a common ancestor (resolving forks up
//! to the finality window), then stream the fetched tipsets forward through
//! validation in fixed-size segments, advancing the head as segments
//! complete. The store invariant maintained throughout: every tipset that
//! passes validation is recorded together with its state root and receipts
//! root before the head can point at it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bad_tipset_cache::BadTipsetCache;
use super::exchange::{CompactedMessages, ExchangeClient};
use super::fault_detector::ConsensusFaultDetector;
use super::manager::SyncConfig;
use super::metrics::SyncMetrics;
use super::target::TargetHandle;
use super::Error;
use crate::blocks::{Block, BlockHeader, FullTipset, Tipset, TipsetKey};
use crate::chain::{self, ChainStore, TipsetMetadata};
use crate::consensus::{ChainSelector, FullBlockValidator};
use crate::db::{MemoryDB, SettingsStore};
use crate::message::{message_cids, signed_message_cids, BLOCK_MESSAGE_LIMIT};

/// Segment length: the unit of pipelined message-fetch and validation.
pub const MAX_PROCESS_LEN: usize = 32;

/// Splits tipsets into contiguous in-order partitions of at most
/// [`MAX_PROCESS_LEN`]; their concatenation is the input.
pub fn segment_tipsets<T>(xs: &[T]) -> std::slice::Chunks<'_, T> {
    xs.chunks(MAX_PROCESS_LEN)
}

/// Updates the chain store according to the consensus rules: all tipsets
/// passing validity checks land in the store with their state roots, and the
/// head advances to the heaviest known tipset.
pub struct ChainSyncer<DB, E, FV, CS> {
    chain_store: Arc<ChainStore<DB>>,
    exchange: Arc<E>,
    bad_tipsets: Arc<BadTipsetCache>,
    full_validator: Arc<FV>,
    chain_selector: Arc<CS>,
    fault_detector: Arc<ConsensusFaultDetector>,
    config: SyncConfig,
    /// Guards head updates exclusively. Never held across network I/O.
    head_lock: tokio::sync::Mutex<()>,
    metrics: Arc<SyncMetrics>,
}

impl<DB, E, FV, CS> ChainSyncer<DB, E, FV, CS>
where
    DB: Blockstore + SettingsStore + Send + Sync + 'static,
    E: ExchangeClient + 'static,
    FV: FullBlockValidator + 'static,
    CS: ChainSelector + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_store: Arc<ChainStore<DB>>,
        exchange: Arc<E>,
        bad_tipsets: Arc<BadTipsetCache>,
        full_validator: Arc<FV>,
        chain_selector: Arc<CS>,
        fault_detector: Arc<ConsensusFaultDetector>,
        config: SyncConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            chain_store,
            exchange,
            bad_tipsets,
            full_validator,
            chain_selector,
            fault_detector,
            config,
            head_lock: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    pub fn chain_store(&self) -> &Arc<ChainStore<DB>> {
        &self.chain_store
    }

    /// Validates and syncs the chain rooted at the target's head, advancing
    /// the local head if it ends up heavier.
    pub async fn handle_new_tipset(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        target: &TargetHandle,
    ) -> Result<(), Error> {
        let proposed = target.head();
        info!(
            head = %proposed.key(),
            epoch = proposed.epoch(),
            sender = %target.sender(),
            "begin fetch and sync of chain"
        );

        if let Some(reason) = self.bad_tipsets.get(proposed.key()) {
            return Err(Error::BadTipset(reason));
        }
        let head = self.chain_store.heaviest_tipset();
        if proposed.weight() < head.weight() {
            return Err(Error::TargetWeightTooLow);
        }
        if proposed.key() == head.key() || self.chain_store.has_tipset_and_state(proposed.key()) {
            return Err(Error::AlreadySynced);
        }

        target.set_stage(super::SyncStage::Fetching);
        let tipsets = self
            .fetch_chain_blocks(cancel, &head, proposed.key().clone())
            .await?;
        debug!(
            epoch = tipsets[0].epoch(),
            key = %tipsets[0].key(),
            "header chain assembled"
        );

        target.set_stage(super::SyncStage::Validating);
        self.sync_segments(cancel, target, tipsets).await
    }

    /// Walks backward from `target_key` to the height of `known`, taking
    /// tipsets from the local store where present and filling gaps through
    /// exchange windows. Fetched headers land in a scratch store that is
    /// flushed into the main store per window. The returned chain is in
    /// chronological order.
    async fn fetch_chain_blocks(
        &self,
        cancel: &CancellationToken,
        known: &Arc<Tipset>,
        target_key: TipsetKey,
    ) -> Result<Vec<Arc<Tipset>>, Error> {
        let until_height = known.epoch();
        let mut chain: Vec<Arc<Tipset>> = Vec::new();
        let mut cursor = target_key;

        'walk: while chain.is_empty() || chain.last().expect("nonempty").epoch() > until_height {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.check_cursor_against_bad_cache(&cursor, &chain)?;

            if let Ok(ts) = self.chain_store.tipset_from_keys(&cursor) {
                cursor = ts.parents().clone();
                chain.push(ts);
                continue;
            }

            let fetched = self
                .exchange
                .get_blocks(&cursor, self.config.req_window)
                .await?;
            if fetched.is_empty() {
                break;
            }
            debug!(
                count = fetched.len(),
                from = fetched[0].epoch(),
                to = fetched[fetched.len() - 1].epoch(),
                "fetched header window"
            );

            let scratch = MemoryDB::default();
            for ts in &fetched {
                chain::persist_objects(&scratch, ts.blocks())?;
            }
            scratch
                .copy_to(self.chain_store.blockstore().as_ref())
                .map_err(|e| Error::Other(e.to_string()))?;

            for ts in fetched {
                if ts.epoch() < until_height {
                    break 'walk;
                }
                self.check_cursor_against_bad_cache(ts.key(), &chain)?;
                cursor = ts.parents().clone();
                chain.push(Arc::new(ts));
            }
        }

        if chain.is_empty() {
            return Err(Error::UnexpectedStoreState(format!(
                "no tipsets between the local head and {cursor}"
            )));
        }

        // Drop the known head itself if the walk reached it.
        if chain.last().expect("nonempty").key() == known.key() {
            chain.pop();
        }
        let base = chain.last().ok_or(Error::AlreadySynced)?.clone();

        if base.parents().is_empty() && base.key() != self.chain_store.genesis_tipset().key() {
            // The remote chain bottoms out at a different genesis. Fatal,
            // never retried.
            return Err(Error::ForkAtGenesis(base.key().to_string()));
        }

        if base.is_child_of(known) {
            // Common case: the proposed chain builds on top of our best
            // tipset.
            chain.reverse();
            return Ok(chain);
        }
        let known_parent = self
            .chain_store
            .tipset_from_keys(known.parents())
            .map_err(|e| Error::UnexpectedStoreState(e.to_string()))?;
        if base.is_child_of(&known_parent) {
            // The incoming chain is potentially part of the same tipset as
            // our best block.
            chain.reverse();
            return Ok(chain);
        }

        warn!(base = %base.key(), "fork detected, searching for a common ancestor");
        match self.sync_fork(cancel, &base, known).await {
            Ok(fork) => {
                for ts in &fork {
                    chain::persist_objects(self.chain_store.blockstore().as_ref(), ts.blocks())?;
                }
                chain.extend(fork);
                chain.reverse();
                Ok(chain)
            }
            Err(e) => {
                if matches!(e, Error::ForkTooLong) {
                    warn!("adding forked chain to the bad tipset cache");
                    self.bad_tipsets.add_chain(&chain, "fork past finality");
                }
                Err(e)
            }
        }
    }

    fn check_cursor_against_bad_cache(
        &self,
        key: &TipsetKey,
        accepted: &[Arc<Tipset>],
    ) -> Result<(), Error> {
        if let Some(reason) = self.bad_tipsets.get(key) {
            self.bad_tipsets
                .add_chain(accepted, &format!("chain contained {key}"));
            return Err(Error::BadTipset(format!("{key}: {reason}")));
        }
        Ok(())
    }

    /// Finds the tipsets between `incoming` and the point where the remote
    /// chain meets the local one, walking both sides back in lockstep by
    /// height. Fails with [`Error::ForkTooLong`] past the finality window
    /// and fatally when the chains only meet at a different genesis.
    async fn sync_fork(
        &self,
        cancel: &CancellationToken,
        incoming: &Arc<Tipset>,
        known: &Arc<Tipset>,
    ) -> Result<Vec<Arc<Tipset>>, Error> {
        let tips: Vec<Arc<Tipset>> = self
            .exchange
            .get_blocks(
                incoming.parents(),
                self.config.fork_length_threshold as usize,
            )
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();

        let genesis_block = self.chain_store.genesis_block().clone();
        let mut nts = self
            .chain_store
            .tipset_from_keys(known.parents())
            .map_err(|e| Error::UnexpectedStoreState(e.to_string()))?;

        let mut cur = 0;
        while cur < tips.len() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if nts.epoch() == 0 {
                if nts.blocks()[0] != genesis_block {
                    return Err(Error::UnexpectedStoreState(
                        "local chain does not terminate at the configured genesis".into(),
                    ));
                }
                return Err(Error::ForkAtGenesis(incoming.key().to_string()));
            }
            if nts.key() == tips[cur].key() {
                return Ok(tips[..cur].to_vec());
            }
            if nts.epoch() < tips[cur].epoch() {
                cur += 1;
            } else {
                nts = self
                    .chain_store
                    .tipset_from_keys(nts.parents())
                    .map_err(|e| Error::UnexpectedStoreState(e.to_string()))?;
            }
        }
        Err(Error::ForkTooLong)
    }

    /// Streams `tipsets` (chronological order) through validation in
    /// segments of at most [`MAX_PROCESS_LEN`]. Messages for the next
    /// segment are fetched while the current one validates; the two sides
    /// hand results through a single-capacity channel and any error aborts
    /// the pipeline.
    async fn sync_segments(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        target: &TargetHandle,
        tipsets: Vec<Arc<Tipset>>,
    ) -> Result<(), Error> {
        let first = tipsets.first().ok_or(Error::NoBlocks)?;
        let parent = self
            .chain_store
            .tipset_from_keys(first.parents())
            .map_err(|e| Error::UnexpectedStoreState(e.to_string()))?;

        let segments: Vec<Vec<Arc<Tipset>>> =
            segment_tipsets(&tipsets).map(<[_]>::to_vec).collect();
        let last_index = segments.len() - 1;

        let (result_tx, result_rx) = flume::bounded::<Result<Arc<Tipset>, Error>>(1);
        result_tx
            .send(Ok(parent))
            .expect("bounded(1) channel starts empty");

        for (i, segment) in segments.into_iter().enumerate() {
            if cancel.is_cancelled() {
                // Join the in-flight validator before surfacing.
                let _ = result_rx.recv_async().await;
                return Err(Error::Cancelled);
            }
            let from = segment[0].epoch();
            let to = segment[segment.len() - 1].epoch();
            debug!(from, to, "fetching message segment");
            let full = match self.fetch_segment_messages(&segment).await {
                Ok(full) => full,
                Err(e) => {
                    let _ = result_rx.recv_async().await;
                    return Err(e);
                }
            };

            let parent = result_rx
                .recv_async()
                .await
                .map_err(|_| Error::Other("segment pipeline channel closed".into()))??;

            let syncer = Arc::clone(self);
            let target = target.clone();
            let tx = result_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                debug!(from, to, "processing message segment");
                let result = syncer
                    .process_segment(&cancel, &target, parent, full, i == last_index)
                    .await;
                let _ = tx.send(result);
            });
        }

        // Join the trailing validator.
        result_rx
            .recv_async()
            .await
            .map_err(|_| Error::Other("segment pipeline channel closed".into()))??;
        Ok(())
    }

    /// Validates one segment in order, widens the final head candidate
    /// against known siblings, and advances the head when heavier.
    async fn process_segment(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        target: &TargetHandle,
        mut parent: Arc<Tipset>,
        segment: Vec<FullTipset>,
        is_last_segment: bool,
    ) -> Result<Arc<Tipset>, Error> {
        let started = Instant::now();
        let keys: Vec<TipsetKey> = segment.iter().map(|f| f.key().clone()).collect();

        for (i, fts) in segment.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let ts = Arc::new(fts.to_tipset()?);
            if let Err(e) = self.sync_one(&parent, &fts).await {
                // The failed tipset and everything the segment builds on it
                // are tainted. Non-consensus failures over-taint here, but a
                // node whose own data is failing has bigger problems.
                let reason = format!("chain contained {}", keys[i]);
                for key in &keys[i..] {
                    self.bad_tipsets.put(key.clone(), reason.clone());
                }
                return Err(e);
            }
            parent = ts;
            target.set_current(parent.clone());
        }

        if is_last_segment {
            match self.widen(&parent) {
                Ok(Some(widened)) => {
                    let widened = Arc::new(widened);
                    match self.try_adopt_widened(&widened).await {
                        Ok(()) => {
                            info!(key = %widened.key(), "widened head candidate with known siblings");
                            parent = widened;
                            target.set_current(parent.clone());
                        }
                        Err(e) => {
                            warn!(error = %e, "validating widened tipset failed, keeping narrow head")
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "widening head candidate failed"),
            }
        }

        if parent.key() != &self.config.checkpoint {
            self.set_head(&parent).await?;
        }
        self.metrics
            .tipset_processing_time
            .observe(started.elapsed().as_secs_f64());
        Ok(parent)
    }

    /// Validates a single tipset against its parent and records its state
    /// and receipts roots. The caller serializes invocations per target.
    async fn sync_one(&self, parent: &Arc<Tipset>, next: &FullTipset) -> Result<(), Error> {
        let head = self.chain_store.heaviest_tipset();
        if next.key() == head.key() {
            // Been here before.
            return Ok(());
        }
        let started = Instant::now();

        let parent_state_root = self
            .chain_store
            .tipset_state_root(parent.key())
            .map_err(|e| Error::UnexpectedStoreState(e.to_string()))?;

        if parent.key() != &self.config.checkpoint {
            let parent_weight = self.chain_selector.weight(parent)?;
            let parent_receipts_root = self
                .chain_store
                .tipset_receipts_root(parent.key())
                .map_err(|e| Error::UnexpectedStoreState(e.to_string()))?;
            self.full_validator
                .validate_mining(parent, next, &parent_weight, &parent_receipts_root)
                .await?;
        }

        let (state_root, receipts) = self
            .full_validator
            .run_state_transition(next, &parent_state_root)
            .await?;

        for block in next.blocks() {
            self.fault_detector.check_block(block.header(), parent);
        }

        let receipts_root = chain::store_receipts(self.chain_store.blockstore().as_ref(), &receipts)?;
        self.chain_store.put_tipset_metadata(TipsetMetadata {
            tipset: Arc::new(next.to_tipset()?),
            tipset_state_root: state_root,
            tipset_receipts_root: receipts_root,
        })?;

        info!(
            epoch = next.epoch(),
            blocks = next.blocks().len(),
            state = %state_root,
            "processed tipset"
        );
        self.metrics
            .sync_one_duration
            .observe(started.elapsed().as_millis() as f64);
        Ok(())
    }

    /// Computes the union of `ts` with the largest validated sibling set
    /// sharing its parents and epoch, deduplicated by block CID. Returns
    /// `None` unless the union differs from both inputs.
    fn widen(&self, ts: &Arc<Tipset>) -> Result<Option<Tipset>, Error> {
        if !self.chain_store.has_sibling_state(ts) {
            return Ok(None);
        }
        let candidates = self.chain_store.sibling_state(ts);
        let max = match candidates.iter().map(|m| &m.tipset).max_by_key(|t| t.len()) {
            Some(max) => max.clone(),
            None => return Ok(None),
        };

        let mut headers: Vec<BlockHeader> = ts.blocks().to_vec();
        let mut seen: HashSet<Cid> = ts.cids().iter().copied().collect();
        for header in max.blocks() {
            if seen.insert(*header.cid()) {
                headers.push(header.clone());
            }
        }
        let widened = Tipset::new(headers)?;
        if widened.key() == ts.key() || widened.key() == max.key() {
            return Ok(None);
        }
        Ok(Some(widened))
    }

    /// Runs the widened tipset through full validation so it carries its
    /// own metadata before becoming a head candidate.
    async fn try_adopt_widened(&self, widened: &Arc<Tipset>) -> Result<(), Error> {
        let base = self
            .chain_store
            .tipset_from_keys(widened.parents())
            .map_err(|e| Error::UnexpectedStoreState(e.to_string()))?;
        let full = self.load_full_tipset(widened)?;
        self.sync_one(&base, &full).await
    }

    /// Moves the head to `ts` if it is heavier, under the head lock.
    pub async fn set_head(&self, ts: &Arc<Tipset>) -> Result<(), Error> {
        let _guard = self.head_lock.lock().await;
        let head = self.chain_store.heaviest_tipset();
        if ts.key() == head.key() {
            return Ok(());
        }
        if !self.chain_selector.is_heavier(ts, &head)? {
            return Ok(());
        }
        if !ts.is_child_of(&head) {
            self.metrics.reorg_count.inc();
            info!(from = %head.key(), to = %ts.key(), "reorg: head moved off the previous chain");
        }
        self.chain_store.set_head(ts.clone())?;
        Ok(())
    }

    /// Produces full tipsets for one segment: local message loads first,
    /// then one exchange call for the contiguous remainder, zipped and
    /// flushed through a scratch store.
    async fn fetch_segment_messages(
        &self,
        segment: &[Arc<Tipset>],
    ) -> Result<Vec<FullTipset>, Error> {
        let mut full = Vec::with_capacity(segment.len());
        for (i, ts) in segment.iter().enumerate() {
            match self.load_full_tipset(ts) {
                Ok(fts) => full.push(fts),
                Err(_) => {
                    let left = &segment[i..];
                    let messages = self.exchange.get_chain_messages(left).await?;
                    if messages.len() != left.len() {
                        return Err(Error::Exchange(super::exchange::ExchangeError::Malformed(
                            format!(
                                "requested messages for {} tipsets, got {}",
                                left.len(),
                                messages.len()
                            ),
                        )));
                    }

                    let scratch = MemoryDB::default();
                    for (ts, compacted) in left.iter().zip(&messages) {
                        full.push(zip_tipset_and_messages(&scratch, ts, compacted)?);
                        chain::persist_objects(&scratch, &compacted.bls_msgs)?;
                        chain::persist_objects(&scratch, &compacted.secp_msgs)?;
                    }
                    scratch
                        .copy_to(self.chain_store.blockstore().as_ref())
                        .map_err(|e| Error::Other(e.to_string()))?;
                    break;
                }
            }
        }
        Ok(full)
    }

    /// Reconstructs a full tipset from locally stored messages.
    fn load_full_tipset(&self, ts: &Tipset) -> Result<FullTipset, Error> {
        let mut blocks = Vec::with_capacity(ts.len());
        for header in ts.blocks() {
            let (bls_messages, secp_messages) =
                chain::block_messages(self.chain_store.blockstore().as_ref(), header)?;
            blocks.push(Block {
                header: header.clone(),
                bls_messages,
                secp_messages,
            });
        }
        Ok(FullTipset::new(blocks)?)
    }
}

/// Reassembles full blocks from compacted message arrays and their
/// per-block inclusion tables, verifying each block's declared message root
/// along the way.
pub fn zip_tipset_and_messages<DB: Blockstore>(
    store: &DB,
    ts: &Tipset,
    compacted: &CompactedMessages,
) -> Result<FullTipset, Error> {
    if ts.len() != compacted.bls_msg_includes.len() || ts.len() != compacted.secp_msg_includes.len()
    {
        return Err(Error::MessageInclusionMismatch);
    }

    let mut blocks = Vec::with_capacity(ts.len());
    for (i, header) in ts.blocks().iter().enumerate() {
        let bls_includes = &compacted.bls_msg_includes[i];
        let secp_includes = &compacted.secp_msg_includes[i];

        let total = bls_includes.len() + secp_includes.len();
        if total > BLOCK_MESSAGE_LIMIT {
            return Err(Error::TooManyMessages(*header.cid(), total));
        }

        let bls_messages = bls_includes
            .iter()
            .map(|&idx| {
                compacted
                    .bls_msgs
                    .get(idx as usize)
                    .cloned()
                    .ok_or(Error::MessageIndexOutOfRange(idx))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let secp_messages = secp_includes
            .iter()
            .map(|&idx| {
                compacted
                    .secp_msgs
                    .get(idx as usize)
                    .cloned()
                    .ok_or(Error::MessageIndexOutOfRange(idx))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let bls_cids =
            message_cids(&bls_messages).map_err(|e| Error::Other(e.to_string()))?;
        let secp_cids =
            signed_message_cids(&secp_messages).map_err(|e| Error::Other(e.to_string()))?;
        let computed_root = chain::compute_msg_meta(store, &bls_cids, &secp_cids)?;
        if &computed_root != header.messages() {
            return Err(Error::MessageRootMismatch);
        }

        blocks.push(Block {
            header: header.clone(),
            bls_messages,
            secp_messages,
        });
    }

    Ok(FullTipset::new(blocks)?)
}

#[cfg(test)]
mod tests {
    use libp2p::PeerId;
    use num_bigint::BigInt;

    use super::*;
    use crate::chain_sync::fault_detector::ConsensusFault;
    use crate::consensus::{ExpectedConsensus, HeaviestSelector};
    use crate::crypto::{Signature, VRFProof};
    use crate::test_utils::{ChainBuilder, FakeInterpreter, MockVerifier};

    type TestSyncer = ChainSyncer<
        MemoryDB,
        ChainBuilder,
        ExpectedConsensus<MemoryDB, FakeInterpreter, MockVerifier>,
        HeaviestSelector,
    >;

    struct Setup {
        builder: Arc<ChainBuilder>,
        syncer: Arc<TestSyncer>,
        faults: flume::Receiver<ConsensusFault>,
        cancel: CancellationToken,
    }

    fn setup_with_config(config: SyncConfig) -> Setup {
        let builder = Arc::new(ChainBuilder::new());
        let db = Arc::new(MemoryDB::default());
        let store = Arc::new(
            ChainStore::new(db, builder.genesis().blocks()[0].clone()).unwrap(),
        );
        let validator = Arc::new(ExpectedConsensus::new(
            store.clone(),
            FakeInterpreter,
            MockVerifier,
            builder.clock(),
        ));
        let (fault_tx, faults) = flume::unbounded();
        let fault_detector = Arc::new(ConsensusFaultDetector::new(
            fault_tx,
            crate::chain_sync::FORK_LENGTH_THRESHOLD as i64,
        ));
        let syncer = Arc::new(ChainSyncer::new(
            store,
            builder.clone(),
            Arc::new(BadTipsetCache::default()),
            validator,
            Arc::new(HeaviestSelector),
            fault_detector,
            config,
            Arc::new(SyncMetrics::unregistered()),
        ));
        Setup {
            builder,
            syncer,
            faults,
            cancel: CancellationToken::new(),
        }
    }

    fn setup() -> Setup {
        setup_with_config(SyncConfig::default())
    }

    fn target_for(ts: &Arc<Tipset>) -> TargetHandle {
        TargetHandle::new(ts.clone(), PeerId::random())
    }

    #[tokio::test]
    async fn happy_path_advances_head_and_records_roots() {
        let s = setup();
        let gen = s.builder.genesis();
        let final_ts = s.builder.build_on(&gen, 3, 1);

        let target = target_for(&final_ts);
        s.syncer
            .handle_new_tipset(&s.cancel, &target)
            .await
            .expect("sync succeeds");

        let store = s.syncer.chain_store();
        assert_eq!(store.heaviest_tipset().key(), final_ts.key());
        // Roots are retrievable for every validated tipset.
        assert!(store.tipset_state_root(final_ts.key()).is_ok());
        assert!(store.tipset_receipts_root(final_ts.key()).is_ok());
        assert_eq!(target.current().unwrap().key(), final_ts.key());
    }

    #[tokio::test]
    async fn pipeline_syncs_chains_longer_than_one_segment() {
        let s = setup();
        let gen = s.builder.genesis();
        let final_ts = s.builder.build_many_on(2 * MAX_PROCESS_LEN + 5, &gen, 0);

        let target = target_for(&final_ts);
        s.syncer
            .handle_new_tipset(&s.cancel, &target)
            .await
            .expect("sync succeeds");

        let store = s.syncer.chain_store();
        assert_eq!(store.heaviest_tipset().key(), final_ts.key());
        assert_eq!(
            store.heaviest_tipset().epoch(),
            (2 * MAX_PROCESS_LEN + 5) as i64
        );
    }

    #[tokio::test]
    async fn lighter_targets_are_rejected_without_head_movement() {
        let s = setup();
        let gen = s.builder.genesis();
        let long = s.builder.build_many_on(4, &gen, 0);
        let short = s.builder.build_on(&gen, 1, 0);

        s.syncer
            .handle_new_tipset(&s.cancel, &target_for(&long))
            .await
            .unwrap();
        let head = s.syncer.chain_store().heaviest_tipset();

        let err = s
            .syncer
            .handle_new_tipset(&s.cancel, &target_for(&short))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetWeightTooLow));
        assert_eq!(s.syncer.chain_store().heaviest_tipset().key(), head.key());
    }

    #[tokio::test]
    async fn known_targets_are_rejected() {
        let s = setup();
        let gen = s.builder.genesis();
        let final_ts = s.builder.build_on(&gen, 1, 0);

        s.syncer
            .handle_new_tipset(&s.cancel, &target_for(&final_ts))
            .await
            .unwrap();
        let err = s
            .syncer
            .handle_new_tipset(&s.cancel, &target_for(&final_ts))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySynced));
    }

    #[tokio::test]
    async fn bad_cached_targets_are_rejected() {
        let s = setup();
        let gen = s.builder.genesis();
        let final_ts = s.builder.build_on(&gen, 1, 0);
        s.syncer
            .bad_tipsets
            .put(final_ts.key().clone(), "invalid state root".into());

        let err = s
            .syncer
            .handle_new_tipset(&s.cancel, &target_for(&final_ts))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadTipset(_)));
    }

    #[tokio::test]
    async fn fork_within_threshold_reorgs_to_the_heavier_branch() {
        let s = setup();
        let gen = s.builder.genesis();
        let branch_a = s.builder.build_many_on(3, &gen, 0);
        let branch_b = s.builder.build_many_on(5, &gen, 0);

        s.syncer
            .handle_new_tipset(&s.cancel, &target_for(&branch_a))
            .await
            .unwrap();
        assert_eq!(
            s.syncer.chain_store().heaviest_tipset().key(),
            branch_a.key()
        );

        s.syncer
            .handle_new_tipset(&s.cancel, &target_for(&branch_b))
            .await
            .unwrap();
        assert_eq!(
            s.syncer.chain_store().heaviest_tipset().key(),
            branch_b.key()
        );
        assert!(s.syncer.metrics.reorg_count.get() >= 1);
    }

    #[tokio::test]
    async fn fork_past_threshold_is_rejected_and_tainted() {
        let mut config = SyncConfig::default();
        config.fork_length_threshold = 2;
        let s = setup_with_config(config);
        let gen = s.builder.genesis();
        let branch_a = s.builder.build_many_on(4, &gen, 0);
        let branch_b = s.builder.build_many_on(8, &gen, 0);

        s.syncer
            .handle_new_tipset(&s.cancel, &target_for(&branch_a))
            .await
            .unwrap();

        let err = s
            .syncer
            .handle_new_tipset(&s.cancel, &target_for(&branch_b))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ForkTooLong));
        assert_eq!(
            s.syncer.chain_store().heaviest_tipset().key(),
            branch_a.key()
        );
        // The rejected chain's fetched descendants are now tainted.
        assert!(s.syncer.bad_tipsets.contains(branch_b.key()));
    }

    #[tokio::test]
    async fn fork_at_genesis_is_fatal() {
        // The remote world was built on a different genesis.
        let s = setup();
        let remote = Arc::new(ChainBuilder::new());
        let foreign_head = remote.build_on(&remote.genesis(), 1, 0);

        // Swap the exchange for the foreign builder by syncing through a
        // syncer wired against it.
        let store = s.syncer.chain_store().clone();
        let validator = Arc::new(ExpectedConsensus::new(
            store.clone(),
            FakeInterpreter,
            MockVerifier,
            remote.clock(),
        ));
        let (fault_tx, _faults) = flume::unbounded();
        let syncer: Arc<TestSyncer> = Arc::new(ChainSyncer::new(
            store,
            remote.clone(),
            Arc::new(BadTipsetCache::default()),
            validator,
            Arc::new(HeaviestSelector),
            Arc::new(ConsensusFaultDetector::new(fault_tx, 500)),
            SyncConfig::default(),
            Arc::new(SyncMetrics::unregistered()),
        ));

        let err = syncer
            .handle_new_tipset(&s.cancel, &target_for(&foreign_head))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ForkAtGenesis(_)), "got {err}");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn widening_unions_known_siblings_into_the_head() {
        let s = setup();
        let gen = s.builder.genesis();
        let sibling_a = s.builder.build_on(&gen, 2, 0);
        let sibling_b = s.builder.build_on(&gen, 1, 0);

        s.syncer
            .handle_new_tipset(&s.cancel, &target_for(&sibling_a))
            .await
            .unwrap();
        s.syncer
            .handle_new_tipset(&s.cancel, &target_for(&sibling_b))
            .await
            .unwrap();

        let head = s.syncer.chain_store().heaviest_tipset();
        assert_eq!(head.len(), 3, "head should be the widened union");
        for cid in sibling_a.cids().iter().chain(sibling_b.cids()) {
            assert!(head.cids().contains(cid));
        }
    }

    #[tokio::test]
    async fn checkpoint_skips_mining_validation() {
        let gen_config = SyncConfig::default();
        let s = setup_with_config(gen_config);
        let gen = s.builder.genesis();
        let store = s.syncer.chain_store().clone();

        // A block with a bogus declared weight; mining checks must reject it
        // unless its parent is the checkpoint.
        let meta = chain::compute_msg_meta(store.blockstore().as_ref(), &[], &[]).unwrap();
        let header = BlockHeader::builder()
            .miner_address(crate::address::Address::new_id(9999))
            .ticket(Some(crate::blocks::Ticket::new(VRFProof::new(vec![9]))))
            .election_proof(Some(crate::blocks::ElectionProof {
                win_count: 1,
                vrfproof: VRFProof::new(vec![9]),
            }))
            .parents(gen.key().clone())
            .weight(crate::chain::weight(&gen) + BigInt::from(7))
            .epoch(1)
            .state_root(store.tipset_state_root(gen.key()).unwrap())
            .message_receipts(store.tipset_receipts_root(gen.key()).unwrap())
            .messages(meta)
            .timestamp(s.builder.clock().timestamp_for_epoch(1))
            .bls_aggregate(Some(Signature::new_bls(vec![9])))
            .signature(Some(Signature::new_secp256k1(vec![9])))
            .build_and_validate()
            .unwrap();
        let full = FullTipset::new(vec![Block {
            header,
            bls_messages: Vec::new(),
            secp_messages: Vec::new(),
        }])
        .unwrap();

        let err = s.syncer.sync_one(&gen, &full).await.unwrap_err();
        assert!(matches!(err, Error::Consensus(_)));

        let mut config = SyncConfig::default();
        config.checkpoint = gen.key().clone();
        let checkpointed = setup_with_config(config);
        // Rebuild the same block against the checkpointed syncer's store.
        let gen2 = checkpointed.builder.genesis();
        let store2 = checkpointed.syncer.chain_store().clone();
        let meta2 = chain::compute_msg_meta(store2.blockstore().as_ref(), &[], &[]).unwrap();
        let header2 = BlockHeader::builder()
            .miner_address(crate::address::Address::new_id(9999))
            .ticket(Some(crate::blocks::Ticket::new(VRFProof::new(vec![9]))))
            .election_proof(Some(crate::blocks::ElectionProof {
                win_count: 1,
                vrfproof: VRFProof::new(vec![9]),
            }))
            .parents(gen2.key().clone())
            .weight(crate::chain::weight(&gen2) + BigInt::from(7))
            .epoch(1)
            .state_root(store2.tipset_state_root(gen2.key()).unwrap())
            .message_receipts(store2.tipset_receipts_root(gen2.key()).unwrap())
            .messages(meta2)
            .timestamp(checkpointed.builder.clock().timestamp_for_epoch(1))
            .bls_aggregate(Some(Signature::new_bls(vec![9])))
            .signature(Some(Signature::new_secp256k1(vec![9])))
            .build_and_validate()
            .unwrap();
        let full2 = FullTipset::new(vec![Block {
            header: header2,
            bls_messages: Vec::new(),
            secp_messages: Vec::new(),
        }])
        .unwrap();

        checkpointed
            .syncer
            .sync_one(&gen2, &full2)
            .await
            .expect("mining checks are skipped across the checkpoint");
    }

    #[tokio::test]
    async fn double_mining_across_targets_emits_a_fault() {
        let s = setup();
        let gen = s.builder.genesis();
        let store = s.syncer.chain_store().clone();
        let meta = chain::compute_msg_meta(store.blockstore().as_ref(), &[], &[]).unwrap();

        let make_block = |salt: u8| {
            let header = BlockHeader::builder()
                .miner_address(crate::address::Address::new_id(4242))
                .ticket(Some(crate::blocks::Ticket::new(VRFProof::new(vec![salt]))))
                .election_proof(Some(crate::blocks::ElectionProof {
                    win_count: 1,
                    vrfproof: VRFProof::new(vec![salt]),
                }))
                .parents(gen.key().clone())
                .weight(crate::chain::weight(&gen))
                .epoch(1)
                .state_root(store.tipset_state_root(gen.key()).unwrap())
                .message_receipts(store.tipset_receipts_root(gen.key()).unwrap())
                .messages(meta)
                .timestamp(s.builder.clock().timestamp_for_epoch(1))
                .bls_aggregate(Some(Signature::new_bls(vec![salt])))
                .signature(Some(Signature::new_secp256k1(vec![salt])))
                .build_and_validate()
                .unwrap();
            FullTipset::new(vec![Block {
                header,
                bls_messages: Vec::new(),
                secp_messages: Vec::new(),
            }])
            .unwrap()
        };

        let block_a = make_block(1);
        let block_b = make_block(2);
        s.syncer.sync_one(&gen, &block_a).await.unwrap();
        s.syncer.sync_one(&gen, &block_b).await.unwrap();

        let fault = s.faults.try_recv().expect("a consensus fault is emitted");
        assert_eq!(fault.miner, crate::address::Address::new_id(4242));
        assert_eq!(fault.epoch, 1);
        assert_eq!(fault.parent, gen.key().clone());
    }

    #[tokio::test]
    async fn cancellation_propagates_unchanged() {
        let s = setup();
        let gen = s.builder.genesis();
        let final_ts = s.builder.build_on(&gen, 1, 0);
        s.cancel.cancel();

        let err = s
            .syncer
            .handle_new_tipset(&s.cancel, &target_for(&final_ts))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn segments_partition_in_order() {
        let xs: Vec<u32> = (0..100).collect();
        let segments: Vec<&[u32]> = segment_tipsets(&xs).collect();
        assert!(segments.iter().all(|s| s.len() <= MAX_PROCESS_LEN));
        let concatenated: Vec<u32> = segments.concat();
        assert_eq!(concatenated, xs);

        let empty: Vec<&[u32]> = segment_tipsets::<u32>(&[]).collect();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn zip_rejects_messages_that_do_not_match_the_header_root() {
        let builder = ChainBuilder::new();
        let gen = builder.genesis();
        let ts = builder.build_on(&gen, 2, 2);
        let full = builder.tipset(ts.key()).unwrap();

        let correct = builder
            .get_chain_messages(std::slice::from_ref(&ts))
            .await
            .unwrap()
            .remove(0);

        // The right allocation zips cleanly.
        let scratch = MemoryDB::default();
        let zipped = zip_tipset_and_messages(&scratch, &ts, &correct).unwrap();
        assert_eq!(zipped.blocks()[0].bls_msgs(), full.blocks()[0].bls_msgs());

        // Swapping the per-block allocations changes the roots.
        let mut swapped = correct.clone();
        swapped.bls_msg_includes.swap(0, 1);
        swapped.secp_msg_includes.swap(0, 1);
        let err = zip_tipset_and_messages(&scratch, &ts, &swapped).unwrap_err();
        assert_eq!(
            err.to_string(),
            "messages didnt match message root in header"
        );

        // Wrong number of inclusion tables is rejected outright.
        let mut truncated = correct;
        truncated.bls_msg_includes.pop();
        let err = zip_tipset_and_messages(&scratch, &ts, &truncated).unwrap_err();
        assert!(matches!(err, Error::MessageInclusionMismatch));
    }
}
