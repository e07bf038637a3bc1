// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Accepts proposed heads from the hello handshake and the block gossip
//! topic, materializes them into full tipsets, and drives the syncer over
//! them one target at a time.

use std::sync::Arc;

use fvm_ipld_blockstore::Blockstore;
use libp2p::PeerId;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bad_tipset_cache::BadTipsetCache;
use super::exchange::ExchangeClient;
use super::fetcher::Fetcher;
use super::metrics::SyncMetrics;
use super::syncer::ChainSyncer;
use super::target::{SyncStage, SyncStateReport, TargetHandle, TargetTracker};
use super::validation::TipsetValidator;
use super::{Error, FORK_LENGTH_THRESHOLD};
use crate::blocks::{Block, ChainInfo, FullTipset, GossipBlock, Tipset, TipsetKey};
use crate::chain::{self, ChainStore};
use crate::clock::ChainEpochClock;
use crate::consensus::{ChainSelector, FullBlockValidator};
use crate::db::SettingsStore;

/// Syncing configuration options.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Number of tipsets requested per exchange window during catch-up.
    pub req_window: usize,
    /// Maximum fork depth resolved before a target is rejected.
    pub fork_length_threshold: u64,
    /// Tipset key across which no mining validation is run. The empty key
    /// disables checkpointing.
    pub checkpoint: TipsetKey,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            req_window: 500,
            fork_length_threshold: FORK_LENGTH_THRESHOLD,
            checkpoint: TipsetKey::default(),
        }
    }
}

/// Serializes sync targets onto a single worker. Intake is non-blocking:
/// target materialization (fetching the proposed head's blocks and
/// messages) runs on detached tasks, and only complete, structurally valid
/// targets enter the queue.
pub struct SyncManager<DB, F, E, FV, CS> {
    syncer: Arc<ChainSyncer<DB, E, FV, CS>>,
    fetcher: Arc<F>,
    chain_store: Arc<ChainStore<DB>>,
    bad_tipsets: Arc<BadTipsetCache>,
    tracker: Arc<Mutex<TargetTracker>>,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
    cancel: CancellationToken,
    local_peer: PeerId,
    clock: ChainEpochClock,
    metrics: Arc<SyncMetrics>,
}

impl<DB, F, E, FV, CS> SyncManager<DB, F, E, FV, CS>
where
    DB: Blockstore + SettingsStore + Send + Sync + 'static,
    F: Fetcher + 'static,
    E: ExchangeClient + 'static,
    FV: FullBlockValidator + 'static,
    CS: ChainSelector + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        syncer: Arc<ChainSyncer<DB, E, FV, CS>>,
        fetcher: Arc<F>,
        bad_tipsets: Arc<BadTipsetCache>,
        local_peer: PeerId,
        clock: ChainEpochClock,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let (wake_tx, wake_rx) = flume::unbounded();
        let chain_store = syncer.chain_store().clone();
        Self {
            syncer,
            fetcher,
            chain_store,
            bad_tipsets,
            tracker: Arc::new(Mutex::new(TargetTracker::default())),
            wake_tx,
            wake_rx,
            cancel: CancellationToken::new(),
            local_peer,
            clock,
            metrics,
        }
    }

    /// Cancellation handle passed to every operation the manager starts.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reports over every known sync target, for diagnostics.
    pub fn sync_states(&self) -> Vec<SyncStateReport> {
        self.tracker.lock().reports()
    }

    /// Proposes the head a peer announced in its hello handshake.
    pub fn send_hello(self: &Arc<Self>, ci: ChainInfo) -> Result<(), Error> {
        if ci.sender == self.local_peer {
            return Ok(());
        }
        let head = self.chain_store.heaviest_tipset();
        if &ci.weight < head.weight() {
            debug!(head = %ci.head, "ignoring hello behind the current head");
            return Ok(());
        }
        let this = self.clone();
        tokio::spawn(async move { this.materialize_target(ci).await });
        Ok(())
    }

    /// Channel intake for a peer discovery module: every [`ChainInfo`]
    /// received on the returned sender is treated like a hello announcement.
    pub fn chain_info_sender(self: &Arc<Self>) -> flume::Sender<ChainInfo> {
        let (tx, rx) = flume::unbounded();
        let this = self.clone();
        tokio::spawn(async move {
            while let Ok(ci) = rx.recv_async().await {
                if let Err(e) = this.send_hello(ci) {
                    warn!(error = %e, "hello intake failed");
                }
            }
        });
        tx
    }

    /// Proposes a block announced over gossip. The header is persisted
    /// immediately; referenced message CIDs are fetched asynchronously
    /// before the single-block tipset becomes a target.
    pub fn send_gossip_block(
        self: &Arc<Self>,
        block: GossipBlock,
        source: PeerId,
    ) -> Result<(), Error> {
        if source == self.local_peer {
            debug!("discarding gossiped block authored by self");
            return Ok(());
        }
        info!(
            block = %block.header.cid(),
            epoch = block.header.epoch(),
            %source,
            "received block over gossip"
        );
        chain::persist_objects(
            self.chain_store.blockstore().as_ref(),
            std::slice::from_ref(&block.header),
        )?;

        let key = TipsetKey::new(vec![*block.header.cid()]);
        let ci = ChainInfo::new(
            source,
            source,
            key,
            block.header.epoch(),
            block.header.weight().clone(),
        );
        let this = self.clone();
        tokio::spawn(async move { this.materialize_target(ci).await });
        Ok(())
    }

    /// Spawns the worker draining the target queue.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.worker().await })
    }

    /// Cancels the root token; in-flight operations abort at their next
    /// suspension point and the worker exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn materialize_target(self: Arc<Self>, ci: ChainInfo) {
        match self.fetch_full_target(&ci).await {
            Ok(Some(target)) => {
                if self.tracker.lock().add(target) {
                    let _ = self.wake_tx.send(());
                }
            }
            Ok(None) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                self.metrics.invalid_gossip_tipset_total.inc();
                warn!(head = %ci.head, sender = %ci.sender, error = %e, "proposed head rejected");
            }
        }
    }

    /// Turns a proposed head key into a validated sync target, fetching the
    /// tipset's blocks and messages if they are not held locally.
    async fn fetch_full_target(&self, ci: &ChainInfo) -> Result<Option<TargetHandle>, Error> {
        if let Some(reason) = self.bad_tipsets.get(&ci.head) {
            return Err(Error::BadTipset(reason));
        }

        let full = match self.load_local_full_tipset(&ci.head) {
            Ok(full) => full,
            Err(_) => {
                let done = |_: &Tipset| true;
                self.fetcher
                    .fetch_tipsets(&self.cancel, &ci.head, ci.sender, &done)
                    .await?;
                self.load_local_full_tipset(&ci.head)?
            }
        };

        TipsetValidator(&full).validate(
            self.chain_store.blockstore().as_ref(),
            &self.bad_tipsets,
            &self.clock,
        )?;

        let ts = Arc::new(full.into_tipset()?);
        let head = self.chain_store.heaviest_tipset();
        if ts.weight() < head.weight() {
            debug!(head = %ts.key(), "proposed head is lighter than the current head, ignoring");
            return Ok(None);
        }
        Ok(Some(TargetHandle::new(ts, ci.sender)))
    }

    fn load_local_full_tipset(&self, key: &TipsetKey) -> Result<FullTipset, Error> {
        let ts = self.chain_store.tipset_from_keys(key)?;
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

    async fn worker(self: Arc<Self>) {
        info!("chain sync worker started");
        'outer: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                wake = self.wake_rx.recv_async() => {
                    if wake.is_err() {
                        break;
                    }
                }
            }
            loop {
                let next = {
                    let mut tracker = self.tracker.lock();
                    tracker.select()
                };
                let Some(target) = next else { break };

                match self.syncer.handle_new_tipset(&self.cancel, &target).await {
                    Ok(()) => {
                        target.set_stage(SyncStage::Complete);
                        info!(head = %target.head().key(), "target synced");
                    }
                    Err(e) if e.is_cancelled() => {
                        target.error("sync cancelled".into());
                        self.tracker.lock().finish(target);
                        break 'outer;
                    }
                    Err(e) => {
                        self.metrics.target_failure_total.inc();
                        error!(head = %target.head().key(), error = %e, "failed to sync target");
                        target.error(e.to_string());
                        if e.is_fatal() {
                            error!("fatal sync error, stopping the sync subsystem");
                            self.cancel.cancel();
                            self.tracker.lock().finish(target);
                            break 'outer;
                        }
                    }
                }
                self.tracker.lock().finish(target);
            }
        }
        info!("chain sync worker stopped");
    }
}
