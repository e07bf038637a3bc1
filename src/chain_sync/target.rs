// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use parking_lot::RwLock;
use serde::Serialize;

use crate::blocks::Tipset;

/// Lifecycle of a sync target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStage {
    /// Waiting for the worker to pick the target up.
    Queued,
    /// Retrieving headers and messages toward the target.
    Fetching,
    /// Running per-tipset validation and advancing the head.
    Validating,
    /// The target's head was synced.
    Complete,
    /// Syncing terminated with an error.
    Error,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStage::Queued => write!(f, "queued"),
            SyncStage::Fetching => write!(f, "fetching"),
            SyncStage::Validating => write!(f, "validating"),
            SyncStage::Complete => write!(f, "complete"),
            SyncStage::Error => write!(f, "error"),
        }
    }
}

/// One proposed head making its way through the syncer.
#[derive(Debug)]
struct SyncTarget {
    head: Arc<Tipset>,
    sender: PeerId,
    stage: SyncStage,
    /// Latest tipset validated in this run.
    current: Option<Arc<Tipset>>,
    message: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// Shared handle onto a sync target; the worker mutates it, diagnostics
/// read it.
#[derive(Debug, Clone)]
pub struct TargetHandle(Arc<RwLock<SyncTarget>>);

impl TargetHandle {
    pub fn new(head: Arc<Tipset>, sender: PeerId) -> Self {
        Self(Arc::new(RwLock::new(SyncTarget {
            head,
            sender,
            stage: SyncStage::Queued,
            current: None,
            message: String::new(),
            start: None,
            end: None,
        })))
    }

    pub fn head(&self) -> Arc<Tipset> {
        self.0.read().head.clone()
    }

    pub fn sender(&self) -> PeerId {
        self.0.read().sender
    }

    pub fn stage(&self) -> SyncStage {
        self.0.read().stage
    }

    pub fn current(&self) -> Option<Arc<Tipset>> {
        self.0.read().current.clone()
    }

    pub fn set_stage(&self, stage: SyncStage) {
        let mut target = self.0.write();
        if target.start.is_none() {
            target.start = Some(Utc::now());
        }
        if let SyncStage::Complete = stage {
            target.end = Some(Utc::now());
        }
        target.stage = stage;
    }

    pub fn set_current(&self, ts: Arc<Tipset>) {
        self.0.write().current = Some(ts);
    }

    /// Terminates the target with an error.
    pub fn error(&self, message: String) {
        let mut target = self.0.write();
        target.message = message;
        target.stage = SyncStage::Error;
        target.end = Some(Utc::now());
    }

    pub fn report(&self) -> SyncStateReport {
        let target = self.0.read();
        SyncStateReport {
            head_key: target.head.key().to_string(),
            head_epoch: target.head.epoch(),
            sender: target.sender.to_string(),
            stage: target.stage,
            current_key: target.current.as_ref().map(|ts| ts.key().to_string()),
            current_epoch: target.current.as_ref().map(|ts| ts.epoch()),
            message: target.message.clone(),
            start: target.start,
            end: target.end,
        }
    }
}

/// Snapshot of a target for the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncStateReport {
    pub head_key: String,
    pub head_epoch: i64,
    pub sender: String,
    pub stage: SyncStage,
    pub current_key: Option<String>,
    pub current_epoch: Option<i64>,
    pub message: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Queue of pending sync targets, heaviest first, with bounded history of
/// finished ones.
pub struct TargetTracker {
    queue: Vec<TargetHandle>,
    in_flight: Option<TargetHandle>,
    history: Vec<TargetHandle>,
    max_history: usize,
}

impl Default for TargetTracker {
    fn default() -> Self {
        Self::new(16)
    }
}

impl TargetTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            queue: Vec::new(),
            in_flight: None,
            history: Vec::new(),
            max_history,
        }
    }

    /// Enqueues a target unless an equivalent head is already queued or
    /// being synced. Returns whether the target was accepted.
    pub fn add(&mut self, target: TargetHandle) -> bool {
        let key = target.head().key().clone();
        let already_known = self
            .queue
            .iter()
            .chain(self.in_flight.iter())
            .any(|t| t.head().key() == &key);
        if already_known {
            return false;
        }
        self.queue.push(target);
        // Heaviest first so the worker always picks the best candidate.
        self.queue.sort_by(|a, b| b.head().weight().cmp(a.head().weight()));
        true
    }

    /// Takes the heaviest queued target, marking it in flight.
    pub fn select(&mut self) -> Option<TargetHandle> {
        if self.queue.is_empty() {
            return None;
        }
        let target = self.queue.remove(0);
        self.in_flight = Some(target.clone());
        Some(target)
    }

    /// Moves the in-flight target into history.
    pub fn finish(&mut self, target: TargetHandle) {
        self.in_flight = None;
        self.history.push(target);
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }
    }

    /// Reports over every known target: queued, in flight, and finished.
    pub fn reports(&self) -> Vec<SyncStateReport> {
        self.history
            .iter()
            .chain(self.in_flight.iter())
            .chain(self.queue.iter())
            .map(TargetHandle::report)
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::blocks::{BlockHeader, Ticket};
    use crate::crypto::VRFProof;
    use num_bigint::BigInt;

    fn target(weight: u64, salt: u8) -> TargetHandle {
        let header = BlockHeader::builder()
            .miner_address(Address::new_id(salt as u64))
            .ticket(Some(Ticket::new(VRFProof::new(vec![salt]))))
            .weight(BigInt::from(weight))
            .build_and_validate()
            .unwrap();
        TargetHandle::new(
            Arc::new(Tipset::new(vec![header]).unwrap()),
            PeerId::random(),
        )
    }

    #[test]
    fn heaviest_target_is_selected_first() {
        let mut tracker = TargetTracker::default();
        tracker.add(target(10, 1));
        tracker.add(target(30, 2));
        tracker.add(target(20, 3));

        let first = tracker.select().unwrap();
        assert_eq!(first.head().weight(), &BigInt::from(30));
        tracker.finish(first);
        assert_eq!(
            tracker.select().unwrap().head().weight(),
            &BigInt::from(20)
        );
    }

    #[test]
    fn duplicate_heads_are_rejected() {
        let mut tracker = TargetTracker::default();
        let t = target(10, 1);
        assert!(tracker.add(t.clone()));
        assert!(!tracker.add(t));
        assert_eq!(tracker.queue_len(), 1);
    }

    #[test]
    fn stage_transitions_are_observable() {
        let t = target(1, 1);
        assert_eq!(t.stage(), SyncStage::Queued);
        t.set_stage(SyncStage::Fetching);
        t.set_stage(SyncStage::Validating);
        t.set_stage(SyncStage::Complete);
        let report = t.report();
        assert_eq!(report.stage, SyncStage::Complete);
        assert!(report.start.is_some());
        assert!(report.end.is_some());
    }
}
