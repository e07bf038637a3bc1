// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod bad_tipset_cache;
mod errors;
pub mod exchange;
mod fault_detector;
pub mod fetcher;
mod manager;
pub mod metrics;
mod syncer;
mod target;
mod validation;

pub use bad_tipset_cache::BadTipsetCache;
pub use errors::Error;
pub use fault_detector::{ConsensusFault, ConsensusFaultDetector};
pub use manager::{SyncConfig, SyncManager};
pub use metrics::SyncMetrics;
pub use syncer::{segment_tipsets, zip_tipset_and_messages, ChainSyncer, MAX_PROCESS_LEN};
pub use target::{SyncStage, SyncStateReport, TargetHandle, TargetTracker};
pub use validation::{TipsetValidationError, TipsetValidator, MAX_HEIGHT_DRIFT};

/// Maximum fork depth the syncer resolves; also bounds fetcher recursion
/// depths and fault-detector retention.
pub const FORK_LENGTH_THRESHOLD: u64 = 500;
