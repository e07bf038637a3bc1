// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use prometheus::{
    core::{AtomicU64, GenericCounter},
    Error as PrometheusError, Histogram, HistogramOpts, Opts, Registry,
};

/// Counters and timers of the sync subsystem. Created against a registry
/// supplied by the caller and passed into constructors explicitly; there is
/// no process-wide default.
#[derive(Clone)]
pub struct SyncMetrics {
    /// Number of reorgs that have occurred.
    pub reorg_count: GenericCounter<AtomicU64>,
    /// Duration of single tipset validation, in milliseconds.
    pub sync_one_duration: Histogram,
    /// Duration of processing one fetched segment.
    pub tipset_processing_time: Histogram,
    /// Tipsets received over gossip that failed validation.
    pub invalid_gossip_tipset_total: GenericCounter<AtomicU64>,
    /// Sync targets that terminated in an error.
    pub target_failure_total: GenericCounter<AtomicU64>,
}

impl SyncMetrics {
    pub fn register(registry: &Registry) -> Result<Arc<Self>, PrometheusError> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.reorg_count.clone()))?;
        registry.register(Box::new(metrics.sync_one_duration.clone()))?;
        registry.register(Box::new(metrics.tipset_processing_time.clone()))?;
        registry.register(Box::new(metrics.invalid_gossip_tipset_total.clone()))?;
        registry.register(Box::new(metrics.target_failure_total.clone()))?;
        Ok(Arc::new(metrics))
    }

    /// Metrics that are collected but not exported. For tests and tooling.
    pub fn unregistered() -> Self {
        Self {
            reorg_count: GenericCounter::new(
                "chain_reorg_count",
                "Number of reorgs that have occurred",
            )
            .expect("static metric options are valid"),
            sync_one_duration: Histogram::with_opts(HistogramOpts {
                common_opts: Opts::new(
                    "syncer_sync_one_duration_milliseconds",
                    "Duration of single tipset validation in milliseconds",
                ),
                buckets: prometheus::exponential_buckets(1.0, 4.0, 10)
                    .expect("static bucket configuration is valid"),
            })
            .expect("static metric options are valid"),
            tipset_processing_time: Histogram::with_opts(HistogramOpts {
                common_opts: Opts::new(
                    "tipset_processing_time",
                    "Duration of routine which processes tipsets to include them in the store",
                ),
                buckets: Vec::new(),
            })
            .expect("static metric options are valid"),
            invalid_gossip_tipset_total: GenericCounter::new(
                "invalid_gossip_tipset_total",
                "Total number of invalid tipsets received over gossipsub",
            )
            .expect("static metric options are valid"),
            target_failure_total: GenericCounter::new(
                "sync_target_failure_total",
                "Total number of sync targets that terminated in an error",
            )
            .expect("static metric options are valid"),
        }
    }
}
