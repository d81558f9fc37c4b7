// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntGauge, Registry,
};

/// Metrics for one [`crate::Appender`] instance, registered against a
/// caller-supplied [`Registry`]. A single `Arc<Metrics>` is threaded
/// through every component via `Context`.
pub struct Metrics {
    pub entries_added: IntCounter,
    pub entries_deduped: IntCounter,
    pub pushback_total: IntCounter,
    pub batches_sequenced: IntCounter,
    pub sequence_errors: IntCounter,
    pub integrate_latency_ms: Histogram,
    pub tree_size: IntGauge,
    pub checkpoints_published: IntCounter,
    pub checkpoint_publish_errors: IntCounter,
    pub awaiter_waiters: IntGauge,
    pub migration_bundles_copied: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            entries_added: register_int_counter_with_registry!(
                "tessera_entries_added_total",
                "Number of entries that entered the batching queue",
                registry
            )
            .unwrap(),
            entries_deduped: register_int_counter_with_registry!(
                "tessera_entries_deduped_total",
                "Number of Add calls resolved as a duplicate of an earlier entry",
                registry
            )
            .unwrap(),
            pushback_total: register_int_counter_with_registry!(
                "tessera_pushback_total",
                "Number of Add calls rejected with ErrPushback",
                registry
            )
            .unwrap(),
            batches_sequenced: register_int_counter_with_registry!(
                "tessera_batches_sequenced_total",
                "Number of batches successfully sequenced",
                registry
            )
            .unwrap(),
            sequence_errors: register_int_counter_with_registry!(
                "tessera_sequence_errors_total",
                "Number of batches that failed to sequence",
                registry
            )
            .unwrap(),
            integrate_latency_ms: register_histogram_with_registry!(
                "tessera_integrate_latency_ms",
                "Time to integrate one batch of leaves into the Merkle tree",
                registry
            )
            .unwrap(),
            tree_size: register_int_gauge_with_registry!(
                "tessera_tree_size",
                "Current integrated tree size",
                registry
            )
            .unwrap(),
            checkpoints_published: register_int_counter_with_registry!(
                "tessera_checkpoints_published_total",
                "Number of checkpoints published",
                registry
            )
            .unwrap(),
            checkpoint_publish_errors: register_int_counter_with_registry!(
                "tessera_checkpoint_publish_errors_total",
                "Number of failed checkpoint publish attempts",
                registry
            )
            .unwrap(),
            awaiter_waiters: register_int_gauge_with_registry!(
                "tessera_awaiter_waiters",
                "Number of callers currently parked in the integration awaiter",
                registry
            )
            .unwrap(),
            migration_bundles_copied: register_int_counter_with_registry!(
                "tessera_migration_bundles_copied_total",
                "Number of entry bundles copied by the migration target",
                registry
            )
            .unwrap(),
        }
    }
}
