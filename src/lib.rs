// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tessera: a library for building tile-based, append-only transparency
//! logs in the c2sp.org/tlog-tiles convention.
//!
//! [`Appender`] wires together the batching queue (C2), sequencer (C3),
//! integrator (C4), checkpoint publisher (C6), dedup decorators (C7) and
//! integration awaiter (C8) into one handle, built bottom-up out of its
//! constituent components. [`LogReader`] exposes the read-only surface over
//! a [`LogStore`]. The storage backend itself — object store, SQL,
//! filesystem — is never Tessera's concern; see [`LogStore`].

pub mod awaiter;
pub mod batch;
pub mod bundle;
pub mod checkpoint;
pub mod context;
pub mod dedup;
pub mod entry;
pub mod error;
pub mod integrator;
pub mod layout;
pub mod metrics;
pub mod migrate;
pub mod options;
pub mod range;
pub mod sequencer;
pub mod storage;
pub mod tile;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

pub use context::Context;
pub use entry::{Entry, EntryMaterializer, IdentityHasher, Index};
pub use error::{TesseraError, TesseraResult};
pub use metrics::Metrics;
pub use options::Options;
pub use storage::{LogStore, TreeState};

use bundle::default_bundle_leaf_hasher;
use dedup::InMemoryDedup;
use layout::TILE_WIDTH;

/// A running append pipeline for one log: the public entry point for adding
/// entries, waiting on their integration, and tearing the log down.
pub struct Appender {
    ctx: Context,
    store: Arc<dyn LogStore>,
    sequencer: Arc<sequencer::Sequencer>,
    batcher: batch::BatcherHandle,
    awaiter: awaiter::AwaiterHandle,
    dedup_memory: Option<Arc<InMemoryDedup>>,
    publisher: Arc<checkpoint::PublisherHandle>,
}

impl Appender {
    /// Builds and starts every background task of the append pipeline:
    /// the batcher, the checkpoint publisher and the integration awaiter.
    /// Metrics are registered against `registry`, which the caller owns.
    pub fn new(
        origin: impl Into<String>,
        options: Options,
        store: Arc<dyn LogStore>,
        registry: &prometheus::Registry,
    ) -> TesseraResult<Arc<Self>> {
        options.validate()?;
        let metrics = Arc::new(Metrics::new(registry));
        let ctx = Context::new(origin, options, metrics);

        let dedup_memory = ctx
            .options
            .in_memory_dedup_size
            .map(|cap| Arc::new(InMemoryDedup::new(cap)));

        let sequencer = sequencer::Sequencer::new(ctx.clone(), store.clone());
        let seq_for_batch = sequencer.clone();
        let batcher = batch::spawn(ctx.clone(), move |entries| {
            let seq = seq_for_batch.clone();
            Box::pin(async move { seq.sequence_batch(entries).await })
        });

        let awaiter = awaiter::spawn(ctx.clone(), store.clone());
        let publisher = checkpoint::spawn(ctx.clone(), store.clone());

        Ok(Arc::new(Self {
            ctx,
            store,
            sequencer,
            batcher,
            awaiter,
            dedup_memory,
            publisher,
        }))
    }

    /// Submits `entry` for sequencing, returning once it has an assigned
    /// [`Index`] (its own, or an earlier identity-equivalent entry's, marked
    /// [`Index::dup_of`]). Does not wait for integration; use
    /// [`Appender::await_integration`] for that.
    pub async fn add(&self, entry: Entry) -> TesseraResult<Index> {
        let identity = entry.identity();

        if let Some(antispam) = self.ctx.options.antispam.clone() {
            if let Some(existing) = antispam.check(identity).await? {
                self.ctx.metrics.entries_deduped.inc();
                return Ok(Index::dup_of(existing));
            }
        }

        let result = match &self.dedup_memory {
            Some(dedup) => {
                let batcher = self.batcher.clone();
                dedup
                    .add(entry, move |e| {
                        let batcher = batcher.clone();
                        Box::pin(async move { batcher.add(e).await })
                    })
                    .await
            }
            None => self.batcher.add(entry).await,
        };

        match &result {
            Ok(index) if index.is_dup => {
                self.ctx.metrics.entries_deduped.inc();
            }
            Ok(index) => {
                if let Some(antispam) = &self.ctx.options.antispam {
                    let current_size = self
                        .store
                        .read_tree_state()
                        .await
                        .ok()
                        .flatten()
                        .map(|s| s.size)
                        .unwrap_or(index.index + 1);
                    if let Err(e) = antispam.record(identity, index.index, current_size) {
                        warn!(
                            error = %e,
                            "antispam record pushed back; duplicate detection may lag for this entry"
                        );
                    }
                }
            }
            Err(TesseraError::Pushback) => {
                self.ctx.metrics.pushback_total.inc();
            }
            Err(_) => {}
        }

        result
    }

    /// Waits until `index` is covered by a published checkpoint, returning
    /// that checkpoint's raw bytes. Every caller awaiting the same index (or
    /// any index covered by the same publish) receives the same bytes.
    pub async fn await_integration(&self, index: u64) -> Option<Vec<u8>> {
        self.awaiter.await_integration(index).await
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Stops the checkpoint publisher. The batcher and awaiter are left
    /// running so any already-queued `add` calls can still resolve; drop the
    /// last `Arc<Appender>` to let them wind down.
    pub fn shutdown(&self) {
        self.publisher.stop();
    }
}

/// A migration destination backed by this log's own pipeline: bundles are
/// written directly (bypassing index assignment, since indices are fixed by
/// the source), and integration of the copied range is driven lazily, once
/// per distinct `tree_size` a caller awaits, by recovering leaf hashes from
/// the newly landed bundles via the default bundle leaf hasher.
#[async_trait]
impl migrate::MigrationTarget for Appender {
    async fn set_entry_bundle(
        &self,
        bundle_index: u64,
        partial_size: Option<u8>,
        data: Vec<u8>,
    ) -> TesseraResult<()> {
        self.store
            .write_entry_bundle(bundle_index, partial_size, data)
            .await
    }

    async fn await_integration(&self, tree_size: u64) -> TesseraResult<[u8; 32]> {
        if tree_size == 0 {
            return Ok(range::empty_root());
        }

        let starting_size = self
            .store
            .read_tree_state()
            .await?
            .map(|s| s.size)
            .unwrap_or(0);
        if starting_size >= tree_size {
            return Ok(self
                .store
                .read_tree_state()
                .await?
                .map(|s| s.root_hash)
                .unwrap_or_else(range::empty_root));
        }

        let width = TILE_WIDTH as u64;
        let mut leaves = Vec::with_capacity((tree_size - starting_size) as usize);
        let mut bundle_index = starting_size / width;
        let mut skip = (starting_size % width) as usize;
        while bundle_index * width < tree_size {
            let remaining = tree_size - bundle_index * width;
            let partial_size = if remaining < width {
                Some(remaining as u8)
            } else {
                None
            };
            let bytes = self
                .store
                .read_entry_bundle(bundle_index, partial_size)
                .await?
                .ok_or_else(|| {
                    TesseraError::invariant(format!(
                        "migration: bundle {bundle_index} missing while integrating up to size {tree_size}"
                    ))
                })?;
            let hashes = match &self.ctx.options.bundle_leaf_hasher {
                Some(hasher) => hasher(&bytes)?,
                None => default_bundle_leaf_hasher(&bytes)?,
            };
            leaves.extend(hashes.into_iter().skip(skip));
            skip = 0;
            bundle_index += 1;
        }

        let state = integrator::integrate(&*self.store, starting_size, &leaves).await?;
        Ok(state.root_hash)
    }
}

/// The read-only surface over a [`LogStore`]: fetches tiles, entry bundles
/// and checkpoints as published, with no caching or verification of its own
/// (proof computation and inclusion/consistency checks are
/// left to the application, which already has `range.rs`'s primitives to
/// build on).
pub struct LogReader {
    store: Arc<dyn LogStore>,
}

impl LogReader {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    pub async fn tree_state(&self) -> TesseraResult<Option<TreeState>> {
        self.store.read_tree_state().await
    }

    pub async fn tile(
        &self,
        level: u8,
        tile_index: u64,
        partial_size: Option<u8>,
    ) -> TesseraResult<Option<Vec<u8>>> {
        self.store.read_tile(level, tile_index, partial_size).await
    }

    pub async fn entry_bundle(
        &self,
        bundle_index: u64,
        partial_size: Option<u8>,
    ) -> TesseraResult<Option<Vec<u8>>> {
        self.store
            .read_entry_bundle(bundle_index, partial_size)
            .await
    }

    pub async fn checkpoint(&self) -> TesseraResult<Option<Vec<u8>>> {
        self.store.read_checkpoint().await
    }
}
