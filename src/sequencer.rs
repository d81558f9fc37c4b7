// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! The sequencer (C3): assigns contiguous indices to a
//! batch of entries, writes their bundle bytes to the entry-bundle artifact
//! they belong to (continuing a partial bundle, flushing full ones), then
//! hands the batch's leaf hashes to the integrator (C4) to extend the
//! Merkle tree. Requires single-writer discipline — at most one
//! `sequence_batch` call in flight for a given log at a time — the same
//! "read current state, then mutate" precondition a single-writer
//! component must enforce over its own durable state.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::bundle::EntryBundle;
use crate::context::Context;
use crate::entry::{Entry, Index};
use crate::error::{TesseraError, TesseraResult};
use crate::integrator;
use crate::layout::{DEFAULT_ENTRIES_PATH, TILE_WIDTH};
use crate::storage::LogStore;

/// Owns the single-writer serialization point for one log's sequencing
/// pipeline.
pub struct Sequencer {
    ctx: Context,
    store: Arc<dyn LogStore>,
    guard: AsyncMutex<()>,
}

impl Sequencer {
    pub fn new(ctx: Context, store: Arc<dyn LogStore>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            store,
            guard: AsyncMutex::new(()),
        })
    }

    /// Assigns indices to `entries` in order, writes their bundle bytes, and
    /// integrates their leaf hashes into the Merkle tree. Returns one
    /// [`Index`] per entry, in the same order.
    pub async fn sequence_batch(&self, entries: Vec<Entry>) -> TesseraResult<Vec<Index>> {
        let _permit = self
            .guard
            .try_lock()
            .map_err(|_| TesseraError::invariant("concurrent sequence_batch calls on one log"))?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let starting_size = self
            .store
            .read_tree_state()
            .await?
            .map(|s| s.size)
            .unwrap_or(0);

        // Reserved for drivers that derive a bundle's storage key/path from
        // `entries_path` (CT-shaped logs use `tile/data/...` instead of the
        // generic default); `LogStore` itself is keyed by `bundle_index`.
        let _entries_path = self
            .ctx
            .options
            .entries_path
            .as_deref()
            .unwrap_or(DEFAULT_ENTRIES_PATH);

        let mut bundle_index = starting_size / TILE_WIDTH as u64;
        let mut offset = (starting_size % TILE_WIDTH as u64) as usize;
        let mut bundle = if offset > 0 {
            load_partial_bundle(&*self.store, bundle_index, offset).await?
        } else {
            EntryBundle::new()
        };

        let mut leaves = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let index = starting_size + i as u64;
            let (bundle_bytes, leaf_hash) = entry.materialize(index);
            bundle.push(bundle_bytes);
            leaves.push(leaf_hash);

            if bundle.is_full() {
                self.store
                    .write_entry_bundle(bundle_index, None, bundle.serialize())
                    .await?;
                bundle_index += 1;
                offset = 0;
                bundle = EntryBundle::new();
            } else {
                offset = bundle.len();
            }
        }

        if !bundle.is_empty() {
            self.store
                .write_entry_bundle(bundle_index, Some(offset as u8), bundle.serialize())
                .await?;
        }

        let integrate_started = std::time::Instant::now();
        let state = integrator::integrate(&*self.store, starting_size, &leaves).await?;
        self.ctx
            .metrics
            .integrate_latency_ms
            .observe(integrate_started.elapsed().as_secs_f64() * 1000.0);
        if state.size != starting_size + entries.len() as u64 {
            warn!(
                expected = starting_size + entries.len() as u64,
                actual = state.size,
                "integrator returned an unexpected tree size"
            );
        }
        self.ctx.metrics.tree_size.set(state.size as i64);
        self.ctx
            .metrics
            .entries_added
            .inc_by(entries.len() as u64);

        Ok((starting_size..starting_size + entries.len() as u64)
            .map(Index::new)
            .collect())
    }
}

async fn load_partial_bundle(
    store: &dyn LogStore,
    bundle_index: u64,
    fill: usize,
) -> TesseraResult<EntryBundle> {
    let bytes = store
        .read_entry_bundle(bundle_index, Some(fill as u8))
        .await?
        .ok_or_else(|| {
            TesseraError::invariant(format!(
                "tree state expects a partial bundle at index {bundle_index} with fill {fill}, but none was found"
            ))
        })?;
    let mut bundle = EntryBundle::new();
    for raw in EntryBundle::parse(&bytes)? {
        bundle.push(raw.to_vec());
    }
    Ok(bundle)
}
