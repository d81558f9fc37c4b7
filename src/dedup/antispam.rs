// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistent antispam: a dedup layer
//! that survives process restarts and is shared across replicas of the same
//! log. Three moving parts:
//!
//! - an external key/value map (`identity hash -> index`), owned by the host
//!   application and exposed to us only through [`AntispamStore`];
//! - a buffered async writer that records newly assigned indices into the
//!   map without making `Add` wait on the external store's latency;
//! - a log-tailing follower that replays newly integrated entry bundles to
//!   populate the map with indices assigned by *other* replicas, so this
//!   replica's dedup view converges even for entries it never itself saw.
//!
//! `Add` is pushed back when the writer's buffer
//! is full or the follower has fallen further than `max_follower_lag` behind
//! the integrated tree size — in both cases the dedup view is stale enough
//! that accepting more writes risks a false negative (admitting a genuine
//! duplicate).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::bundle::{default_bundle_identity_hasher, EntryBundle};
use crate::entry::IdentityHasher;
use crate::error::{TesseraError, TesseraResult};
use crate::layout::TILE_WIDTH;
use crate::storage::LogStore;

/// The external identity-hash -> index map. A concrete backend (Redis,
/// a SQL table, etc.) is out of scope for this crate; this seam exists so
/// the antispam component never needs to know which one is in use.
#[async_trait]
pub trait AntispamStore: Send + Sync {
    async fn get(&self, identity: &[u8; 32]) -> TesseraResult<Option<u64>>;

    /// Stores `identity -> index` if and only if `identity` is absent.
    /// Returns the index actually on record (the one just written, or a
    /// pre-existing one on a race).
    async fn put_if_absent(&self, identity: [u8; 32], index: u64) -> TesseraResult<u64>;
}

const DEFAULT_MAX_FOLLOWER_LAG: u64 = 1 << 20;

struct WriteRequest {
    identity: [u8; 32],
    index: u64,
}

/// Handle to the persistent antispam component: the buffered writer and
/// follower tasks run in the background for as long as this handle (or a
/// clone) is alive.
pub struct Antispam {
    store: Arc<dyn AntispamStore>,
    writer: mpsc::Sender<WriteRequest>,
    follower_size: Arc<AtomicU64>,
    max_follower_lag: u64,
    shutdown: tokio::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl Antispam {
    /// Spawns the buffered writer and, if `tail_store` is given, the
    /// log-tailing follower that replays newly integrated bundles into
    /// `store` through `identity_hasher` (or
    /// [`default_bundle_identity_hasher`] if `None`). `buffer_capacity`
    /// bounds how many writes may be in flight before `record` pushes back.
    pub fn new(
        store: Arc<dyn AntispamStore>,
        tail_store: Option<Arc<dyn LogStore>>,
        identity_hasher: Option<Arc<dyn IdentityHasher>>,
        buffer_capacity: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(buffer_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let follower_size = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_writer(store.clone(), rx));
        if let Some(tail_store) = tail_store {
            tokio::spawn(run_follower(
                tail_store,
                store.clone(),
                identity_hasher,
                follower_size.clone(),
                shutdown_rx,
            ));
        } else {
            drop(shutdown_rx);
        }

        Arc::new(Self {
            store,
            writer: tx,
            follower_size,
            max_follower_lag: DEFAULT_MAX_FOLLOWER_LAG,
            shutdown: tokio::sync::Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Looks up a previously recorded index for `identity`, consulting the
    /// external map directly (not the buffered write queue: an in-flight
    /// write that hasn't landed yet is, for this purpose, indistinguishable
    /// from one this replica hasn't learned about).
    pub async fn check(&self, identity: [u8; 32]) -> TesseraResult<Option<u64>> {
        self.store.get(&identity).await
    }

    /// Queues `identity -> index` to be durably recorded. Returns
    /// [`TesseraError::Pushback`] immediately, without queuing, if the
    /// writer's buffer is full or the follower has fallen too far behind.
    pub fn record(&self, identity: [u8; 32], index: u64, integrated_size: u64) -> TesseraResult<()> {
        let lag = integrated_size.saturating_sub(self.follower_size.load(Ordering::Acquire));
        if lag > self.max_follower_lag {
            return Err(TesseraError::Pushback);
        }
        self.writer
            .try_send(WriteRequest { identity, index })
            .map_err(|_| TesseraError::Pushback)
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

async fn run_writer(store: Arc<dyn AntispamStore>, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(req) = rx.recv().await {
        if let Err(e) = store.put_if_absent(req.identity, req.index).await {
            warn!(error = %e, "antispam write failed, identity will be re-learned via follower");
        }
    }
}

async fn run_follower(
    log_store: Arc<dyn LogStore>,
    antispam_store: Arc<dyn AntispamStore>,
    identity_hasher: Option<Arc<dyn IdentityHasher>>,
    follower_size: Arc<AtomicU64>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = interval.tick() => {
                if let Err(e) = catch_up(
                    &*log_store,
                    &*antispam_store,
                    identity_hasher.as_deref(),
                    &follower_size,
                ).await {
                    warn!(error = %e, "antispam follower failed to catch up; will retry next tick");
                }
            }
        }
    }
}

/// Replays every bundle between the current `follower_size` watermark and
/// the integrated tree size into `antispam_store`, advancing the watermark
/// only as far as bundles actually read and persisted. Stops (without error)
/// at the first bundle not yet durable, to be picked up on the next tick.
async fn catch_up(
    log_store: &dyn LogStore,
    antispam_store: &dyn AntispamStore,
    identity_hasher: Option<&dyn IdentityHasher>,
    follower_size: &AtomicU64,
) -> TesseraResult<()> {
    let Some(state) = log_store.read_tree_state().await? else {
        return Ok(());
    };
    let mut size = follower_size.load(Ordering::Acquire);
    if state.size <= size {
        return Ok(());
    }

    let width = TILE_WIDTH as u64;
    let mut bundle_index = size / width;
    let mut skip = (size % width) as usize;
    while bundle_index * width < state.size {
        let remaining = state.size - bundle_index * width;
        let partial_size = if remaining < width {
            Some(remaining as u8)
        } else {
            None
        };
        let bytes = match log_store.read_entry_bundle(bundle_index, partial_size).await? {
            Some(bytes) => bytes,
            None => break,
        };

        let identities: Vec<[u8; 32]> = match identity_hasher {
            Some(hasher) => EntryBundle::parse(&bytes)?
                .into_iter()
                .map(|raw| hasher.identity(raw))
                .collect(),
            None => default_bundle_identity_hasher(&bytes)?,
        };

        let bundle_start = bundle_index * width;
        for (offset, identity) in identities.iter().enumerate().skip(skip) {
            antispam_store
                .put_if_absent(*identity, bundle_start + offset as u64)
                .await?;
        }

        size = bundle_start + identities.len() as u64;
        follower_size.store(size, Ordering::Release);
        skip = 0;
        bundle_index += 1;
    }
    Ok(())
}

/// Replays one bundle's entries into `store`, used by a host's own follower
/// wiring (or directly in tests) once it has the identity hasher in hand.
pub async fn replay_bundle(
    store: &dyn AntispamStore,
    bundle_bytes: &[u8],
    base_index: u64,
    identity_of: impl Fn(&[u8]) -> [u8; 32],
) -> TesseraResult<()> {
    for (offset, raw) in EntryBundle::parse(bundle_bytes)?.into_iter().enumerate() {
        let identity = identity_of(raw);
        store
            .put_if_absent(identity, base_index + offset as u64)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapStore {
        inner: Mutex<HashMap<[u8; 32], u64>>,
    }

    #[async_trait]
    impl AntispamStore for MapStore {
        async fn get(&self, identity: &[u8; 32]) -> TesseraResult<Option<u64>> {
            Ok(self.inner.lock().get(identity).copied())
        }

        async fn put_if_absent(&self, identity: [u8; 32], index: u64) -> TesseraResult<u64> {
            let mut inner = self.inner.lock();
            Ok(*inner.entry(identity).or_insert(index))
        }
    }

    #[tokio::test]
    async fn record_then_check_round_trips() {
        let store = Arc::new(MapStore::default());
        let antispam = Antispam::new(store, None, None, 16);
        antispam.record([3u8; 32], 7, 0).unwrap();
        // Give the writer task a turn.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(antispam.check([3u8; 32]).await.unwrap(), Some(7));
        antispam.shutdown().await;
    }

    #[tokio::test]
    async fn pushback_when_follower_lag_exceeds_threshold() {
        let store = Arc::new(MapStore::default());
        let antispam = Antispam {
            store: store.clone(),
            writer: {
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(run_writer(store, rx));
                tx
            },
            follower_size: Arc::new(AtomicU64::new(0)),
            max_follower_lag: 10,
            shutdown: tokio::sync::Mutex::new(None),
        };
        let err = antispam.record([1u8; 32], 1, 100);
        assert!(matches!(err, Err(TesseraError::Pushback)));
    }
}
