// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory dedup decorator: an LRU of
//! identity hash -> in-flight/assigned index, bounded by
//! `Options::in_memory_dedup_size`. A failed `Add` is never cached, so a
//! transient error does not pin an entry to a permanent rejection.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::Shared;
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;

use crate::entry::{Entry, Index};
use crate::error::{TesseraError, TesseraResult};

type SharedIndex = Shared<futures::future::BoxFuture<'static, Result<Index, TesseraError>>>;

/// Wraps an `add` function with an in-memory LRU of identity hash -> index
/// future, so concurrent duplicate submissions join the same in-flight
/// sequencing call instead of each being queued separately.
pub struct InMemoryDedup {
    cache: Mutex<LruCache<[u8; 32], SharedIndex>>,
}

impl InMemoryDedup {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Looks up or creates the shared index future for `entry`'s identity,
    /// invoking `add` at most once per distinct identity while it remains in
    /// the cache. `add` is expected to mark indices returned for a
    /// previously-seen identity as [`Index::dup_of`], same as `add` itself
    /// would for a persistent-antispam hit.
    pub async fn add(
        &self,
        entry: Entry,
        add: impl FnOnce(Entry) -> futures::future::BoxFuture<'static, TesseraResult<Index>>,
    ) -> TesseraResult<Index> {
        let identity = entry.identity();

        // Presence-check and insert happen under one lock acquisition, with
        // no await in between, so at most one `add` delegate is launched per
        // identity even when two callers race on a first submission.
        let (fut, is_new): (SharedIndex, bool) = {
            let mut cache = self.cache.lock();
            if let Some(shared) = cache.get(&identity) {
                (shared.clone(), false)
            } else {
                let fut: SharedIndex = add(entry).boxed().shared();
                cache.put(identity, fut.clone());
                (fut, true)
            }
        };

        if !is_new {
            return fut.await.map(|idx| {
                if idx.is_dup {
                    idx
                } else {
                    Index::dup_of(idx.index)
                }
            });
        }

        let result = fut.await;
        if result.is_err() {
            // Never pin a transient failure: let the next caller retry fresh.
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.peek(&identity) {
                if cached.peek().map(|r| r.is_err()).unwrap_or(false) {
                    cache.pop(&identity);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_duplicates_join_one_underlying_add() {
        let dedup = Arc::new(InMemoryDedup::new(16));
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |dedup: Arc<InMemoryDedup>, calls: Arc<AtomicUsize>| async move {
            let entry = Entry::with_identity(b"same".to_vec(), [1u8; 32]);
            dedup
                .add(entry, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(Index::new(5)) })
                })
                .await
        };

        let (a, b) = tokio::join!(run(dedup.clone(), calls.clone()), run(dedup, calls.clone()));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_add_is_not_cached() {
        let dedup = InMemoryDedup::new(16);
        let calls = Arc::new(AtomicUsize::new(0));

        let entry = Entry::with_identity(b"x".to_vec(), [2u8; 32]);
        let calls2 = calls.clone();
        let first = dedup
            .add(entry, move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(TesseraError::io("boom")) })
            })
            .await;
        assert!(first.is_err());

        let entry = Entry::with_identity(b"x".to_vec(), [2u8; 32]);
        let calls3 = calls.clone();
        let second = dedup
            .add(entry, move |_| {
                calls3.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(Index::new(9)) })
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
