// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! The migration target (C9): copies an existing log's entry
//! bundles into a new backend, integrating them as it goes, and fails fatally
//! if the destination's resulting root does not match the source's: a
//! bounded pool of workers pulling work items off a shared cursor, each
//! retried with exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::error::{TesseraError, TesseraResult};
use crate::metrics::Metrics;

/// Destination of a migration: an existing [`crate::Appender`]-backed log (or
/// any implementation accepting raw bundle writes), exposed only through the
/// two operations migration needs.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Writes one (possibly partial) entry bundle at `bundle_index`,
    /// superseding any earlier partial write at the same index
    ///.
    async fn set_entry_bundle(
        &self,
        bundle_index: u64,
        partial_size: Option<u8>,
        data: Vec<u8>,
    ) -> TesseraResult<()>;

    /// Blocks until the destination's tree has integrated at least
    /// `tree_size` entries, returning the root hash observed at that size.
    async fn await_integration(&self, tree_size: u64) -> TesseraResult<[u8; 32]>;
}

/// One bundle to be copied: its index, fill (`None` = full 256 entries), and
/// raw bytes, as read from the source log.
pub struct SourceBundle {
    pub bundle_index: u64,
    pub partial_size: Option<u8>,
    pub data: Vec<u8>,
}

/// Describes a migration: how many bundles to copy and the root the
/// destination must reach once they have all landed and integrated.
pub struct MigrationJob {
    pub bundle_count: u64,
    pub total_size: u64,
    pub expected_root: [u8; 32],
}

const MAX_ATTEMPTS: u32 = 10;
const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Runs one migration to completion: spawns `worker_count` workers, each
/// pulling the next not-yet-copied bundle index from a shared cursor and
/// copying it via `fetch_bundle` + [`MigrationTarget::set_entry_bundle`],
/// retried with exponential backoff up to [`MAX_ATTEMPTS`] times. Once every
/// bundle has landed, awaits integration up to `total_size` and fails fatally
/// (`TesseraError::Invariant`) if the destination's root disagrees with
/// `expected_root`.
pub async fn migrate(
    target: Arc<dyn MigrationTarget>,
    fetch_bundle: Arc<dyn Fn(u64) -> BoxFuture<'static, TesseraResult<SourceBundle>> + Send + Sync>,
    job: MigrationJob,
    worker_count: usize,
    metrics: Arc<Metrics>,
) -> TesseraResult<()> {
    let cursor = Arc::new(AtomicU64::new(0));
    let mut workers = Vec::with_capacity(worker_count.max(1));

    for worker_id in 0..worker_count.max(1) {
        let cursor = cursor.clone();
        let target = target.clone();
        let fetch_bundle = fetch_bundle.clone();
        let bundle_count = job.bundle_count;
        let metrics = metrics.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= bundle_count {
                    return Ok::<(), TesseraError>(());
                }
                copy_one_with_retry(worker_id, &*target, &*fetch_bundle, index, &metrics).await?;
            }
        }));
    }

    for worker in workers {
        worker
            .await
            .map_err(|e| TesseraError::invariant(format!("migration worker panicked: {e}")))??;
    }

    let actual_root = target.await_integration(job.total_size).await?;
    if actual_root != job.expected_root {
        error!(
            expected = %hex(&job.expected_root),
            actual = %hex(&actual_root),
            "migration root mismatch"
        );
        return Err(TesseraError::invariant(
            "migration destination root does not match source root",
        ));
    }
    info!(total_size = job.total_size, "migration completed");
    Ok(())
}

async fn copy_one_with_retry(
    worker_id: usize,
    target: &dyn MigrationTarget,
    fetch_bundle: &(dyn Fn(u64) -> BoxFuture<'static, TesseraResult<SourceBundle>> + Send + Sync),
    bundle_index: u64,
    metrics: &Metrics,
) -> TesseraResult<()> {
    let mut backoff = BASE_BACKOFF;
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        let result = async {
            let bundle = fetch_bundle(bundle_index).await?;
            target
                .set_entry_bundle(bundle.bundle_index, bundle.partial_size, bundle.data)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                metrics.migration_bundles_copied.inc();
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(
                    worker_id,
                    bundle_index,
                    attempt,
                    error = %e,
                    "retrying bundle copy after transient error"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| TesseraError::invariant("migration retry loop exhausted")))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(&prometheus::Registry::new()))
    }

    #[derive(Default)]
    struct FakeTarget {
        bundles: Mutex<HashMap<u64, Vec<u8>>>,
        root: [u8; 32],
    }

    #[async_trait]
    impl MigrationTarget for FakeTarget {
        async fn set_entry_bundle(
            &self,
            bundle_index: u64,
            _partial_size: Option<u8>,
            data: Vec<u8>,
        ) -> TesseraResult<()> {
            self.bundles.lock().insert(bundle_index, data);
            Ok(())
        }

        async fn await_integration(&self, _tree_size: u64) -> TesseraResult<[u8; 32]> {
            Ok(self.root)
        }
    }

    #[tokio::test]
    async fn copies_all_bundles_and_verifies_root() {
        let target = Arc::new(FakeTarget {
            root: [9u8; 32],
            ..Default::default()
        });
        let fetch: Arc<dyn Fn(u64) -> BoxFuture<'static, TesseraResult<SourceBundle>> + Send + Sync> =
            Arc::new(|i: u64| {
                Box::pin(async move {
                    Ok(SourceBundle {
                        bundle_index: i,
                        partial_size: None,
                        data: vec![i as u8; 4],
                    })
                })
            });

        let job = MigrationJob {
            bundle_count: 20,
            total_size: 20 * 256,
            expected_root: [9u8; 32],
        };
        let metrics = test_metrics();
        migrate(target.clone(), fetch, job, 4, metrics.clone())
            .await
            .unwrap();
        assert_eq!(target.bundles.lock().len(), 20);
        assert_eq!(metrics.migration_bundles_copied.get(), 20);
    }

    #[tokio::test]
    async fn fails_fatally_on_root_mismatch() {
        let target = Arc::new(FakeTarget {
            root: [1u8; 32],
            ..Default::default()
        });
        let fetch: Arc<dyn Fn(u64) -> BoxFuture<'static, TesseraResult<SourceBundle>> + Send + Sync> =
            Arc::new(|i: u64| {
                Box::pin(async move {
                    Ok(SourceBundle {
                        bundle_index: i,
                        partial_size: None,
                        data: vec![0u8; 4],
                    })
                })
            });
        let job = MigrationJob {
            bundle_count: 1,
            total_size: 256,
            expected_root: [2u8; 32],
        };
        let err = migrate(target, fetch, job, 1, test_metrics()).await;
        assert!(matches!(err, Err(TesseraError::Invariant(_))));
    }

    #[tokio::test]
    async fn retries_transient_fetch_errors() {
        struct FlakyTarget(Mutex<usize>);
        #[async_trait]
        impl MigrationTarget for FlakyTarget {
            async fn set_entry_bundle(
                &self,
                _bundle_index: u64,
                _partial_size: Option<u8>,
                _data: Vec<u8>,
            ) -> TesseraResult<()> {
                let mut count = self.0.lock();
                *count += 1;
                if *count < 3 {
                    Err(TesseraError::io("transient"))
                } else {
                    Ok(())
                }
            }
            async fn await_integration(&self, _tree_size: u64) -> TesseraResult<[u8; 32]> {
                Ok([3u8; 32])
            }
        }

        let target = Arc::new(FlakyTarget(Mutex::new(0)));
        let fetch: Arc<dyn Fn(u64) -> BoxFuture<'static, TesseraResult<SourceBundle>> + Send + Sync> =
            Arc::new(|i: u64| {
                Box::pin(async move {
                    Ok(SourceBundle {
                        bundle_index: i,
                        partial_size: None,
                        data: vec![],
                    })
                })
            });
        let job = MigrationJob {
            bundle_count: 1,
            total_size: 256,
            expected_root: [3u8; 32],
        };
        migrate(target.clone(), fetch, job, 1, test_metrics())
            .await
            .unwrap();
        assert_eq!(*target.0.lock(), 3);
    }
}
