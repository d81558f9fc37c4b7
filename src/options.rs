// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use crate::bundle::BundleLeafHasher;
use crate::checkpoint::CheckpointSigner;
use crate::dedup::antispam::Antispam;
use crate::entry::IdentityHasher;

/// Default maximum number of entries flushed as a single batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 256;
/// Default maximum time an entry waits in an open batch before it is flushed.
pub const DEFAULT_BATCH_MAX_AGE: Duration = Duration::from_millis(250);
/// Default back-pressure threshold for outstanding, unflushed entries.
pub const DEFAULT_PUSHBACK_MAX_OUTSTANDING: usize = 4096;
/// Default checkpoint publish period.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
/// Minimum allowed checkpoint interval
pub const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);
/// Default poll period used by the integration awaiter.
pub const DEFAULT_AWAITER_POLL_PERIOD: Duration = Duration::from_millis(200);
/// Default bound on in-memory dedup LRU entries.
pub const DEFAULT_IN_MEMORY_DEDUP_SIZE: usize = 4096;

/// Configuration recognized by [`crate::Appender`]
///
/// There is deliberately no flag-parsing or env-var layer here: Tessera is an
/// embedded library, and the host process is responsible for turning its own
/// configuration surface into an `Options` value.
#[derive(Clone)]
pub struct Options {
    /// Max entries per batch flush.
    pub batch_max_size: usize,
    /// Max queue latency for an entry before its batch is flushed.
    pub batch_max_age: Duration,
    /// Back-pressure threshold; exceeding it returns `ErrPushback` from `Add`.
    pub pushback_max_outstanding: usize,
    /// Period of the checkpoint publisher task. Must be >= 1s.
    pub checkpoint_interval: Duration,
    /// Required: signs `(size, rootHash)` into a published checkpoint.
    pub checkpoint_signer: Arc<dyn CheckpointSigner>,
    /// Poll period used by [`crate::awaiter::Awaiter`].
    pub awaiter_poll_period: Duration,
    /// Override bundle artifact naming (CT logs use `tile/data/...`).
    pub entries_path: Option<String>,
    /// Per-entry identity hash used for in-memory/persistent dedup.
    /// Defaults to SHA-256 of the entry's data.
    pub identity_hasher: Option<Arc<dyn IdentityHasher>>,
    /// Bound on the in-memory dedup LRU. `None` disables in-memory dedup.
    pub in_memory_dedup_size: Option<usize>,
    /// Optional persistent antispam component (C7 persistent antispam).
    pub antispam: Option<Arc<Antispam>>,
    /// Per-entry RFC-6962 leaf hash used for migration integration. `None`
    /// falls back to [`crate::bundle::default_bundle_leaf_hasher`]; a
    /// CT-shaped migration whose leaf hash depends on assigned index
    /// supplies its own here.
    pub bundle_leaf_hasher: Option<Arc<BundleLeafHasher>>,
}

impl Options {
    pub fn new(checkpoint_signer: Arc<dyn CheckpointSigner>) -> Self {
        Self {
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_max_age: DEFAULT_BATCH_MAX_AGE,
            pushback_max_outstanding: DEFAULT_PUSHBACK_MAX_OUTSTANDING,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            checkpoint_signer,
            awaiter_poll_period: DEFAULT_AWAITER_POLL_PERIOD,
            entries_path: None,
            identity_hasher: None,
            in_memory_dedup_size: Some(DEFAULT_IN_MEMORY_DEDUP_SIZE),
            antispam: None,
            bundle_leaf_hasher: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::TesseraError> {
        if self.checkpoint_interval < MIN_CHECKPOINT_INTERVAL {
            return Err(crate::error::TesseraError::invariant(format!(
                "checkpoint_interval must be >= {:?}, got {:?}",
                MIN_CHECKPOINT_INTERVAL, self.checkpoint_interval
            )));
        }
        if self.batch_max_size == 0 {
            return Err(crate::error::TesseraError::invariant(
                "batch_max_size must be > 0",
            ));
        }
        Ok(())
    }
}
