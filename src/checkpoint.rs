// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! The checkpoint publisher (C6). A single background task
//! (`tokio::select!` over a timer and a shutdown signal) that periodically
//! signs and publishes the current tree state as a checkpoint, enforcing
//! that published size never regresses.
//!
//! Checkpoint text format (c2sp.org/checkpoint):
//!
//! ```text
//! <origin>
//! <decimal size>
//! <base64 root hash>
//!
//! <signature lines>
//! ```

use std::sync::Arc;

use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{TesseraError, TesseraResult};
use crate::storage::{LogStore, TreeState};

/// Signs `(size, rootHash)` into the signature lines of a checkpoint.
/// Implementations typically wrap an Ed25519 or ECDSA key; witness
/// co-signing is out of scope and is left as a
/// hook an application can layer on top by wrapping [`CheckpointSigner`].
pub trait CheckpointSigner: Send + Sync {
    /// Returns the note-signature line(s) to append below the checkpoint
    /// body, already newline-terminated.
    fn sign(&self, size: u64, root_hash: &[u8; 32]) -> TesseraResult<Vec<u8>>;
}

/// Formats a checkpoint body plus its signer-produced signature block.
pub fn format(origin: &str, state: TreeState, signature: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "{origin}\n{size}\n{root}\n\n",
        origin = origin,
        size = state.size,
        root = base64::engine::general_purpose::STANDARD.encode(state.root_hash),
    )
    .into_bytes();
    out.extend_from_slice(signature);
    out
}

/// A parsed checkpoint body (signature lines are not interpreted here; a
/// verifier is a concern of the application consuming published checkpoints).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    pub root_hash: [u8; 32],
}

pub fn parse(bytes: &[u8]) -> TesseraResult<Checkpoint> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| TesseraError::invariant("checkpoint body is not valid UTF-8"))?;
    let mut lines = text.splitn(4, '\n');
    let origin = lines
        .next()
        .ok_or_else(|| TesseraError::invariant("checkpoint missing origin line"))?
        .to_string();
    let size: u64 = lines
        .next()
        .ok_or_else(|| TesseraError::invariant("checkpoint missing size line"))?
        .parse()
        .map_err(|_| TesseraError::invariant("checkpoint size line is not a number"))?;
    let root_b64 = lines
        .next()
        .ok_or_else(|| TesseraError::invariant("checkpoint missing root hash line"))?;
    let root = base64::engine::general_purpose::STANDARD
        .decode(root_b64)
        .map_err(|_| TesseraError::invariant("checkpoint root hash is not valid base64"))?;
    let root_hash: [u8; 32] = root
        .try_into()
        .map_err(|_| TesseraError::invariant("checkpoint root hash is not 32 bytes"))?;
    Ok(Checkpoint {
        origin,
        size,
        root_hash,
    })
}

/// Handle to the running checkpoint publisher task.
pub struct PublisherHandle {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl PublisherHandle {
    /// Signals the publisher to stop after its current iteration.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns the checkpoint publisher. It wakes every `checkpoint_interval`,
/// reads the current [`TreeState`], and — only if the size has advanced
/// since the last publish — signs and writes a new checkpoint. A published
/// size must never regress.
pub fn spawn(ctx: Context, store: Arc<dyn LogStore>) -> Arc<PublisherHandle> {
    let (tx, rx) = oneshot::channel();
    let handle = Arc::new(PublisherHandle {
        shutdown: Mutex::new(Some(tx)),
    });
    tokio::spawn(run(ctx, store, rx));
    handle
}

async fn run(ctx: Context, store: Arc<dyn LogStore>, mut shutdown: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval(ctx.options.checkpoint_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_published_size: Option<u64> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("checkpoint publisher stopping");
                return;
            }
            _ = interval.tick() => {
                if let Err(e) = publish_once(&ctx, &*store, &mut last_published_size).await {
                    ctx.metrics.checkpoint_publish_errors.inc();
                    warn!(error = %e, "checkpoint publish failed");
                }
            }
        }
    }
}

async fn publish_once(
    ctx: &Context,
    store: &dyn LogStore,
    last_published_size: &mut Option<u64>,
) -> TesseraResult<()> {
    let Some(state) = store.read_tree_state().await? else {
        return Ok(());
    };
    if let Some(last) = *last_published_size {
        if state.size <= last {
            return Ok(());
        }
    }
    let signature = ctx
        .options
        .checkpoint_signer
        .sign(state.size, &state.root_hash)
        .map_err(|e| TesseraError::Signer(e.to_string()))?;
    let body = format(&ctx.origin, state, &signature);
    store.write_checkpoint(body).await?;
    *last_published_size = Some(state.size);
    ctx.metrics.checkpoints_published.inc();
    ctx.metrics.tree_size.set(state.size as i64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::storage::MemoryStore;

    struct FixedSigner;
    impl CheckpointSigner for FixedSigner {
        fn sign(&self, _size: u64, _root_hash: &[u8; 32]) -> TesseraResult<Vec<u8>> {
            Ok(b"-- test-signer ABCD\n".to_vec())
        }
    }

    #[test]
    fn format_and_parse_round_trip() {
        let state = TreeState {
            size: 42,
            root_hash: [7u8; 32],
        };
        let body = format("example.com/log", state, b"-- sig\n");
        let parsed = parse(&body).unwrap();
        assert_eq!(parsed.origin, "example.com/log");
        assert_eq!(parsed.size, 42);
        assert_eq!(parsed.root_hash, [7u8; 32]);
    }

    #[test]
    fn rejects_truncated_checkpoint() {
        assert!(parse(b"example.com/log\n10\n").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_only_when_size_advances() {
        let mut options = Options::new(Arc::new(FixedSigner));
        options.checkpoint_interval = crate::options::MIN_CHECKPOINT_INTERVAL;
        let ctx = Context::new_for_test("example.com/log", options);
        let store = MemoryStore::new();
        store
            .write_tree_state(TreeState {
                size: 5,
                root_hash: [1u8; 32],
            })
            .await
            .unwrap();

        let handle = spawn(ctx, store.clone());
        tokio::time::advance(crate::options::MIN_CHECKPOINT_INTERVAL * 2).await;
        tokio::task::yield_now().await;

        let checkpoint = store.read_checkpoint().await.unwrap();
        assert!(checkpoint.is_some());
        let parsed = parse(&checkpoint.unwrap()).unwrap();
        assert_eq!(parsed.size, 5);

        handle.stop();
    }
}
