// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! The batching queue (C2). Accumulates [`crate::entry::Entry`]
//! submissions behind a single background task, flushing a batch to the
//! sequencer when it reaches `batchMaxSize` or `batchMaxAge` elapses since the
//! oldest unflushed entry, whichever comes first. Callers never touch
//! shared mutable state directly; they send a command over a channel and
//! await a oneshot reply.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::context::Context;
use crate::entry::{Entry, Index};
use crate::error::{TesseraError, TesseraResult};

type FlushFn = Arc<
    dyn Fn(Vec<Entry>) -> futures::future::BoxFuture<'static, TesseraResult<Vec<Index>>>
        + Send
        + Sync,
>;

enum Command {
    Add {
        entry: Entry,
        reply: oneshot::Sender<TesseraResult<Index>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running batcher. Cloning is cheap; all clones share the same
/// background task and queue.
#[derive(Clone)]
pub struct BatcherHandle {
    sender: mpsc::Sender<Command>,
    outstanding: Arc<AtomicUsize>,
    max_outstanding: usize,
}

impl BatcherHandle {
    /// Queues `entry` for sequencing, returning its assigned [`Index`] once a
    /// batch containing it has been durably sequenced and integrated.
    ///
    /// Returns [`TesseraError::Pushback`] immediately, without queuing,
    /// when the number of entries already in flight has reached
    /// `pushbackMaxOutstanding`.
    pub async fn add(&self, entry: Entry) -> TesseraResult<Index> {
        if self.outstanding.load(Ordering::Acquire) >= self.max_outstanding {
            return Err(TesseraError::Pushback);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = oneshot::channel();
        let send_result = self.sender.send(Command::Add { entry, reply: tx }).await;
        if send_result.is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(TesseraError::invariant("batcher task is no longer running"));
        }
        let result = rx
            .await
            .unwrap_or_else(|_| Err(TesseraError::invariant("batcher task dropped the reply")));
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Forces an immediate flush of whatever is currently queued, regardless
    /// of `batchMaxSize`/`batchMaxAge`. Intended for graceful shutdown and
    /// for tests; not part of the steady-state path.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Flush { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawns the batcher background task, returning a [`BatcherHandle`]. `seq`
/// is invoked with each accumulated batch and must return one [`Index`] per
/// entry, in the same order.
pub fn spawn(
    ctx: Context,
    seq: impl Fn(Vec<Entry>) -> futures::future::BoxFuture<'static, TesseraResult<Vec<Index>>>
        + Send
        + Sync
        + 'static,
) -> BatcherHandle {
    let max_outstanding = ctx.options.pushback_max_outstanding;
    let (sender, receiver) = mpsc::channel(max_outstanding.max(1));
    let outstanding = Arc::new(AtomicUsize::new(0));
    let flush_fn: FlushFn = Arc::new(seq);

    tokio::spawn(run(ctx, receiver, flush_fn));

    BatcherHandle {
        sender,
        outstanding,
        max_outstanding,
    }
}

struct Pending {
    entry: Entry,
    reply: oneshot::Sender<TesseraResult<Index>>,
}

async fn run(ctx: Context, mut receiver: mpsc::Receiver<Command>, seq: FlushFn) {
    let max_size = ctx.options.batch_max_size;
    let max_age = ctx.options.batch_max_age;
    let mut pending: Vec<Pending> = Vec::with_capacity(max_size);
    let mut drain_requests: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        let deadline = if pending.is_empty() {
            None
        } else {
            Some(Instant::now() + max_age)
        };

        let command = match deadline {
            Some(deadline) => tokio::select! {
                biased;
                cmd = receiver.recv() => cmd,
                _ = tokio::time::sleep_until(deadline) => {
                    trace!(batch_size = pending.len(), "batch max age elapsed");
                    flush(&ctx, &seq, &mut pending).await;
                    continue;
                }
            },
            None => receiver.recv().await,
        };

        let Some(command) = command else {
            debug!("batcher channel closed, flushing remaining entries and exiting");
            flush(&ctx, &seq, &mut pending).await;
            for reply in drain_requests.drain(..) {
                let _ = reply.send(());
            }
            return;
        };

        match command {
            Command::Add { entry, reply } => {
                pending.push(Pending { entry, reply });
                if pending.len() >= max_size {
                    flush(&ctx, &seq, &mut pending).await;
                }
            }
            Command::Flush { reply } => {
                flush(&ctx, &seq, &mut pending).await;
                let _ = reply.send(());
            }
        }
    }
}

async fn flush(ctx: &Context, seq: &FlushFn, pending: &mut Vec<Pending>) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<Pending> = pending.drain(..).collect();
    let entries: Vec<Entry> = batch.iter().map(|p| p.entry.clone()).collect();
    let batch_len = entries.len();

    match seq(entries).await {
        Ok(indices) if indices.len() == batch_len => {
            ctx.metrics.batches_sequenced.inc();
            for (p, index) in batch.into_iter().zip(indices) {
                let _ = p.reply.send(Ok(index));
            }
        }
        Ok(indices) => {
            ctx.metrics.sequence_errors.inc();
            warn!(
                batch_len,
                returned = indices.len(),
                "sequencer returned a mismatched index count"
            );
            let err = TesseraError::invariant("sequencer returned a mismatched index count");
            for p in batch {
                let _ = p.reply.send(Err(err.clone()));
            }
        }
        Err(e) => {
            ctx.metrics.sequence_errors.inc();
            for p in batch {
                let _ = p.reply.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use std::sync::Mutex as StdMutex;

    struct NoopSigner;
    impl crate::checkpoint::CheckpointSigner for NoopSigner {
        fn sign(&self, _size: u64, _root: &[u8; 32]) -> TesseraResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn test_context(max_size: usize, max_age: Duration) -> Context {
        let mut options = Options::new(Arc::new(NoopSigner));
        options.batch_max_size = max_size;
        options.batch_max_age = max_age;
        options.pushback_max_outstanding = 8;
        Context::new_for_test("test-origin".to_string(), options)
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_max_size() {
        let ctx = test_context(2, Duration::from_secs(60));
        let calls = Arc::new(StdMutex::new(0usize));
        let calls2 = calls.clone();
        let handle = spawn(ctx, move |entries: Vec<Entry>| {
            let calls = calls2.clone();
            Box::pin(async move {
                *calls.lock().unwrap() += 1;
                Ok((0..entries.len() as u64).map(Index::new).collect())
            })
        });

        let a = handle.add(Entry::new(b"a".to_vec()));
        let b = handle.add(Entry::new(b"b".to_vec()));
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_max_age() {
        let ctx = test_context(100, Duration::from_millis(50));
        let handle = spawn(ctx, |entries: Vec<Entry>| {
            Box::pin(async move { Ok((0..entries.len() as u64).map(Index::new).collect()) })
        });

        let fut = handle.add(Entry::new(b"solo".to_vec()));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(fut.await.is_ok());
    }

    #[tokio::test]
    async fn pushback_when_outstanding_limit_reached() {
        let ctx = test_context(1, Duration::from_secs(60));
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);
        let handle = spawn(ctx, move |entries: Vec<Entry>| {
            let mut gate_rx = gate_rx.clone();
            Box::pin(async move {
                let _ = gate_rx.changed().await;
                Ok((0..entries.len() as u64).map(Index::new).collect())
            })
        });

        // outstanding limit is 8; fill it, then the next add must pushback.
        let mut futs = Vec::new();
        for i in 0..8u8 {
            futs.push(handle.add(Entry::new(vec![i])));
        }
        let rejected = handle.add(Entry::new(b"over".to_vec())).await;
        assert!(matches!(rejected, Err(TesseraError::Pushback)));

        let _ = gate_tx.send(true);
        for f in futs {
            let _ = f.await;
        }
    }
}
