// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! The integration awaiter (C8). A single background task
//! polls the published checkpoint at `awaiterPollPeriod` and resolves any
//! waiter whose target index has become visible in it, delivering the
//! checkpoint bytes themselves (not just the size), so a caller who awaits
//! an add walks away with a signed artifact proving its entry's inclusion.
//! Callers never poll storage themselves; they register interest and await
//! a oneshot reply.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::checkpoint;
use crate::context::Context;
use crate::storage::LogStore;

struct Waiter {
    /// Resolves once a published checkpoint covers size `> target_index`.
    target_index: u64,
    reply: oneshot::Sender<Vec<u8>>,
}

enum Command {
    Wait {
        target_index: u64,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Handle to the running awaiter task.
#[derive(Clone)]
pub struct AwaiterHandle {
    sender: mpsc::Sender<Command>,
}

impl AwaiterHandle {
    /// Waits until `target_index` is covered by a published checkpoint,
    /// returning that checkpoint's raw bytes. Dropping the returned future
    /// before it resolves cancels the wait with no further effect.
    pub async fn await_integration(&self, target_index: u64) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Command::Wait {
                target_index,
                reply: tx,
            })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }
}

/// Spawns the awaiter background task.
pub fn spawn(ctx: Context, store: Arc<dyn LogStore>) -> AwaiterHandle {
    let (sender, receiver) = mpsc::channel(1024);
    tokio::spawn(run(ctx, store, receiver));
    AwaiterHandle { sender }
}

async fn run(ctx: Context, store: Arc<dyn LogStore>, mut receiver: mpsc::Receiver<Command>) {
    let mut waiters: Vec<Waiter> = Vec::new();
    let mut interval = tokio::time::interval(ctx.options.awaiter_poll_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            cmd = receiver.recv() => {
                match cmd {
                    Some(Command::Wait { target_index, reply }) => {
                        ctx.metrics.awaiter_waiters.inc();
                        waiters.push(Waiter { target_index, reply });
                        // A target already covered by a published checkpoint
                        // should resolve without waiting for the next tick.
                        if let Ok(Some(bytes)) = store.read_checkpoint().await {
                            resolve_ready(&ctx, &mut waiters, &bytes);
                        }
                    }
                    None => {
                        trace!("awaiter channel closed, exiting");
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                if waiters.is_empty() {
                    continue;
                }
                if let Ok(Some(bytes)) = store.read_checkpoint().await {
                    resolve_ready(&ctx, &mut waiters, &bytes);
                }
            }
        }
    }
}

fn resolve_ready(ctx: &Context, waiters: &mut Vec<Waiter>, checkpoint_bytes: &[u8]) {
    let Ok(parsed) = checkpoint::parse(checkpoint_bytes) else {
        return;
    };
    let mut remaining = Vec::with_capacity(waiters.len());
    for waiter in waiters.drain(..) {
        if parsed.size > waiter.target_index {
            ctx.metrics.awaiter_waiters.dec();
            let _ = waiter.reply.send(checkpoint_bytes.to_vec());
        } else {
            remaining.push(waiter);
        }
    }
    *waiters = remaining;
}
