//! The controller loop: sole writer of the store.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kmirror_core::Delta;
use kmirror_store::{apply_item, DeltaQueue, QueueItem, Store};
use metrics::counter;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) struct LoopCtx {
    pub store: Arc<Store>,
    pub queue: Arc<DeltaQueue>,
    pub cancel: CancellationToken,
    pub resync_period: Duration,
    /// Unix seconds of the last resync, 0 when none happened yet.
    pub last_resync: Arc<AtomicI64>,
}

fn resync_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut iv = interval_at(Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(iv)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Re-affirm everything stored as Synced deltas. Skipped until the first listing landed.
fn enqueue_resync(store: &Store, queue: &DeltaQueue, last_resync: &AtomicI64) {
    if !queue.has_synced() {
        debug!("controller: resync skipped; initial listing not applied yet");
        return;
    }
    let pairs = store.resync();
    let n = pairs.len();
    for (_, obj) in pairs {
        if !queue.push(Delta::synced(obj)) {
            return;
        }
    }
    last_resync.store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    counter!("kmirror_resync_total", 1u64);
    debug!(items = n, "controller: resync enqueued");
}

fn process(store: &Store, item: QueueItem) {
    let label = match &item {
        QueueItem::Delta(d) => Some((d.object.key.to_string(), d.kind)),
        QueueItem::Replace(_) => None,
    };
    let applied = apply_item(store, item);
    if let Some((key, kind)) = label {
        debug!(key = %key, kind = kind.as_str(), applied = ?applied, "controller: applied");
    }
}

/// Drain the queue into the store and fire the resync timer until cancelled.
pub(crate) async fn run_loop(ctx: LoopCtx) {
    let LoopCtx { store, queue, cancel, resync_period, last_resync } = ctx;
    info!(resync_secs = resync_period.as_secs(), "controller: loop started");
    let mut timer = resync_timer(resync_period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick(&mut timer) => enqueue_resync(&store, &queue, &last_resync),
            popped = queue.pop(|item| process(&store, item)) => {
                if popped.is_none() {
                    break;
                }
            }
        }
    }
    // waits for an in-flight apply, then refuses further work
    queue.close();
    info!(items = store.len(), "controller: loop stopped");
}
