use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kmirror_core::{Delta, DeltaKind, Listing, ObjectKey};
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// What the controller loop receives from `DeltaQueue::pop`.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A fresh full listing; the store must be replaced wholesale.
    Replace(Listing),
    Delta(Delta),
}

#[derive(Default)]
struct State {
    pending: FxHashMap<ObjectKey, Delta>,
    order: VecDeque<ObjectKey>,
    replace: Option<Listing>,
    populated: bool,
    synced: bool,
    closed: bool,
}

impl State {
    fn take_next(&mut self) -> Option<QueueItem> {
        if let Some(listing) = self.replace.take() {
            return Some(QueueItem::Replace(listing));
        }
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.pending.remove(&key) {
                return Some(QueueItem::Delta(d));
            }
        }
        None
    }
}

/// Fold a newly pushed delta into the one already pending for the same key.
pub fn merge(pending: Delta, incoming: Delta) -> Delta {
    use DeltaKind::*;
    match (pending.kind, incoming.kind) {
        (_, Deleted) => incoming,
        (Added, Updated) => Delta::added(incoming.object),
        // the key went away and came back: a fresh add
        (Deleted, Added | Updated) => Delta::added(incoming.object),
        // a pending change is at least as new as the store copy behind a resync
        (Added | Updated | Deleted, Synced) => pending,
        (Synced, _) | (Updated, _) | (Added, Added) => incoming,
    }
}

/// Deduplicating queue of pending changes keyed by object identity.
///
/// At most one delta is pending per key; keys pop in first-push order. A listing
/// pushed with `replace` supersedes everything pending and pops before anything
/// pushed after it.
pub struct DeltaQueue {
    state: Mutex<State>,
    notify: Notify,
    synced: watch::Sender<bool>,
}

impl Default for DeltaQueue {
    fn default() -> Self { Self::new() }
}

impl DeltaQueue {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new(), synced: watch::channel(false).0 }
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Append or merge. Returns false once the queue is closed.
    pub fn push(&self, d: Delta) -> bool {
        let mut st = self.lock();
        if st.closed {
            return false;
        }
        let key = d.object.key.clone();
        match st.pending.remove(&key) {
            Some(prev) => {
                let merged = merge(prev, d);
                st.pending.insert(key, merged);
            }
            None => {
                st.order.push_back(key.clone());
                st.pending.insert(key, d);
            }
        }
        drop(st);
        self.notify.notify_one();
        true
    }

    /// Queue a full listing. Pending deltas predate the listing and are discarded.
    pub fn replace(&self, listing: Listing) -> bool {
        let mut st = self.lock();
        if st.closed {
            return false;
        }
        let discarded = st.pending.len();
        st.pending.clear();
        st.order.clear();
        st.replace = Some(listing);
        st.populated = true;
        drop(st);
        if discarded > 0 {
            debug!(discarded, "queue: pending deltas superseded by listing");
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item and hand it to `process` while still holding the queue
    /// lock, so `has_synced` flips only once a listing has actually been applied.
    /// Returns `None` once the queue is closed.
    pub async fn pop<F, R>(&self, process: F) -> Option<R>
    where
        F: FnOnce(QueueItem) -> R,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.closed {
                    return None;
                }
                if let Some(item) = st.take_next() {
                    let is_replace = matches!(item, QueueItem::Replace(_));
                    let out = process(item);
                    if is_replace {
                        self.mark_synced(&mut st);
                    }
                    return Some(out);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of `pop`.
    pub fn try_pop(&self) -> Option<QueueItem> {
        let mut st = self.lock();
        if st.closed {
            return None;
        }
        let item = st.take_next();
        if matches!(item, Some(QueueItem::Replace(_))) {
            self.mark_synced(&mut st);
        }
        item
    }

    fn mark_synced(&self, st: &mut State) {
        if !st.synced {
            st.synced = true;
            self.synced.send_replace(true);
        }
    }

    /// True once the first listing has been popped and processed.
    pub fn has_synced(&self) -> bool {
        let st = self.lock();
        st.populated && st.synced
    }

    /// Resolves once the first listing has been popped and processed.
    pub async fn synced(&self) {
        let mut rx = self.synced.subscribe();
        // the sender lives as long as `self`, so this only returns once synced
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Release any blocked `pop`; later pushes are refused.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool { self.lock().closed }

    /// Pending keys, plus one for a pending listing.
    pub fn len(&self) -> usize {
        let st = self.lock();
        st.pending.len() + usize::from(st.replace.is_some())
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
