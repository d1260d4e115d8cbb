//! kmirror store: the indexer holding the mirrored collection and the
//! deduplicating delta queue that feeds it.

#![forbid(unsafe_code)]

mod indexer;
mod queue;

pub use indexer::{Applied, ReplaceSummary, Store};
pub use queue::{merge, DeltaQueue, QueueItem};

/// Apply one queue item to the store. This is the controller loop's write path.
pub fn apply_item(store: &Store, item: QueueItem) -> Option<Applied> {
    match item {
        QueueItem::Replace(listing) => {
            let rv = listing.resource_version.clone();
            let summary = store.replace(listing);
            tracing::info!(rv = %rv, added = summary.added, updated = summary.updated, removed = summary.removed, "store: replaced from listing");
            None
        }
        QueueItem::Delta(d) => Some(store.apply(d)),
    }
}
