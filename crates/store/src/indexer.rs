use std::sync::{Mutex, MutexGuard, PoisonError};

use kmirror_core::{Delta, DeltaKind, Listing, ManagedObject, ObjectKey};
use metrics::gauge;
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Default)]
struct Inner {
    items: FxHashMap<ObjectKey, ManagedObject>,
    last_sync_rv: Option<String>,
}

/// Thread-safe key -> object map holding the latest known state of the mirrored collection.
///
/// One lock guards the whole map and is held only for a single map operation. The
/// controller loop is the only writer; readers get copies.
#[derive(Default)]
pub struct Store {
    inner: Mutex<Inner>,
}

/// What a `Store::apply` did to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Removed,
    /// Deleted an absent key, or re-affirmed with `Synced`.
    Unchanged,
}

/// Key counts touched by a `Store::replace`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl Store {
    pub fn new() -> Self { Self::default() }

    // Every critical section leaves the map consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Atomically set the entire contents to `listing`; keys absent from it are dropped.
    pub fn replace(&self, listing: Listing) -> ReplaceSummary {
        let mut next: FxHashMap<ObjectKey, ManagedObject> = FxHashMap::default();
        next.reserve(listing.items.len());
        for obj in listing.items {
            next.insert(obj.key.clone(), obj);
        }
        let mut inner = self.lock();
        let mut summary = ReplaceSummary::default();
        for (k, obj) in next.iter() {
            match inner.items.get(k) {
                None => summary.added += 1,
                Some(prev) if prev.resource_version != obj.resource_version => summary.updated += 1,
                Some(_) => {}
            }
        }
        summary.removed = inner.items.keys().filter(|k| !next.contains_key(*k)).count();
        inner.items = next;
        inner.last_sync_rv = Some(listing.resource_version);
        gauge!("kmirror_store_items", inner.items.len() as f64);
        summary
    }

    /// Apply one delta. Added/Updated overwrite by key, Deleted removes if present,
    /// Synced never writes: it neither overwrites nor resurrects.
    pub fn apply(&self, delta: Delta) -> Applied {
        let mut inner = self.lock();
        let out = match delta.kind {
            DeltaKind::Added | DeltaKind::Updated => {
                inner.last_sync_rv = Some(delta.object.resource_version.clone());
                match inner.items.insert(delta.object.key.clone(), delta.object) {
                    Some(_) => Applied::Replaced,
                    None => Applied::Inserted,
                }
            }
            DeltaKind::Deleted => {
                inner.last_sync_rv = Some(delta.object.resource_version.clone());
                match inner.items.remove(&delta.object.key) {
                    Some(_) => Applied::Removed,
                    None => {
                        debug!(key = %delta.object.key, "store: delete of absent key");
                        Applied::Unchanged
                    }
                }
            }
            DeltaKind::Synced => Applied::Unchanged,
        };
        gauge!("kmirror_store_items", inner.items.len() as f64);
        out
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.lock().items.get(key).cloned()
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool { self.lock().items.contains_key(key) }

    /// Keys present at call time, sorted.
    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.lock().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Copy of every stored object, sorted by key.
    pub fn list(&self) -> Vec<ManagedObject> {
        let mut items: Vec<ManagedObject> = self.lock().items.values().cloned().collect();
        items.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        items
    }

    /// `(key, object)` for everything stored, used to synthesize Synced deltas.
    pub fn resync(&self) -> Vec<(ObjectKey, ManagedObject)> {
        self.lock().items.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize { self.lock().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Cursor of the latest listing or applied watch delta.
    pub fn last_sync_resource_version(&self) -> Option<String> { self.lock().last_sync_rv.clone() }
}
