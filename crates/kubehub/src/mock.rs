use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use futures::{channel::mpsc, StreamExt};
use kmirror_core::{Listing, ManagedObject, ObjectKey};

use crate::{ClusterClient, WatchError, WatchEvent, WatchStream};

type WatchItem = std::result::Result<WatchEvent, WatchError>;

#[derive(Default)]
struct MockState {
    lists: VecDeque<std::result::Result<Listing, String>>,
    watches: VecDeque<mpsc::UnboundedReceiver<WatchItem>>,
    /// Latest listing served, repeated once the script runs dry.
    last_listing: Option<Listing>,
    objects: BTreeMap<ObjectKey, ManagedObject>,
    list_calls: usize,
    watch_cursors: Vec<String>,
    updates: Vec<ManagedObject>,
}

/// Scripted in-memory cluster for tests and demos.
///
/// Listings and watch streams are handed out in the order they were scripted.
/// A watch with nothing scripted stays open and silent.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

/// Sending side of a scripted watch stream. Dropping it ends the stream.
#[derive(Debug, Clone)]
pub struct WatchFeed {
    tx: mpsc::UnboundedSender<WatchItem>,
}

impl WatchFeed {
    fn send(&self, item: WatchItem) { let _ = self.tx.unbounded_send(item); }

    pub fn added(&self, o: ManagedObject) { self.send(Ok(WatchEvent::Added(o))) }
    pub fn modified(&self, o: ManagedObject) { self.send(Ok(WatchEvent::Modified(o))) }
    pub fn deleted(&self, o: ManagedObject) { self.send(Ok(WatchEvent::Deleted(o))) }
    pub fn bookmark(&self, rv: &str) { self.send(Ok(WatchEvent::Bookmark(rv.to_string()))) }
    pub fn error(&self, e: WatchError) { self.send(Err(e)) }

    /// End the stream, as when the server closes the connection.
    pub fn close(self) { self.tx.close_channel(); }
}

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, MockState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn push_list(&self, listing: Listing) { self.lock().lists.push_back(Ok(listing)); }

    pub fn push_list_error(&self, msg: &str) { self.lock().lists.push_back(Err(msg.to_string())); }

    /// Script the next watch call; events sent on the feed are delivered in order.
    pub fn push_watch(&self) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded();
        self.lock().watches.push_back(rx);
        WatchFeed { tx }
    }

    pub fn list_calls(&self) -> usize { self.lock().list_calls }

    /// Cursors passed to each watch call so far.
    pub fn watch_cursors(&self) -> Vec<String> { self.lock().watch_cursors.clone() }

    pub fn updates(&self) -> Vec<ManagedObject> { self.lock().updates.clone() }
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    async fn list(&self, namespace: Option<&str>) -> Result<Listing> {
        let mut st = self.lock();
        st.list_calls += 1;
        let listing = match st.lists.pop_front() {
            Some(Ok(l)) => l,
            Some(Err(msg)) => return Err(anyhow!(msg)),
            None => st.last_listing.clone().ok_or_else(|| anyhow!("mock: no listing scripted"))?,
        };
        st.last_listing = Some(listing.clone());
        st.objects = listing.items.iter().map(|o| (o.key.clone(), o.clone())).collect();
        let items = listing
            .items
            .into_iter()
            .filter(|o| namespace.map_or(true, |ns| o.key.namespace.as_deref() == Some(ns)))
            .collect();
        Ok(Listing { items, resource_version: listing.resource_version })
    }

    async fn watch(&self, _namespace: Option<&str>, resource_version: &str) -> std::result::Result<WatchStream, WatchError> {
        let mut st = self.lock();
        st.watch_cursors.push(resource_version.to_string());
        match st.watches.pop_front() {
            Some(rx) => Ok(rx.boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject> {
        let mut st = self.lock();
        st.updates.push(object.clone());
        st.objects.insert(object.key.clone(), object.clone());
        Ok(object.clone())
    }
}
