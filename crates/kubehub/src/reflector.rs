//! List-then-watch loop feeding the delta queue.
//!
//! The reflector is a small state machine: `Listing` performs a full list and hands it
//! to the queue as a replace, `Watching` streams incremental changes from the listing's
//! cursor, and any watch termination goes through `Backoff` and back to `Listing`. It
//! never resumes a watch from an old cursor. The backoff only resets once a watch has
//! delivered an event or bookmark, so a watch that keeps failing right after a good
//! list still backs off exponentially.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kmirror_core::Delta;
use kmirror_store::DeltaQueue;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Backoff, ClusterClient, WatchError, WatchEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Listing,
    Watching { cursor: String },
    Backoff,
    Stopped,
}

pub struct Reflector {
    client: Arc<dyn ClusterClient>,
    queue: Arc<DeltaQueue>,
    namespace: Option<String>,
    backoff: Backoff,
    phase: Phase,
}

impl Reflector {
    pub fn new(client: Arc<dyn ClusterClient>, queue: Arc<DeltaQueue>, namespace: Option<String>, backoff: Backoff) -> Self {
        Self { client, queue, namespace, backoff, phase: Phase::Listing }
    }

    pub fn phase(&self) -> &Phase { &self.phase }

    pub fn backoff(&self) -> &Backoff { &self.backoff }

    /// Drive the state machine until `cancel` fires or the queue closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(ns = %self.namespace.as_deref().unwrap_or("(all)"), "reflector: started");
        while self.phase != Phase::Stopped {
            self.step(&cancel).await;
        }
        info!("reflector: stopped");
    }

    /// Perform one transition and return the phase entered.
    pub async fn step(&mut self, cancel: &CancellationToken) -> &Phase {
        let current = std::mem::replace(&mut self.phase, Phase::Stopped);
        self.phase = if cancel.is_cancelled() {
            Phase::Stopped
        } else {
            match current {
                Phase::Listing => self.list(cancel).await,
                Phase::Watching { cursor } => self.watch(cursor, cancel).await,
                Phase::Backoff => self.wait(cancel).await,
                Phase::Stopped => Phase::Stopped,
            }
        };
        &self.phase
    }

    async fn list(&mut self, cancel: &CancellationToken) -> Phase {
        let t0 = Instant::now();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Phase::Stopped,
            r = self.client.list(self.namespace.as_deref()) => r,
        };
        match res {
            Ok(listing) => {
                let cursor = listing.resource_version.clone();
                let items = listing.items.len();
                counter!("kmirror_list_total", 1u64);
                histogram!("kmirror_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
                if !self.queue.replace(listing) {
                    return Phase::Stopped;
                }
                info!(items, rv = %cursor, took_ms = %t0.elapsed().as_millis(), "reflector: list ok");
                Phase::Watching { cursor }
            }
            Err(e) => {
                counter!("kmirror_list_errors_total", 1u64);
                self.report("list", &e);
                Phase::Backoff
            }
        }
    }

    async fn watch(&mut self, mut cursor: String, cancel: &CancellationToken) -> Phase {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Phase::Stopped,
            r = self.client.watch(self.namespace.as_deref(), &cursor) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                self.report("watch", &e);
                return Phase::Backoff;
            }
        };
        debug!(rv = %cursor, "reflector: watch open");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Phase::Stopped,
                n = stream.next() => n,
            };
            match next {
                Some(Ok(ev)) => {
                    // healthy watch: start over from the initial delay
                    self.backoff.reset();
                    cursor = ev.resource_version().to_string();
                    let delta = match ev {
                        WatchEvent::Added(o) => Delta::added(o),
                        WatchEvent::Modified(o) => Delta::updated(o),
                        WatchEvent::Deleted(o) => Delta::deleted(o),
                        WatchEvent::Bookmark(_) => continue,
                    };
                    counter!("kmirror_watch_events_total", 1u64, "kind" => delta.kind.as_str());
                    if !self.queue.push(delta) {
                        return Phase::Stopped;
                    }
                }
                Some(Err(WatchError::Malformed(msg))) => {
                    counter!("kmirror_watch_malformed_total", 1u64);
                    warn!(rv = %cursor, error = %msg, "reflector: skipping malformed notification");
                }
                Some(Err(e)) => {
                    counter!("kmirror_watch_restarts_total", 1u64);
                    self.report("watch", &e);
                    return Phase::Backoff;
                }
                None => {
                    counter!("kmirror_watch_restarts_total", 1u64);
                    info!(rv = %cursor, "reflector: watch stream ended; relisting");
                    return Phase::Backoff;
                }
            }
        }
    }

    async fn wait(&mut self, cancel: &CancellationToken) -> Phase {
        let delay = self.backoff.next_delay();
        debug!(delay_ms = %delay.as_millis(), attempt = self.backoff.attempt(), "reflector: backing off");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Phase::Stopped,
            _ = tokio::time::sleep(delay) => Phase::Listing,
        }
    }

    fn report(&self, op: &'static str, err: &dyn fmt::Display) {
        let attempt = self.backoff.attempt();
        if self.backoff.should_warn() {
            warn!(op, attempt, error = %err, "reflector: transient failure; relisting after backoff");
        } else {
            debug!(op, attempt, error = %err, "reflector: transient failure; relisting after backoff");
        }
    }
}
