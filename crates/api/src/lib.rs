//! kmirror public façade (in-process).
//!
//! `Controller` owns the store, the delta queue and the two background tasks (reflector
//! and controller loop) and exposes the read API the rest of an application uses.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kmirror_core::{ControllerConfig, ManagedObject, ObjectKey};
use kmirror_kubehub::{Backoff, ClusterClient, Reflector};
use kmirror_store::{DeltaQueue, Store};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod controller;

pub use kmirror_core::{CoreError, Delta, DeltaKind};
pub use kmirror_kubehub::{KubeClient, MockCluster, WatchFeed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Uninitialized,
    Running,
    Stopped,
}

/// API errors. "Not found" is never an error: lookups return `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("controller not started")]
    NotStarted,
    #[error("controller already started")]
    AlreadyStarted,
    #[error("controller stopped; construct a new one to restart")]
    Stopped,
    #[error("not synced: {0}")]
    NotSynced(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidKey(k) => ApiError::InvalidKey(k),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Runtime view of a controller for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub state: LifecycleState,
    pub namespace: Option<String>,
    pub items: usize,
    pub has_synced: bool,
    pub queue_len: usize,
    pub last_sync_resource_version: Option<String>,
    /// Unix seconds of the last periodic resync.
    pub last_resync_ts: Option<i64>,
    pub resync_secs: u64,
}

struct Lifecycle {
    state: LifecycleState,
    tasks: Vec<JoinHandle<()>>,
}

/// Local mirror of the Deployments in one namespace (or all of them).
pub struct Controller {
    config: ControllerConfig,
    client: Arc<dyn ClusterClient>,
    store: Arc<Store>,
    queue: Arc<DeltaQueue>,
    cancel: CancellationToken,
    last_resync: Arc<AtomicI64>,
    lifecycle: Mutex<Lifecycle>,
}

impl Controller {
    pub fn new(config: ControllerConfig, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            config,
            client,
            store: Arc::new(Store::new()),
            queue: Arc::new(DeltaQueue::new()),
            cancel: CancellationToken::new(),
            last_resync: Arc::new(AtomicI64::new(0)),
            lifecycle: Mutex::new(Lifecycle { state: LifecycleState::Uninitialized, tasks: Vec::new() }),
        }
    }

    /// Construct and start in one go.
    pub fn start_with(config: ControllerConfig, client: Arc<dyn ClusterClient>) -> ApiResult<Self> {
        let c = Self::new(config, client);
        c.start()?;
        Ok(c)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> { self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Spawn the reflector and the controller loop on the current Tokio runtime.
    pub fn start(&self) -> ApiResult<()> {
        let mut lc = self.lock();
        match lc.state {
            LifecycleState::Running => return Err(ApiError::AlreadyStarted),
            LifecycleState::Stopped => return Err(ApiError::Stopped),
            LifecycleState::Uninitialized => {}
        }
        let rt = tokio::runtime::Handle::try_current().map_err(|e| ApiError::Internal(e.to_string()))?;
        let reflector = Reflector::new(
            Arc::clone(&self.client),
            Arc::clone(&self.queue),
            self.config.namespace.clone(),
            Backoff::from_config(&self.config.backoff),
        );
        let reflector_task = rt.spawn(reflector.run(self.cancel.clone()));
        let loop_task = rt.spawn(controller::run_loop(controller::LoopCtx {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            cancel: self.cancel.clone(),
            resync_period: self.config.resync_period,
            last_resync: Arc::clone(&self.last_resync),
        }));
        lc.tasks = vec![reflector_task, loop_task];
        lc.state = LifecycleState::Running;
        info!(
            ns = %self.config.namespace.as_deref().unwrap_or("(all)"),
            resync_secs = self.config.resync_period.as_secs(),
            "api: controller started"
        );
        Ok(())
    }

    /// Broadcast shutdown. The store keeps serving its last state afterwards.
    /// A second call is a no-op.
    pub fn stop(&self) -> ApiResult<()> {
        let mut lc = self.lock();
        match lc.state {
            LifecycleState::Uninitialized => Err(ApiError::NotStarted),
            LifecycleState::Stopped => Ok(()),
            LifecycleState::Running => {
                lc.state = LifecycleState::Stopped;
                self.cancel.cancel();
                self.queue.close();
                info!(items = self.store.len(), "api: controller stopped");
                Ok(())
            }
        }
    }

    /// Wait for both background tasks to finish (after `stop`).
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut self.lock().tasks);
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "api: background task ended abnormally");
            }
        }
    }

    /// `stop` followed by `join`.
    pub async fn shutdown(&self) -> ApiResult<()> {
        self.stop()?;
        self.join().await;
        Ok(())
    }

    pub fn state(&self) -> LifecycleState { self.lock().state }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// Shared cluster client, for collaborators that read or write single objects live.
    pub fn client(&self) -> Arc<dyn ClusterClient> { Arc::clone(&self.client) }

    /// True once the first full listing is in the store.
    pub fn has_synced(&self) -> bool { self.queue.has_synced() }

    /// Resolves as soon as the first listing is applied. A stop while waiting ends
    /// the wait with `Stopped`.
    pub async fn wait_for_sync(&self, timeout: Duration) -> ApiResult<()> {
        if self.has_synced() {
            return Ok(());
        }
        match self.state() {
            LifecycleState::Uninitialized => return Err(ApiError::NotStarted),
            LifecycleState::Stopped => return Err(ApiError::Stopped),
            LifecycleState::Running => {}
        }
        tokio::select! {
            biased;
            _ = self.queue.synced() => Ok(()),
            _ = self.cancel.cancelled() => Err(ApiError::Stopped),
            _ = tokio::time::sleep(timeout) => {
                Err(ApiError::NotSynced(format!("no complete listing after {}ms", timeout.as_millis())))
            }
        }
    }

    /// Snapshot copy of every mirrored Deployment, sorted by key.
    pub fn list_deployments(&self) -> Vec<ManagedObject> { self.store.list() }

    /// Keys rendered as `namespace/name`, sorted.
    pub fn list_keys(&self) -> Vec<String> { self.store.list_keys().iter().map(ToString::to_string).collect() }

    /// `Ok(None)` when absent; `Err` only for a malformed key.
    pub fn get_by_key(&self, key: &str) -> ApiResult<Option<ManagedObject>> {
        let key: ObjectKey = key.parse()?;
        Ok(self.store.get_by_key(&key))
    }

    pub fn stats(&self) -> Stats {
        let ts = self.last_resync.load(Ordering::Relaxed);
        Stats {
            state: self.state(),
            namespace: self.config.namespace.clone(),
            items: self.store.len(),
            has_synced: self.has_synced(),
            queue_len: self.queue.len(),
            last_sync_resource_version: self.store.last_sync_resource_version(),
            last_resync_ts: (ts > 0).then_some(ts),
            resync_secs: self.config.resync_period.as_secs(),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}
