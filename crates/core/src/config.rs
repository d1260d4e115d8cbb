use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Delay policy between failed list/watch cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(800), max: Duration::from_secs(30) }
    }
}

/// Startup configuration for a mirror controller. Supplied once; no hot reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace to mirror; `None` mirrors all namespaces.
    pub namespace: Option<String>,
    /// Zero disables the periodic resync.
    pub resync_period: Duration,
    /// Cluster DNS suffix used by collaborators when building service names.
    pub domain_suffix: String,
    pub backoff: BackoffConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: Some("default".to_string()),
            resync_period: Duration::from_secs(60),
            domain_suffix: "cluster.local".to_string(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `KMIRROR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(ns) = lookup("KMIRROR_NAMESPACE") {
            cfg.namespace = match ns.trim() {
                "" | "*" => None,
                ns => Some(ns.to_string()),
            };
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "KMIRROR_RESYNC_SECS") {
            cfg.resync_period = Duration::from_secs(secs);
        }
        if let Some(suffix) = lookup("KMIRROR_DOMAIN_SUFFIX").filter(|s| !s.trim().is_empty()) {
            cfg.domain_suffix = suffix.trim().to_string();
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "KMIRROR_WATCH_BACKOFF_INITIAL_MS") {
            cfg.backoff.initial = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "KMIRROR_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff.max = Duration::from_secs(secs.max(1));
        }
        cfg
    }

    pub fn resync_enabled(&self) -> bool { !self.resync_period.is_zero() }

    /// `name.namespace.svc.<suffix>`
    pub fn service_host(&self, name: &str, namespace: &str) -> String {
        format!("{}.{}.svc.{}", name, namespace, self.domain_suffix)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}
