//! Configuration for stores, agents and collectors.
//!
//! Every component is built from an explicit config value; nothing is read
//! from process-wide state except through the `from_env` constructors, which
//! mirror the startup configuration the serving runtime provides.
//!
//! | Variable | Used by | Default |
//! |----------|---------|---------|
//! | `TENSORSHM_SHM_DIR` | [`StoreConfig`] | `/dev/shm/tensorshm` |
//! | `TENSORSHM_LOCK_DIR` | [`StoreConfig`] | `/dev/shm/tensorshm-locks` |
//! | `TENSORSHM_MODEL_ID` | [`AgentConfig`] | `default` |
//! | `TENSORSHM_LOCK_TIMEOUT_MS` | [`AgentConfig`], [`CollectorConfig`] | `30000` |
//! | `TENSORSHM_NODE_ID` | [`CollectorConfig`] | host nodename |
//! | `TENSORSHM_COLLECT_INTERVAL_MS` | [`CollectorConfig`] | `5000` |

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default shared-memory root (must be tmpfs shared by all containers).
pub const DEFAULT_SHM_DIR: &str = "/dev/shm/tensorshm";

/// Default lock-file root.
pub const DEFAULT_LOCK_DIR: &str = "/dev/shm/tensorshm-locks";

/// Default wait for a per-fingerprint lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries for transient resolve failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default collector scan interval.
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(5);

/// What happens to a segment whose reference count reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Remove it immediately, under the same lock that observed zero.
    #[default]
    Eager,
    /// Keep it resident for a grace period so an imminent reload is a hit.
    ///
    /// The reconciliation sweep removes it once the grace period expires.
    KeepWarm(Duration),
}

/// Location of the shared segment and lock directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding one backing object per fingerprint.
    pub shm_dir: PathBuf,
    /// Directory holding one lock file per fingerprint.
    pub lock_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
        }
    }
}

impl StoreConfig {
    /// Config with explicit directories.
    pub fn new(shm_dir: impl Into<PathBuf>, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            shm_dir: shm_dir.into(),
            lock_dir: lock_dir.into(),
        }
    }

    /// Config with both directories under one root (`<root>/segments`, `<root>/locks`).
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::new(root.join("segments"), root.join("locks"))
    }

    /// Read `TENSORSHM_SHM_DIR` / `TENSORSHM_LOCK_DIR`, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env_nonempty("TENSORSHM_SHM_DIR") {
            config.shm_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("TENSORSHM_LOCK_DIR") {
            config.lock_dir = PathBuf::from(dir);
        }
        config
    }

    /// Reject configurations that would make segments and locks collide.
    pub fn validate(&self) -> Result<()> {
        if self.shm_dir.as_os_str().is_empty() || self.lock_dir.as_os_str().is_empty() {
            return Err(Error::Config("store directories must not be empty".into()));
        }
        if self.shm_dir == self.lock_dir {
            return Err(Error::Config(format!(
                "segment and lock directories must differ (both {})",
                self.shm_dir.display()
            )));
        }
        Ok(())
    }
}

/// Configuration for an allocation agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Model or function this agent loads weights for.
    pub model_id: String,
    /// Maximum wait for a per-fingerprint lock; `None` blocks indefinitely.
    pub lock_timeout: Option<Duration>,
    /// Retries for transient failures (`MapFailed`, `LockTimeout`).
    pub max_retries: u32,
    /// Reclamation policy when this agent drops the last reference.
    pub reclaim: ReclaimPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model_id: "default".into(),
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
            max_retries: DEFAULT_MAX_RETRIES,
            reclaim: ReclaimPolicy::Eager,
        }
    }
}

impl AgentConfig {
    /// Config for the given model with default policies.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    /// Read `TENSORSHM_MODEL_ID` and `TENSORSHM_LOCK_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(model) = env_nonempty("TENSORSHM_MODEL_ID") {
            config.model_id = model;
        }
        if let Some(ms) = env_millis("TENSORSHM_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Some(ms);
        }
        Ok(config)
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the reclamation policy.
    pub fn with_reclaim(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }
}

/// Configuration for the per-node collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Identifier reported to the scheduler.
    pub node_id: String,
    /// Time between scans.
    pub interval: Duration,
    /// Run a reconciliation sweep on every tick.
    pub reconcile: bool,
    /// Policy the sweep applies to zero-count segments.
    pub reclaim: ReclaimPolicy,
    /// Maximum wait for a per-fingerprint lock during the sweep.
    pub lock_timeout: Option<Duration>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            node_id: local_node_id(),
            interval: DEFAULT_COLLECT_INTERVAL,
            reconcile: true,
            reclaim: ReclaimPolicy::Eager,
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
        }
    }
}

impl CollectorConfig {
    /// Config for the given node with default interval and policies.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Read `TENSORSHM_NODE_ID`, `TENSORSHM_COLLECT_INTERVAL_MS` and `TENSORSHM_LOCK_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(node) = env_nonempty("TENSORSHM_NODE_ID") {
            config.node_id = node;
        }
        if let Some(interval) = env_millis("TENSORSHM_COLLECT_INTERVAL_MS")? {
            if interval.is_zero() {
                return Err(Error::Config("TENSORSHM_COLLECT_INTERVAL_MS must be > 0".into()));
            }
            config.interval = interval;
        }
        if let Some(ms) = env_millis("TENSORSHM_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Some(ms);
        }
        Ok(config)
    }

    /// Set the scan interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enable or disable reconciliation sweeps.
    pub fn with_reconcile(mut self, reconcile: bool) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Set the policy applied by sweeps.
    pub fn with_reclaim(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }
}

/// The host's nodename, or `"localhost"` if it is not representable.
pub fn local_node_id() -> String {
    let uname = rustix::system::uname();
    match uname.nodename().to_str() {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    let Some(raw) = env_nonempty(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}
