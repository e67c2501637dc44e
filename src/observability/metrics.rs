//! Metrics collection using metrics-rs.

use metrics::{Counter, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const RESOLVE_TOTAL: &str = "tensorshm_resolve_total";
const RELEASE_TOTAL: &str = "tensorshm_release_total";
const RECLAIM_TOTAL: &str = "tensorshm_reclaim_total";
const RESOLVE_RETRIES_TOTAL: &str = "tensorshm_resolve_retries_total";
const LOCK_WAIT_NS: &str = "tensorshm_lock_wait_ns";
const RESIDENT_SEGMENTS: &str = "tensorshm_resident_segments";
const RESIDENT_BYTES: &str = "tensorshm_resident_bytes";
const SCAN_FAILURES_TOTAL: &str = "tensorshm_scan_failures_total";
const RECONCILED_REFS_TOTAL: &str = "tensorshm_reconciled_refs_total";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        RESOLVE_TOTAL,
        Unit::Count,
        "Tensor resolves by outcome (hit, miss, local)"
    );
    metrics::describe_counter!(RELEASE_TOTAL, Unit::Count, "Tensor references released");
    metrics::describe_counter!(RECLAIM_TOTAL, Unit::Count, "Shared segments reclaimed");
    metrics::describe_counter!(
        RESOLVE_RETRIES_TOTAL,
        Unit::Count,
        "Resolve attempts retried after a transient failure"
    );
    metrics::describe_histogram!(
        LOCK_WAIT_NS,
        Unit::Nanoseconds,
        "Time spent acquiring a per-fingerprint lock"
    );
    metrics::describe_gauge!(
        RESIDENT_SEGMENTS,
        Unit::Count,
        "Ready shared segments resident on the node"
    );
    metrics::describe_gauge!(
        RESIDENT_BYTES,
        Unit::Bytes,
        "Payload bytes of resident shared segments"
    );
    metrics::describe_counter!(
        SCAN_FAILURES_TOTAL,
        Unit::Count,
        "Collector ticks that failed"
    );
    metrics::describe_counter!(
        RECONCILED_REFS_TOTAL,
        Unit::Count,
        "References discounted from holders that no longer exist"
    );
}

/// How a resolve was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveKind {
    /// Attached to a segment another process created.
    Hit,
    /// Created the segment.
    Miss,
    /// Reused this process's existing mapping.
    Local,
}

impl ResolveKind {
    fn label(self) -> &'static str {
        match self {
            ResolveKind::Hit => "hit",
            ResolveKind::Miss => "miss",
            ResolveKind::Local => "local",
        }
    }
}

/// Record time spent acquiring a lock.
#[inline]
pub fn record_lock_wait(waited: Duration) {
    histogram!(LOCK_WAIT_NS).record(waited.as_nanos() as f64);
}

/// Record a reclaimed segment.
#[inline]
pub fn record_reclaim(reason: &'static str) {
    counter!(RECLAIM_TOTAL, "reason" => reason).increment(1);
}

/// Record the node's resident inventory.
#[inline]
pub fn record_resident(node: &str, segments: usize, bytes: u64) {
    gauge!(RESIDENT_SEGMENTS, "node" => node.to_string()).set(segments as f64);
    gauge!(RESIDENT_BYTES, "node" => node.to_string()).set(bytes as f64);
}

/// Record a failed collector tick.
#[inline]
pub fn record_scan_failure(node: &str) {
    counter!(SCAN_FAILURES_TOTAL, "node" => node.to_string()).increment(1);
}

/// Record references discounted from dead holders.
#[inline]
pub fn record_reconciled_refs(node: &str, refs: u64) {
    counter!(RECONCILED_REFS_TOTAL, "node" => node.to_string()).increment(refs);
}

/// Counters for one agent, labelled with its model.
#[derive(Clone)]
pub struct AgentMetrics {
    model: String,
    hits: Counter,
    misses: Counter,
    local: Counter,
    releases: Counter,
    retries: Counter,
}

impl AgentMetrics {
    /// Create the counters for `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            hits: counter!(RESOLVE_TOTAL, "model" => model.to_string(), "outcome" => ResolveKind::Hit.label()),
            misses: counter!(RESOLVE_TOTAL, "model" => model.to_string(), "outcome" => ResolveKind::Miss.label()),
            local: counter!(RESOLVE_TOTAL, "model" => model.to_string(), "outcome" => ResolveKind::Local.label()),
            releases: counter!(RELEASE_TOTAL, "model" => model.to_string()),
            retries: counter!(RESOLVE_RETRIES_TOTAL, "model" => model.to_string()),
        }
    }

    /// Record a completed resolve.
    #[inline]
    pub fn record_resolve(&self, kind: ResolveKind) {
        match kind {
            ResolveKind::Hit => self.hits.increment(1),
            ResolveKind::Miss => self.misses.increment(1),
            ResolveKind::Local => self.local.increment(1),
        }
    }

    /// Record a released reference.
    #[inline]
    pub fn record_release(&self) {
        self.releases.increment(1);
    }

    /// Record a retried resolve attempt.
    #[inline]
    pub fn record_retry(&self) {
        self.retries.increment(1);
    }

    /// Model these counters are labelled with.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics").field("model", &self.model).finish()
    }
}
