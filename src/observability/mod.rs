//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! No recorder or subscriber is installed by the library; the embedding
//! runtime (or the collector binary) decides where these go.
//!
//! ## Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tensorshm_resolve_total` | Counter | `model`, `outcome` | Resolves by outcome (`hit`, `miss`, `local`) |
//! | `tensorshm_release_total` | Counter | `model` | References released |
//! | `tensorshm_reclaim_total` | Counter | `reason` | Segments reclaimed (`release`, `sweep`, `residue`) |
//! | `tensorshm_resolve_retries_total` | Counter | `model` | Resolve attempts retried after a transient error |
//! | `tensorshm_lock_wait_ns` | Histogram | | Time spent acquiring a fingerprint lock |
//! | `tensorshm_resident_segments` | Gauge | `node` | Ready segments seen by the last scan |
//! | `tensorshm_resident_bytes` | Gauge | `node` | Payload bytes of those segments |
//! | `tensorshm_scan_failures_total` | Counter | `node` | Collector ticks that failed |
//! | `tensorshm_reconciled_refs_total` | Counter | `node` | References discounted from dead holders |
//!
//! ## Tracing
//!
//! Spans are emitted for resolve, release and collector scans.

mod metrics;
mod tracing_support;

pub use self::metrics::{
    AgentMetrics, ResolveKind, init_metrics, record_lock_wait, record_reclaim,
    record_reconciled_refs, record_resident, record_scan_failure,
};
pub use self::tracing_support::{span_release, span_resolve, span_scan};
