//! Per-node inventory collector.
//!
//! The collector enumerates the segment directory (not the agents, which may
//! all have exited) and reports every `Ready` segment to the scheduler. It
//! runs on a plain thread:
//!
//! ```text
//! loop {
//!     sweep (optional)  ─▶ discount dead holders, drop residue, reclaim idle
//!     scan              ─▶ InventoryReport
//!     publish           ─▶ InventorySink
//!     wait interval     ─▶ wakes early on shutdown
//! }
//! ```
//!
//! A failed tick is logged and counted; the next tick tries again.

mod reconcile;
mod sink;
mod wire;

pub use reconcile::{Reconciler, SweepReport};
pub use sink::{ChannelSink, InventorySink, JsonFileSink, SocketSink};
pub use wire::{FRAME_HEADER_SIZE, decode_report, encode_report, read_report, write_report};

use crate::config::CollectorConfig;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::observability;
use crate::store::{self, StoreHandle};
use kanal::{ReceiveErrorTimeout, Sender};
use std::thread::JoinHandle;

/// One resident segment as seen by a node's collector.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct InventoryRecord {
    /// Reporting node.
    pub node_id: String,
    /// Segment fingerprint.
    pub fingerprint: Fingerprint,
    /// Payload size in bytes.
    pub byte_size: u64,
    /// When the segment was seen (ms since the Unix epoch).
    pub last_seen_ms: u64,
}

/// Result of one scan of a node.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct InventoryReport {
    /// Reporting node.
    pub node_id: String,
    /// When the scan ran (ms since the Unix epoch).
    pub generated_at_ms: u64,
    /// Resident segments, ordered by fingerprint.
    pub records: Vec<InventoryRecord>,
}

impl InventoryReport {
    /// Total resident payload bytes.
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.byte_size).sum()
    }

    /// Whether `fingerprint` is resident.
    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.records
            .binary_search_by(|r| r.fingerprint.cmp(&fingerprint))
            .is_ok()
    }
}

/// Scans one store and publishes its inventory.
#[derive(Debug)]
pub struct Collector {
    store: StoreHandle,
    config: CollectorConfig,
    reconciler: Reconciler,
}

impl Collector {
    /// Create a collector over `store`.
    pub fn new(store: StoreHandle, config: CollectorConfig) -> Self {
        observability::init_metrics();
        let reconciler = Reconciler::new(store.clone(), config.reclaim)
            .with_lock_timeout(config.lock_timeout)
            .with_node_id(config.node_id.clone());
        Self {
            store,
            config,
            reconciler,
        }
    }

    /// Collector configuration.
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// The sweep this collector runs when reconciliation is enabled.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// List the `Ready` segments currently resident.
    ///
    /// Segments being created or reclaimed are not reported. Takes no locks.
    pub fn scan(&self) -> Result<InventoryReport> {
        let now = store::now_ms();
        let records: Vec<_> = self
            .store
            .ready_segments()?
            .into_iter()
            .map(|status| InventoryRecord {
                node_id: self.config.node_id.clone(),
                fingerprint: status.fingerprint,
                byte_size: status.payload_len,
                last_seen_ms: now,
            })
            .collect();

        let report = InventoryReport {
            node_id: self.config.node_id.clone(),
            generated_at_ms: now,
            records,
        };
        observability::record_resident(
            &self.config.node_id,
            report.records.len(),
            report.total_bytes(),
        );
        Ok(report)
    }

    /// Run one tick: optional sweep, scan, publish.
    ///
    /// A failed sweep is logged and does not stop the scan.
    pub fn tick(&self, sink: &mut dyn InventorySink) -> Result<InventoryReport> {
        let _span = observability::span_scan(&self.config.node_id).entered();

        if self.config.reconcile {
            match self.reconciler.sweep() {
                Ok(sweep) if sweep.changed_anything() => {
                    tracing::info!(?sweep, "reconciliation sweep");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("reconciliation sweep failed: {e}"),
            }
        }

        let report = self.scan()?;
        sink.publish(&report)?;
        tracing::debug!(
            segments = report.records.len(),
            bytes = report.total_bytes(),
            "published inventory"
        );
        Ok(report)
    }

    /// Run ticks on a background thread until the handle is shut down.
    pub fn spawn<S>(self, mut sink: S) -> Result<CollectorHandle>
    where
        S: InventorySink + 'static,
    {
        let (stop_tx, stop_rx) = kanal::bounded::<()>(1);
        let interval = self.config.interval;

        let thread = std::thread::Builder::new()
            .name("tensorshm-collector".into())
            .spawn(move || {
                tracing::info!(node = %self.config.node_id, ?interval, "collector started");
                loop {
                    if let Err(e) = self.tick(&mut sink) {
                        tracing::error!(node = %self.config.node_id, "collector tick failed: {e}");
                        observability::record_scan_failure(&self.config.node_id);
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(ReceiveErrorTimeout::Timeout) => continue,
                        _ => break,
                    }
                }
                tracing::info!(node = %self.config.node_id, "collector stopped");
            })?;

        Ok(CollectorHandle {
            stop: stop_tx,
            thread: Some(thread),
        })
    }
}

/// Controls a collector started with [`Collector::spawn`].
///
/// Dropping the handle stops the collector and waits for it.
pub struct CollectorHandle {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CollectorHandle {
    /// Ask the collector to stop after its current tick.
    pub fn shutdown(&self) {
        // Closing wakes the interval wait; a full channel means a stop is
        // already pending.
        let _ = self.stop.try_send(());
        let _ = self.stop.close();
    }

    /// Block on the collector thread without stopping it.
    ///
    /// For sidecars that run until the process is killed.
    pub fn wait(mut self) {
        self.join_thread();
    }

    /// Stop the collector and wait for its thread.
    pub fn join(mut self) {
        self.stop_and_wait();
    }

    fn stop_and_wait(&mut self) {
        self.shutdown();
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("collector thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for CollectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorHandle")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.stop_and_wait();
    }
}
