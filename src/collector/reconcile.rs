//! Reconciliation of reference counts left behind by crashed processes.
//!
//! The lock on a fingerprint dies with its holder, but the references a
//! process recorded do not. The sweep visits every segment under its lock
//! and:
//!
//! 1. discounts holders in this pid namespace whose process is gone,
//! 2. removes residue left in `Creating`/`Reclaiming` state,
//! 3. reclaims segments whose count is zero. A segment released by a
//!    keep-warm agent stays until the deadline that agent stamped. Other
//!    segments follow the sweep's own policy: immediately for
//!    [`ReclaimPolicy::Eager`], or once idle longer than the grace period for
//!    [`ReclaimPolicy::KeepWarm`].
//!
//! Holders recorded from another pid namespace cannot be checked from here
//! and are left alone, as are untracked references.

use crate::config::{DEFAULT_LOCK_TIMEOUT, ReclaimPolicy, local_node_id};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::lock::LockGuard;
use crate::observability;
use crate::store::{self, StoreHandle};
use std::time::Duration;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Segments visited.
    pub scanned: usize,
    /// Dead holders removed from holder tables.
    pub dead_holders: usize,
    /// References discounted from those holders.
    pub discounted_refs: u64,
    /// Crash residue removed.
    pub residue_removed: usize,
    /// Zero-count segments reclaimed.
    pub reclaimed: usize,
    /// Segments skipped because their lock was busy.
    pub busy: usize,
}

impl SweepReport {
    /// Whether the sweep changed the store.
    pub fn changed_anything(&self) -> bool {
        self.dead_holders > 0 || self.residue_removed > 0 || self.reclaimed > 0
    }
}

/// Sweeps a store for dead holders and idle segments.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: StoreHandle,
    policy: ReclaimPolicy,
    lock_timeout: Option<Duration>,
    node_id: String,
}

impl Reconciler {
    /// Create a reconciler applying `policy` to zero-count segments.
    pub fn new(store: StoreHandle, policy: ReclaimPolicy) -> Self {
        Self {
            store,
            policy,
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
            node_id: local_node_id(),
        }
    }

    /// Set how long to wait for each segment's lock.
    ///
    /// A segment whose lock is busy longer than this is skipped until the
    /// next sweep.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the node label used for metrics.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Visit every segment once.
    ///
    /// Per-segment failures are logged and skipped; only failing to list the
    /// directory fails the sweep.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for fingerprint in self.store.fingerprints()? {
            report.scanned += 1;
            match self.sweep_one(fingerprint, &mut report) {
                Ok(()) => {}
                Err(Error::LockTimeout { .. }) => {
                    report.busy += 1;
                    tracing::debug!(%fingerprint, "segment busy, skipping this sweep");
                }
                Err(e) => tracing::warn!(%fingerprint, "failed to reconcile segment: {e}"),
            }
        }

        if report.discounted_refs > 0 {
            observability::record_reconciled_refs(&self.node_id, report.discounted_refs);
        }
        Ok(report)
    }

    fn sweep_one(&self, fingerprint: Fingerprint, report: &mut SweepReport) -> Result<()> {
        let guard = self.store.lock(fingerprint, self.lock_timeout)?;
        let inspection = self.store.inspect_locked(&guard)?;

        let Some(segment) = inspection.segment else {
            if inspection.removed_residue {
                report.residue_removed += 1;
            }
            // Drops the lock file too.
            self.store.reclaim(&guard)?;
            return Ok(());
        };

        let header = segment.header();
        for record in header.holders() {
            if !record.holder.is_local() || record.holder.is_alive() {
                continue;
            }
            let refs = header.discount(record.slot);
            report.dead_holders += 1;
            report.discounted_refs += u64::from(refs);
            tracing::warn!(
                %fingerprint,
                pid = record.holder.pid,
                refs,
                "discounted references of a dead holder"
            );
        }
        segment.sync_header()?;

        if header.ref_count() > 0 {
            return Ok(());
        }

        if self.idle_expired(&guard, &segment)? {
            drop(segment);
            if self.store.reclaim(&guard)? {
                report.reclaimed += 1;
                observability::record_reclaim("sweep");
            }
        }
        Ok(())
    }

    /// Whether a zero-count segment should go now. Stamps segments that
    /// became idle without a stamp so the grace period starts here.
    fn idle_expired(&self, guard: &LockGuard, segment: &store::SegmentFile) -> Result<bool> {
        guard.ensure_covers(segment.fingerprint())?;
        let header = segment.header();
        let now = store::now_ms();

        let warm_until = header.keep_warm_until_ms();
        if warm_until != 0 {
            return Ok(now >= warm_until);
        }

        let ReclaimPolicy::KeepWarm(grace) = self.policy else {
            return Ok(true);
        };
        let idle_since = header.idle_since_ms();
        if idle_since == 0 {
            header.set_idle_since(now);
            segment.sync_header()?;
            return Ok(false);
        }
        Ok(now.saturating_sub(idle_since) >= grace.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::lock::{self, HolderId};
    use crate::store::SegmentFile;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, StoreHandle) {
        let dir = tempdir().unwrap();
        let store = StoreHandle::open(StoreConfig::under(dir.path())).unwrap();
        (dir, store)
    }

    fn dead_holder() -> HolderId {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        HolderId {
            pid,
            pid_ns: HolderId::current().pid_ns,
        }
    }

    fn create(store: &StoreHandle, content: &[u8], holders: &[HolderId]) -> Fingerprint {
        let fp = Fingerprint::of_content(content);
        let guard = store.lock(fp, None).unwrap();
        let segment = store
            .create_and_populate(&guard, content.len() as u64, |buf| {
                buf.copy_from_slice(content);
                Ok(())
            })
            .unwrap();
        for holder in holders {
            lock::increment(&guard, &segment, *holder).unwrap();
        }
        fp
    }

    #[test]
    fn test_dead_holder_discounted_and_reclaimed() {
        let (_dir, store) = setup();
        let fp = create(&store, b"weights", &[dead_holder()]);

        let report = Reconciler::new(store.clone(), ReclaimPolicy::Eager).sweep().unwrap();
        assert_eq!(report.dead_holders, 1);
        assert_eq!(report.discounted_refs, 1);
        assert_eq!(report.reclaimed, 1);
        assert!(store.status(fp).unwrap().is_none());
        assert!(!store.lock_path(fp).exists());
    }

    #[test]
    fn test_live_holder_is_kept() {
        let (_dir, store) = setup();
        let me = HolderId::current();
        let fp = create(&store, b"weights", &[me, dead_holder()]);

        let report = Reconciler::new(store.clone(), ReclaimPolicy::Eager).sweep().unwrap();
        assert_eq!(report.dead_holders, 1);
        assert_eq!(report.reclaimed, 0);
        let status = store.status(fp).unwrap().unwrap();
        assert_eq!(status.ref_count, 1);
        assert_eq!(status.holders[0].holder, me);
    }

    #[test]
    fn test_foreign_namespace_holder_is_kept() {
        let (_dir, store) = setup();
        let foreign = HolderId {
            pid: 1,
            pid_ns: HolderId::current().pid_ns.wrapping_add(1),
        };
        let fp = create(&store, b"weights", &[foreign]);

        let report = Reconciler::new(store.clone(), ReclaimPolicy::Eager).sweep().unwrap();
        assert_eq!(report.dead_holders, 0);
        assert_eq!(store.status(fp).unwrap().unwrap().ref_count, 1);
    }

    #[test]
    fn test_creating_residue_removed() {
        let (_dir, store) = setup();
        let fp = Fingerprint::of_content(b"half");
        drop(SegmentFile::create(&store.segment_path(fp), fp, 64, 0).unwrap());

        let report = Reconciler::new(store.clone(), ReclaimPolicy::Eager).sweep().unwrap();
        assert_eq!(report.residue_removed, 1);
        assert!(!store.segment_path(fp).exists());
    }

    #[test]
    fn test_keep_warm_grace_period() {
        let (_dir, store) = setup();
        let fp = create(&store, b"weights", &[]);

        let warm = Reconciler::new(
            store.clone(),
            ReclaimPolicy::KeepWarm(Duration::from_secs(3600)),
        );
        // First sweep stamps the idle time, second sees it within grace.
        assert_eq!(warm.sweep().unwrap().reclaimed, 0);
        assert_eq!(warm.sweep().unwrap().reclaimed, 0);
        assert!(store.status(fp).unwrap().unwrap().idle_since_ms > 0);

        let expired = Reconciler::new(store.clone(), ReclaimPolicy::KeepWarm(Duration::ZERO));
        assert_eq!(expired.sweep().unwrap().reclaimed, 1);
        assert!(store.status(fp).unwrap().is_none());
    }

    #[test]
    fn test_agent_keep_warm_deadline_outranks_eager_sweep() {
        let (_dir, store) = setup();
        let fp = create(&store, b"weights", &[]);
        let now = store::now_ms();
        {
            let guard = store.lock(fp, None).unwrap();
            let segment = store.open_locked(&guard).unwrap().unwrap();
            segment.header().mark_kept_warm(now, now + 3_600_000);
            segment.sync_header().unwrap();
        }

        let eager = Reconciler::new(store.clone(), ReclaimPolicy::Eager);
        assert_eq!(eager.sweep().unwrap().reclaimed, 0);
        assert!(store.status(fp).unwrap().unwrap().is_ready());

        {
            let guard = store.lock(fp, None).unwrap();
            let segment = store.open_locked(&guard).unwrap().unwrap();
            segment.header().mark_kept_warm(now - 10, now - 1);
            segment.sync_header().unwrap();
        }
        assert_eq!(eager.sweep().unwrap().reclaimed, 1);
        assert!(store.status(fp).unwrap().is_none());
    }

    #[test]
    fn test_unknown_namespace_holder_is_kept() {
        let (_dir, store) = setup();
        let unknown = HolderId {
            pid: dead_holder().pid,
            pid_ns: 0,
        };
        let fp = create(&store, b"weights", &[unknown]);

        let report = Reconciler::new(store.clone(), ReclaimPolicy::Eager).sweep().unwrap();
        assert_eq!(report.dead_holders, 0);
        assert_eq!(store.status(fp).unwrap().unwrap().ref_count, 1);
    }

    #[test]
    fn test_busy_segment_skipped() {
        let (_dir, store) = setup();
        let fp = create(&store, b"weights", &[]);
        let _held = store.lock(fp, None).unwrap();

        let report = Reconciler::new(store.clone(), ReclaimPolicy::Eager)
            .with_lock_timeout(Some(Duration::from_millis(5)))
            .sweep()
            .unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.busy, 1);
        assert!(store.status(fp).unwrap().is_some());
    }
}
