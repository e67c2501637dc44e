//! Content-addressed segment store over a shared directory.
//!
//! A [`StoreHandle`] names two directories that every participating process
//! sees (typically tmpfs under `/dev/shm`):
//!
//! - `shm_dir/<hex>`: one segment file per fingerprint
//! - `lock_dir/<hex>`: one lock file per fingerprint
//!
//! There is no coordinating process. [`StoreHandle::lookup`] is a lock-free
//! probe; creation, attach, reference counting and reclamation all happen
//! under the fingerprint's [`LockGuard`].
//!
//! # Segment lifecycle
//!
//! ```text
//! Creating ──populate ok──▶ Ready ──count reaches 0──▶ Reclaiming ──▶ removed
//!     │
//!     └──populate failed / holder crashed──▶ removed
//! ```
//!
//! A lock holder that finds a segment in `Creating` or `Reclaiming` knows the
//! previous holder died mid-operation (the state would otherwise have been
//! finished before the lock was released) and removes it.

mod header;
mod segment;

pub use header::{HolderRecord, MAX_HOLDERS, SegmentState};
pub use segment::{SegmentFile, SegmentStatus, SegmentView};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::lock::{self, LockGuard};
use crate::observability;
use segment::Probe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to one shared segment store.
///
/// Cheap to clone; every clone refers to the same directories.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    config: Arc<StoreConfig>,
}

/// What a lock holder found at a segment path.
pub(crate) struct Inspection {
    /// A `Ready` segment, if any.
    pub segment: Option<SegmentFile>,
    /// Whether residue of a crashed holder was removed.
    pub removed_residue: bool,
}

impl StoreHandle {
    /// Open the store, creating both directories if needed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.shm_dir)?;
        std::fs::create_dir_all(&config.lock_dir)?;
        tracing::debug!(
            shm_dir = %config.shm_dir.display(),
            lock_dir = %config.lock_dir.display(),
            "opened segment store"
        );
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Directories this store uses.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Path of the segment file for `fingerprint`.
    pub fn segment_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.config.shm_dir.join(fingerprint.to_hex())
    }

    /// Path of the lock file for `fingerprint`.
    pub fn lock_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.config.lock_dir.join(fingerprint.to_hex())
    }

    /// Lock-free probe for a `Ready` segment.
    ///
    /// A segment that is being created, being reclaimed or is corrupt is
    /// reported as absent. A `Some` result can still be reclaimed before the
    /// caller attaches; [`attach`](Self::attach) detects that.
    pub fn lookup(&self, fingerprint: Fingerprint) -> Result<Option<SegmentFile>> {
        match SegmentFile::open(&self.segment_path(fingerprint), fingerprint, true)? {
            Probe::Found(file) if file.state() == Some(SegmentState::Ready) => Ok(Some(file)),
            _ => Ok(None),
        }
    }

    /// Acquire the lock for `fingerprint`.
    pub fn lock(&self, fingerprint: Fingerprint, timeout: Option<Duration>) -> Result<LockGuard> {
        LockGuard::acquire(&self.config.lock_dir, fingerprint, timeout)
    }

    /// Run `f` while holding the lock for `fingerprint`.
    pub fn with_exclusive_lock<T>(
        &self,
        fingerprint: Fingerprint,
        timeout: Option<Duration>,
        f: impl FnOnce(&LockGuard) -> Result<T>,
    ) -> Result<T> {
        lock::with_exclusive_lock(&self.config.lock_dir, fingerprint, timeout, f)
    }

    /// Open the segment the guard covers, removing crash residue.
    pub fn open_locked(&self, guard: &LockGuard) -> Result<Option<SegmentFile>> {
        Ok(self.inspect_locked(guard)?.segment)
    }

    pub(crate) fn inspect_locked(&self, guard: &LockGuard) -> Result<Inspection> {
        let fingerprint = guard.fingerprint();
        let path = self.segment_path(fingerprint);

        let reason = match SegmentFile::open(&path, fingerprint, true)? {
            Probe::Missing => {
                return Ok(Inspection {
                    segment: None,
                    removed_residue: false,
                });
            }
            Probe::Found(file) => match file.state() {
                Some(SegmentState::Ready) => {
                    return Ok(Inspection {
                        segment: Some(file),
                        removed_residue: false,
                    });
                }
                state => format!("left in state {state:?}"),
            },
            Probe::Residue(reason) => reason,
        };

        tracing::warn!(%fingerprint, %reason, "removing residue of a crashed segment holder");
        remove_if_present(&path)?;
        observability::record_reclaim("residue");
        Ok(Inspection {
            segment: None,
            removed_residue: true,
        })
    }

    /// Create the segment the guard covers and fill it with `populate`.
    ///
    /// Any residue at the path is removed first. On failure (including a
    /// panic in `populate`) the partial segment is removed again.
    ///
    /// # Errors
    ///
    /// - `InvalidSegment` if a `Ready` segment already exists
    /// - `AllocationFailed` if shared memory is exhausted
    /// - `PopulateFailed` if `populate` fails
    pub fn create_and_populate<F>(
        &self,
        guard: &LockGuard,
        size: u64,
        populate: F,
    ) -> Result<SegmentFile>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<()>,
    {
        let fingerprint = guard.fingerprint();
        if size == 0 {
            return Err(Error::InvalidDescriptor("segment size must be positive".into()));
        }
        if self.inspect_locked(guard)?.segment.is_some() {
            return Err(Error::InvalidSegment(format!(
                "segment {fingerprint} already exists"
            )));
        }

        let path = self.segment_path(fingerprint);
        let segment = SegmentFile::create(&path, fingerprint, size, now_ms())?;
        let rollback = Rollback::new(&path);

        {
            let mut payload = segment.map_payload(true)?;
            populate(payload.as_mut_slice())
                .map_err(|source| Error::PopulateFailed { fingerprint, source })?;
        }

        segment.header().set_state(SegmentState::Ready);
        segment.sync_header()?;
        rollback.disarm();

        tracing::info!(%fingerprint, size, "created shared segment");
        Ok(segment)
    }

    /// Map the payload of `segment` read-only.
    ///
    /// Fails with `MapFailed` if the segment was reclaimed or replaced since
    /// it was looked up; the caller restarts from [`lookup`](Self::lookup).
    pub fn attach(&self, guard: &LockGuard, segment: &SegmentFile) -> Result<SegmentView> {
        let fingerprint = segment.fingerprint();
        guard.ensure_covers(fingerprint)?;

        if !segment.still_linked()? {
            return Err(Error::MapFailed {
                fingerprint,
                reason: "segment was reclaimed".into(),
            });
        }
        match segment.state() {
            Some(SegmentState::Ready) => {}
            state => {
                return Err(Error::MapFailed {
                    fingerprint,
                    reason: format!("segment is in state {state:?}"),
                });
            }
        }

        let mapping = segment.map_payload(false).map_err(|e| Error::MapFailed {
            fingerprint,
            reason: e.to_string(),
        })?;
        Ok(SegmentView::new(mapping, segment))
    }

    /// Remove the segment the guard covers, and its lock file.
    ///
    /// Idempotent: returns `Ok(false)` if there was nothing to remove. This
    /// must be the last thing done under the guard, since the lock file it
    /// holds is no longer reachable afterwards.
    ///
    /// # Errors
    ///
    /// `InvalidSegment` if the segment is still referenced.
    pub fn reclaim(&self, guard: &LockGuard) -> Result<bool> {
        let fingerprint = guard.fingerprint();
        let path = self.segment_path(fingerprint);

        let removed = match SegmentFile::open(&path, fingerprint, true)? {
            Probe::Missing => false,
            Probe::Residue(_) => remove_if_present(&path)?,
            Probe::Found(file) => {
                let count = file.header().ref_count();
                if count > 0 {
                    return Err(Error::InvalidSegment(format!(
                        "refusing to reclaim {fingerprint} with ref_count {count}"
                    )));
                }
                file.header().set_state(SegmentState::Reclaiming);
                file.sync_header()?;
                remove_if_present(&path)?
            }
        };

        remove_if_present(guard.path())?;
        if removed {
            tracing::info!(%fingerprint, "reclaimed shared segment");
        }
        Ok(removed)
    }

    /// Lock-free snapshot of a segment's header, in any state.
    pub fn status(&self, fingerprint: Fingerprint) -> Result<Option<SegmentStatus>> {
        match SegmentFile::open(&self.segment_path(fingerprint), fingerprint, false)? {
            Probe::Found(file) => Ok(Some(file.status())),
            Probe::Missing | Probe::Residue(_) => Ok(None),
        }
    }

    /// Fingerprints of all segment files present, in any state.
    ///
    /// Entries whose names are not fingerprints are skipped.
    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.config.shm_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(Fingerprint::from_hex) {
                Some(fp) => out.push(fp),
                None => tracing::trace!(name = ?name, "skipping foreign entry in segment directory"),
            }
        }
        out.sort();
        Ok(out)
    }

    /// Status of every `Ready` segment, read without taking locks.
    pub fn ready_segments(&self) -> Result<Vec<SegmentStatus>> {
        let mut out = Vec::new();
        for fingerprint in self.fingerprints()? {
            // A segment can vanish or fail to open between listing and
            // reading; that only means it is not resident.
            match self.status(fingerprint) {
                Ok(Some(status)) if status.is_ready() => out.push(status),
                Ok(_) => {}
                Err(e) => tracing::debug!(%fingerprint, "skipping unreadable segment: {e}"),
            }
        }
        Ok(out)
    }
}

/// Unlink `path`, treating "already gone" as success. Returns whether a
/// file was removed.
fn remove_if_present(path: &Path) -> Result<bool> {
    match rustix::fs::unlink(path) {
        Ok(()) => Ok(true),
        Err(rustix::io::Errno::NOENT) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Removes a half-created segment unless disarmed.
struct Rollback<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> Rollback<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match remove_if_present(self.path) {
            Ok(_) => tracing::debug!(path = %self.path.display(), "rolled back partial segment"),
            Err(e) => tracing::warn!(path = %self.path.display(), "failed to roll back segment: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::HolderId;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, StoreHandle) {
        let dir = tempdir().unwrap();
        let store = StoreHandle::open(StoreConfig::under(dir.path())).unwrap();
        (dir, store)
    }

    fn fill(byte: u8) -> impl FnOnce(&mut [u8]) -> std::io::Result<()> {
        move |buf| {
            buf.fill(byte);
            Ok(())
        }
    }

    #[test]
    fn test_open_creates_directories() {
        let (dir, store) = store();
        assert!(dir.path().join("segments").is_dir());
        assert!(dir.path().join("locks").is_dir());
        assert!(store.fingerprints().unwrap().is_empty());
    }

    #[test]
    fn test_create_lookup_attach() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        assert!(store.lookup(fp).unwrap().is_none());

        let guard = store.lock(fp, None).unwrap();
        let created = store.create_and_populate(&guard, 5000, fill(3)).unwrap();
        assert_eq!(created.state(), Some(SegmentState::Ready));
        drop(guard);

        let found = store.lookup(fp).unwrap().unwrap();
        let guard = store.lock(fp, None).unwrap();
        let view = store.attach(&guard, &found).unwrap();
        assert_eq!(view.len(), 5000);
        assert!(view.as_slice().iter().all(|&b| b == 3));
        assert_eq!(store.fingerprints().unwrap(), vec![fp]);
    }

    #[test]
    fn test_populate_failure_rolls_back() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        let guard = store.lock(fp, None).unwrap();
        let err = store
            .create_and_populate(&guard, 64, |_| Err(std::io::Error::other("disk gone")))
            .unwrap_err();
        assert!(matches!(err, Error::PopulateFailed { .. }));
        assert!(!store.segment_path(fp).exists());
    }

    #[test]
    fn test_populate_panic_rolls_back() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        let path = store.segment_path(fp);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let guard = store.lock(fp, None).unwrap();
            let _ = store.create_and_populate(&guard, 64, |_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_creating_residue_is_invisible_then_removed() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        // Simulate a creator that died before reaching Ready.
        let stale = SegmentFile::create(&store.segment_path(fp), fp, 64, 0).unwrap();
        drop(stale);

        assert!(store.lookup(fp).unwrap().is_none());
        assert!(store.ready_segments().unwrap().is_empty());

        let guard = store.lock(fp, None).unwrap();
        let inspection = store.inspect_locked(&guard).unwrap();
        assert!(inspection.removed_residue);
        assert!(inspection.segment.is_none());
        assert!(!store.segment_path(fp).exists());

        store.create_and_populate(&guard, 64, fill(1)).unwrap();
    }

    #[test]
    fn test_create_refuses_existing_ready_segment() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        let guard = store.lock(fp, None).unwrap();
        store.create_and_populate(&guard, 64, fill(1)).unwrap();
        assert!(matches!(
            store.create_and_populate(&guard, 64, fill(2)),
            Err(Error::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_reclaim_refuses_referenced_segment() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        let guard = store.lock(fp, None).unwrap();
        let segment = store.create_and_populate(&guard, 64, fill(1)).unwrap();
        lock::increment(&guard, &segment, HolderId::current()).unwrap();

        assert!(matches!(store.reclaim(&guard), Err(Error::InvalidSegment(_))));
        assert!(store.segment_path(fp).exists());

        lock::decrement(&guard, &segment, HolderId::current()).unwrap();
        assert!(store.reclaim(&guard).unwrap());
        assert!(!store.segment_path(fp).exists());
        assert!(!store.lock_path(fp).exists());
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        let guard = store.lock(fp, None).unwrap();
        assert!(!store.reclaim(&guard).unwrap());
        assert!(!store.reclaim(&guard).unwrap());
    }

    #[test]
    fn test_attach_after_reclaim_is_map_failed() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        {
            let guard = store.lock(fp, None).unwrap();
            store.create_and_populate(&guard, 64, fill(1)).unwrap();
        }

        let found = store.lookup(fp).unwrap().unwrap();
        {
            let guard = store.lock(fp, None).unwrap();
            store.reclaim(&guard).unwrap();
        }

        let guard = store.lock(fp, None).unwrap();
        let err = store.attach(&guard, &found).unwrap_err();
        assert!(matches!(err, Error::MapFailed { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_status_tracks_refcount() {
        let (_dir, store) = store();
        let fp = Fingerprint::of_content(b"t");
        let guard = store.lock(fp, None).unwrap();
        let segment = store.create_and_populate(&guard, 64, fill(1)).unwrap();
        lock::increment(&guard, &segment, HolderId::current()).unwrap();
        lock::increment(&guard, &segment, HolderId::current()).unwrap();

        let status = store.status(fp).unwrap().unwrap();
        assert!(status.is_ready());
        assert_eq!(status.ref_count, 2);
        assert_eq!(status.holders.len(), 1);
        assert_eq!(status.holders[0].refs, 2);
        assert_eq!(lock::ref_count(&guard, &segment).unwrap(), 2);
    }

    #[test]
    fn test_foreign_entries_are_skipped() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("segments").join("README"), b"x").unwrap();
        std::fs::write(dir.path().join("segments").join("abcd"), b"x").unwrap();
        assert!(store.fingerprints().unwrap().is_empty());
    }
}
