//! Per-fingerprint advisory locks and persisted reference counts.
//!
//! Every fingerprint has a lock file `<lock_dir>/<hex>` locked with
//! `flock(LOCK_EX)`. The kernel drops the lock when the owning open file
//! description is closed, which includes process death, so a crashed holder
//! never wedges its fingerprint.
//!
//! Reference-count mutations require a [`LockGuard`] for the segment's
//! fingerprint. The count lives in the segment header, next to a table of
//! holders that lets the collector discount references of dead processes.
//!
//! # Lock file replacement
//!
//! Reclaiming a segment also unlinks its lock file. A waiter that opened the
//! old file may acquire a lock nobody else will ever look at again, so after
//! acquiring, the holder checks that the path still names the inode it locked
//! and starts over if not.

pub mod holder;

pub use holder::HolderId;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::observability;
use crate::store::SegmentFile;
use rustix::fd::OwnedFd;
use rustix::fs::{FlockOperation, Mode, OFlags};
use rustix::io::Errno;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// First sleep between non-blocking lock attempts.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Upper bound for the sleep between non-blocking lock attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// An exclusively held per-fingerprint lock.
///
/// Released on drop. Not re-entrant: acquiring a second guard for the same
/// fingerprint from the same thread deadlocks (or times out).
#[derive(Debug)]
pub struct LockGuard {
    fd: OwnedFd,
    fingerprint: Fingerprint,
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock for `fingerprint` under `lock_dir`.
    ///
    /// With `timeout = None` this blocks until the lock is available.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the deadline passes, or a system error if the
    /// lock file cannot be opened.
    pub fn acquire(
        lock_dir: &Path,
        fingerprint: Fingerprint,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let path = lock_dir.join(fingerprint.to_hex());
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);

        loop {
            let fd = rustix::fs::open(
                &path,
                OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
                Mode::from_raw_mode(0o644),
            )?;

            match deadline {
                Some(deadline) => lock_until(&fd, fingerprint, start, deadline)?,
                None => lock_blocking(&fd)?,
            }

            if names_same_inode(&path, &fd)? {
                observability::record_lock_wait(start.elapsed());
                return Ok(Self {
                    fd,
                    fingerprint,
                    path,
                });
            }

            tracing::debug!(%fingerprint, "lock file was replaced while waiting, retrying");
        }
    }

    /// Fingerprint this guard locks.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail unless this guard locks `fingerprint`.
    pub(crate) fn ensure_covers(&self, fingerprint: Fingerprint) -> Result<()> {
        if self.fingerprint != fingerprint {
            return Err(Error::InvalidSegment(format!(
                "lock for {} does not cover segment {}",
                self.fingerprint, fingerprint
            )));
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the fd would release it too; unlock first so waiters wake
        // even if the fd was duplicated somewhere.
        let _ = rustix::fs::flock(&self.fd, FlockOperation::Unlock);
    }
}

fn lock_blocking(fd: &OwnedFd) -> Result<()> {
    loop {
        match rustix::fs::flock(fd, FlockOperation::LockExclusive) {
            Ok(()) => return Ok(()),
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn lock_until(
    fd: &OwnedFd,
    fingerprint: Fingerprint,
    start: Instant,
    deadline: Instant,
) -> Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match rustix::fs::flock(fd, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => return Ok(()),
            Err(Errno::WOULDBLOCK) | Err(Errno::INTR) => {}
            Err(e) => return Err(e.into()),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::LockTimeout {
                fingerprint,
                waited: now - start,
            });
        }
        std::thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn names_same_inode(path: &Path, fd: &OwnedFd) -> Result<bool> {
    let locked = rustix::fs::fstat(fd)?;
    match rustix::fs::stat(path) {
        Ok(current) => Ok(current.st_ino == locked.st_ino && current.st_dev == locked.st_dev),
        Err(Errno::NOENT) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Run `f` while holding the lock for `fingerprint`.
///
/// The lock is released on every exit path, including unwinding.
pub fn with_exclusive_lock<T>(
    lock_dir: &Path,
    fingerprint: Fingerprint,
    timeout: Option<Duration>,
    f: impl FnOnce(&LockGuard) -> Result<T>,
) -> Result<T> {
    let guard = LockGuard::acquire(lock_dir, fingerprint, timeout)?;
    f(&guard)
}

/// Record one more reference held by `holder` and persist it.
///
/// Returns the new count.
pub fn increment(guard: &LockGuard, segment: &SegmentFile, holder: HolderId) -> Result<u32> {
    guard.ensure_covers(segment.fingerprint())?;
    let count = segment.header().add_ref(holder)?;
    segment.sync_header()?;
    tracing::trace!(fingerprint = %segment.fingerprint(), count, "ref_count incremented");
    Ok(count)
}

/// Drop one reference held by `holder` and persist it.
///
/// Returns the new count. At zero the caller decides whether to reclaim.
pub fn decrement(guard: &LockGuard, segment: &SegmentFile, holder: HolderId) -> Result<u32> {
    guard.ensure_covers(segment.fingerprint())?;
    let count = segment.header().remove_ref(holder)?;
    segment.sync_header()?;
    tracing::trace!(fingerprint = %segment.fingerprint(), count, "ref_count decremented");
    Ok(count)
}

/// Current persisted count.
pub fn ref_count(guard: &LockGuard, segment: &SegmentFile) -> Result<u32> {
    guard.ensure_covers(segment.fingerprint())?;
    Ok(segment.header().ref_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_content(b"lock");
        let guard = LockGuard::acquire(dir.path(), fp, None).unwrap();
        assert_eq!(guard.fingerprint(), fp);
        assert!(dir.path().join(fp.to_hex()).exists());
    }

    #[test]
    fn test_timeout_while_held() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_content(b"lock");
        let _held = LockGuard::acquire(dir.path(), fp, None).unwrap();

        let err = LockGuard::acquire(dir.path(), fp, Some(Duration::from_millis(20))).unwrap_err();
        match err {
            Error::LockTimeout { fingerprint, waited } => {
                assert_eq!(fingerprint, fp);
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_distinct_fingerprints_do_not_contend() {
        let dir = tempdir().unwrap();
        let _a = LockGuard::acquire(dir.path(), Fingerprint::of_content(b"a"), None).unwrap();
        let _b = LockGuard::acquire(
            dir.path(),
            Fingerprint::of_content(b"b"),
            Some(Duration::from_millis(10)),
        )
        .unwrap();
    }

    #[test]
    fn test_release_on_drop_wakes_waiter() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_content(b"lock");
        let held = LockGuard::acquire(dir.path(), fp, None).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let lock_dir = dir.path().to_path_buf();
        let flag = acquired.clone();
        let waiter = std::thread::spawn(move || {
            let _g = LockGuard::acquire(&lock_dir, fp, Some(Duration::from_secs(5))).unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_waiter_follows_replaced_lock_file() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_content(b"lock");
        let held = LockGuard::acquire(dir.path(), fp, None).unwrap();

        let lock_dir = dir.path().to_path_buf();
        let waiter = std::thread::spawn(move || {
            LockGuard::acquire(&lock_dir, fp, Some(Duration::from_secs(5))).unwrap()
        });

        std::thread::sleep(Duration::from_millis(30));
        std::fs::remove_file(held.path()).unwrap();
        drop(held);

        let guard = waiter.join().unwrap();
        // The waiter ends up holding a lock on the file the path now names.
        let on_disk = rustix::fs::stat(guard.path()).unwrap();
        let locked = rustix::fs::fstat(&guard.fd).unwrap();
        assert_eq!(on_disk.st_ino, locked.st_ino);
    }

    #[test]
    fn test_with_exclusive_lock_returns_value() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_content(b"lock");
        let v = with_exclusive_lock(dir.path(), fp, None, |g| {
            assert_eq!(g.fingerprint(), fp);
            Ok(41 + 1)
        })
        .unwrap();
        assert_eq!(v, 42);
        // Released afterwards.
        LockGuard::acquire(dir.path(), fp, Some(Duration::from_millis(10))).unwrap();
    }

    #[test]
    fn test_guard_must_cover_fingerprint() {
        let dir = tempdir().unwrap();
        let guard = LockGuard::acquire(dir.path(), Fingerprint::of_content(b"a"), None).unwrap();
        assert!(guard.ensure_covers(Fingerprint::of_content(b"a")).is_ok());
        assert!(matches!(
            guard.ensure_covers(Fingerprint::of_content(b"b")),
            Err(Error::InvalidSegment(_))
        ));
    }
}
