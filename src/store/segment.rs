//! Segment files and their mappings.
//!
//! A segment file is `<header region><payload>`. The header region is the
//! [`SegmentHeader`] rounded up to the page size so the payload can be mapped
//! on its own at a page-aligned offset, read-only for attachers and
//! read-write only for the creator while it populates.

use super::header::{HolderRecord, SegmentHeader, SegmentState};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use rustix::fd::OwnedFd;
use rustix::fs::{FallocateFlags, Mode, OFlags};
use rustix::io::Errno;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Bytes reserved in front of the payload for the header.
pub(crate) fn header_region_len() -> usize {
    SegmentHeader::SIZE.next_multiple_of(rustix::param::page_size())
}

/// A shared `mmap` of part of a segment file.
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn new(fd: &OwnedFd, len: usize, offset: u64, writable: bool) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidSegment("cannot map an empty region".into()));
        }
        let prot = if writable {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };

        // SAFETY: we let the kernel pick the address, so no existing memory
        // is replaced.
        let ptr = unsafe {
            rustix::mm::mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, fd, offset)
                .map_err(|e| Error::from_sizing(e, "mmap"))?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidSegment("mmap returned null".into()))?;

        Ok(Self { ptr, len })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes this the only slice handed out
        // from this mapping, and only writable mappings are used this way.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn sync(&self) -> Result<()> {
        // SAFETY: the range is exactly our live mapping.
        unsafe { rustix::mm::msync(self.ptr.as_ptr().cast(), self.len, MsyncFlags::SYNC)? };
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the range is exactly our live mapping and no slices outlive it.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is plain shared memory with no thread affinity.
// Mutable access requires `&mut Mapping`.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Device and inode of a segment file, used to tell a segment from its
/// replacement at the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    fn of(stat: &rustix::fs::Stat) -> Self {
        Self {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        }
    }
}

/// Outcome of opening a segment file without interpreting its state.
pub(crate) enum Probe {
    /// No file at the path.
    Missing,
    /// A file exists but its header is unusable.
    Residue(String),
    /// A file with a valid header for the expected fingerprint.
    Found(SegmentFile),
}

/// An open segment file with its header mapped.
pub struct SegmentFile {
    fd: OwnedFd,
    path: PathBuf,
    fingerprint: Fingerprint,
    identity: FileIdentity,
    header: Mapping,
    header_len: usize,
}

impl SegmentFile {
    /// Open the segment at `path` and validate its header.
    pub(crate) fn open(path: &Path, fingerprint: Fingerprint, writable: bool) -> Result<Probe> {
        let access = if writable { OFlags::RDWR } else { OFlags::RDONLY };
        let fd = match rustix::fs::open(path, access | OFlags::CLOEXEC, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::NOENT) => return Ok(Probe::Missing),
            Err(e) => return Err(e.into()),
        };

        let stat = rustix::fs::fstat(&fd)?;
        let file_len = stat.st_size as u64;
        let header_len = header_region_len();
        if file_len < header_len as u64 {
            return Ok(Probe::Residue(format!(
                "file is {file_len} bytes, shorter than its header"
            )));
        }

        let header = Mapping::new(&fd, header_len, 0, writable)?;
        let file = SegmentFile {
            fd,
            path: path.to_path_buf(),
            fingerprint,
            identity: FileIdentity::of(&stat),
            header,
            header_len,
        };

        if let Err(e) = file.header().validate() {
            return Ok(Probe::Residue(e.to_string()));
        }
        let recorded = file.header().fingerprint();
        if recorded != fingerprint {
            return Ok(Probe::Residue(format!("header records fingerprint {recorded}")));
        }
        let needed = (header_len as u64).saturating_add(file.header().payload_len());
        if file_len < needed {
            return Ok(Probe::Residue(format!(
                "file is {file_len} bytes, payload needs {needed}"
            )));
        }

        Ok(Probe::Found(file))
    }

    /// Create a new segment file in `Creating` state.
    ///
    /// The file is removed again if sizing or header setup fails.
    pub(crate) fn create(
        path: &Path,
        fingerprint: Fingerprint,
        payload_len: u64,
        now_ms: u64,
    ) -> Result<Self> {
        let header_len = header_region_len();
        let file_len = (header_len as u64).checked_add(payload_len).ok_or_else(|| {
            Error::AllocationFailed(format!("segment of {payload_len} bytes is too large"))
        })?;

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
        )?;

        let result = Self::init_created(fd, path, fingerprint, header_len, file_len, payload_len, now_ms);
        if result.is_err() {
            if let Err(e) = rustix::fs::unlink(path) {
                tracing::warn!(path = %path.display(), "failed to remove partial segment: {e}");
            }
        }
        result
    }

    fn init_created(
        fd: OwnedFd,
        path: &Path,
        fingerprint: Fingerprint,
        header_len: usize,
        file_len: u64,
        payload_len: u64,
        now_ms: u64,
    ) -> Result<Self> {
        rustix::fs::ftruncate(&fd, file_len).map_err(|e| Error::from_sizing(e, "ftruncate"))?;

        // Reserve the pages up front so exhaustion is an error here rather
        // than SIGBUS while populating.
        match rustix::fs::fallocate(&fd, FallocateFlags::empty(), 0, file_len) {
            Ok(()) => {}
            Err(Errno::OPNOTSUPP) => {
                tracing::debug!(path = %path.display(), "fallocate unsupported, segment is sparse");
            }
            Err(e) => return Err(Error::from_sizing(e, "fallocate")),
        }

        let stat = rustix::fs::fstat(&fd)?;
        let header = Mapping::new(&fd, header_len, 0, true)?;
        let file = SegmentFile {
            fd,
            path: path.to_path_buf(),
            fingerprint,
            identity: FileIdentity::of(&stat),
            header,
            header_len,
        };
        file.header().init(fingerprint, payload_len, now_ms);
        file.sync_header()?;
        Ok(file)
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is page-aligned, at least SIZE bytes long and
        // lives as long as `self`. Every header field is an atomic, so
        // concurrent writers in other processes are fine.
        unsafe { &*self.header.ptr.as_ptr().cast::<SegmentHeader>() }
    }

    /// Flush header changes to the backing object.
    pub(crate) fn sync_header(&self) -> Result<()> {
        self.header.sync()
    }

    /// Map the payload region.
    pub(crate) fn map_payload(&self, writable: bool) -> Result<Mapping> {
        let len = usize::try_from(self.payload_len()).map_err(|_| {
            Error::AllocationFailed(format!(
                "payload of {} bytes does not fit the address space",
                self.payload_len()
            ))
        })?;
        Mapping::new(&self.fd, len, self.header_len as u64, writable)
    }

    /// Whether the path still names this file (it was not reclaimed or replaced).
    pub(crate) fn still_linked(&self) -> Result<bool> {
        match rustix::fs::stat(&self.path) {
            Ok(stat) => Ok(FileIdentity::of(&stat) == self.identity),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub(crate) fn identity(&self) -> FileIdentity {
        self.identity
    }

    /// Fingerprint named by the file.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Path of the backing object.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lifecycle state, `None` if the header holds an unknown value.
    pub fn state(&self) -> Option<SegmentState> {
        self.header().state()
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> u64 {
        self.header().payload_len()
    }

    /// Snapshot of the header.
    pub fn status(&self) -> SegmentStatus {
        let header = self.header();
        SegmentStatus {
            fingerprint: self.fingerprint,
            state: header.state(),
            payload_len: header.payload_len(),
            ref_count: header.ref_count(),
            untracked_refs: header.untracked_refs(),
            holders: header.holders(),
            created_at_ms: header.created_at_ms(),
            idle_since_ms: header.idle_since_ms(),
            keep_warm_until_ms: header.keep_warm_until_ms(),
        }
    }
}

impl fmt::Debug for SegmentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentFile")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

/// Point-in-time view of a segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStatus {
    /// Segment fingerprint.
    pub fingerprint: Fingerprint,
    /// Lifecycle state (`None` for an unknown value).
    pub state: Option<SegmentState>,
    /// Payload size in bytes.
    pub payload_len: u64,
    /// Persisted reference count.
    pub ref_count: u32,
    /// References that did not fit the holder table.
    pub untracked_refs: u32,
    /// Recorded holders.
    pub holders: Vec<HolderRecord>,
    /// Creation time (ms since the Unix epoch).
    pub created_at_ms: u64,
    /// When the count last reached zero (0 while referenced).
    pub idle_since_ms: u64,
    /// Keep-warm deadline stamped by the releasing agent (0 if none).
    pub keep_warm_until_ms: u64,
}

impl SegmentStatus {
    /// Whether the segment is populated and attachable.
    pub fn is_ready(&self) -> bool {
        self.state == Some(SegmentState::Ready)
    }
}

/// A read-only mapping of a segment's payload.
///
/// Stays valid after the segment is unlinked; the memory is freed once the
/// last mapping in any process goes away.
pub struct SegmentView {
    mapping: Mapping,
    fingerprint: Fingerprint,
    identity: FileIdentity,
}

impl SegmentView {
    pub(crate) fn new(mapping: Mapping, segment: &SegmentFile) -> Self {
        Self {
            mapping,
            fingerprint: segment.fingerprint,
            identity: segment.identity,
        }
    }

    /// Payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.mapping.len
    }

    /// Always false; segments are never empty.
    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    /// Fingerprint of the mapped segment.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Whether `segment` is the file this view maps.
    pub(crate) fn maps(&self, segment: &SegmentFile) -> bool {
        self.identity == segment.identity
    }
}

impl fmt::Debug for SegmentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentView")
            .field("fingerprint", &self.fingerprint)
            .field("len", &self.mapping.len)
            .finish()
    }
}
