//! Segment header stored at the start of every segment file.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ SegmentHeader (page-aligned region, header_len bytes)           │
//! │ ┌─────────────────────────────────────────────────────────────┐ │
//! │ │ magic: u64          │ version: u32  │ state: u32            │ │
//! │ │ payload_len: u64                                            │ │
//! │ │ ref_count: u32      │ untracked_refs: u32                   │ │
//! │ │ created_at_ms: u64  │ idle_since_ms: u64                    │ │
//! │ │ keep_warm_until_ms: u64                                     │ │
//! │ │ fingerprint: [u64; 4]                                       │ │
//! │ │ holders: [HolderSlot; 64]  {pid, refs, pid_ns}              │ │
//! │ └─────────────────────────────────────────────────────────────┘ │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Payload (payload_len bytes, write-once, mapped read-only)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every field is an atomic so that concurrent readers in other processes
//! never observe torn values. All mutations happen while the segment's
//! lock file is held, so the atomics never race with each other; they only
//! order the writes for lock-free readers such as `lookup` and the collector.

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::lock::HolderId;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number identifying a segment header ("TSHMSEG\x01").
const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"TSHMSEG\x01");

/// Current header format version.
const SEGMENT_VERSION: u32 = 2;

/// Number of holder slots tracked per segment.
pub const MAX_HOLDERS: usize = 64;

/// Lifecycle state of a segment (stored in shared memory).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    /// Being populated by the lock holder.
    Creating = 1,
    /// Populated and immutable.
    Ready = 2,
    /// Being removed by the lock holder.
    Reclaiming = 3,
}

impl SegmentState {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(SegmentState::Creating),
            2 => Some(SegmentState::Ready),
            3 => Some(SegmentState::Reclaiming),
            _ => None,
        }
    }
}

/// One recorded holder and the references it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolderRecord {
    /// Slot index in the header table.
    pub slot: usize,
    /// Holder identity.
    pub holder: HolderId,
    /// References owned by the holder.
    pub refs: u32,
}

#[repr(C, align(8))]
struct HolderSlot {
    pid: AtomicU32,
    refs: AtomicU32,
    pid_ns: AtomicU64,
}

impl HolderSlot {
    fn matches(&self, holder: HolderId) -> bool {
        self.refs.load(Ordering::Acquire) > 0
            && self.pid.load(Ordering::Acquire) == holder.pid
            && self.pid_ns.load(Ordering::Acquire) == holder.pid_ns
    }

    fn clear(&self) {
        self.refs.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
        self.pid_ns.store(0, Ordering::Release);
    }
}

/// Header at the start of a segment file (in shared memory).
#[repr(C, align(64))]
pub(crate) struct SegmentHeader {
    magic: AtomicU64,
    version: AtomicU32,
    state: AtomicU32,
    payload_len: AtomicU64,
    ref_count: AtomicU32,
    untracked_refs: AtomicU32,
    created_at_ms: AtomicU64,
    idle_since_ms: AtomicU64,
    keep_warm_until_ms: AtomicU64,
    fingerprint: [AtomicU64; 4],
    holders: [HolderSlot; MAX_HOLDERS],
}

// The header must fit in the smallest page size we map it with.
const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= 4096);

impl SegmentHeader {
    /// Bytes occupied by the header structure.
    pub(crate) const SIZE: usize = std::mem::size_of::<SegmentHeader>();

    /// Initialize a freshly truncated (zeroed) header in `Creating` state.
    pub(crate) fn init(&self, fingerprint: Fingerprint, payload_len: u64, now_ms: u64) {
        self.state.store(SegmentState::Creating as u32, Ordering::Release);
        self.payload_len.store(payload_len, Ordering::Release);
        self.ref_count.store(0, Ordering::Release);
        self.untracked_refs.store(0, Ordering::Release);
        self.created_at_ms.store(now_ms, Ordering::Release);
        self.idle_since_ms.store(0, Ordering::Release);
        self.keep_warm_until_ms.store(0, Ordering::Release);
        for (slot, word) in self.fingerprint.iter().zip(fingerprint.to_words()) {
            slot.store(word, Ordering::Release);
        }
        for holder in &self.holders {
            holder.clear();
        }
        self.version.store(SEGMENT_VERSION, Ordering::Release);
        self.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// Validate the header is properly initialized.
    pub(crate) fn validate(&self) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "invalid segment magic: expected {:x}, got {:x}",
                SEGMENT_MAGIC, magic
            )));
        }
        let version = self.version.load(Ordering::Acquire);
        if version != SEGMENT_VERSION {
            return Err(Error::InvalidSegment(format!(
                "unsupported segment version: expected {}, got {}",
                SEGMENT_VERSION, version
            )));
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> Option<SegmentState> {
        SegmentState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SegmentState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub(crate) fn payload_len(&self) -> u64 {
        self.payload_len.load(Ordering::Acquire)
    }

    pub(crate) fn fingerprint(&self) -> Fingerprint {
        let mut words = [0u64; 4];
        for (out, slot) in words.iter_mut().zip(&self.fingerprint) {
            *out = slot.load(Ordering::Acquire);
        }
        Fingerprint::from_words(words)
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn untracked_refs(&self) -> u32 {
        self.untracked_refs.load(Ordering::Acquire)
    }

    pub(crate) fn created_at_ms(&self) -> u64 {
        self.created_at_ms.load(Ordering::Acquire)
    }

    /// Time the count last dropped to zero (0 while referenced).
    pub(crate) fn idle_since_ms(&self) -> u64 {
        self.idle_since_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle_since(&self, ms: u64) {
        self.idle_since_ms.store(ms, Ordering::Release);
    }

    /// Deadline set by the releasing agent's keep-warm policy (0 if none).
    pub(crate) fn keep_warm_until_ms(&self) -> u64 {
        self.keep_warm_until_ms.load(Ordering::Acquire)
    }

    /// Mark the segment idle from `now_ms`, to be kept until `until_ms`.
    pub(crate) fn mark_kept_warm(&self, now_ms: u64, until_ms: u64) {
        self.idle_since_ms.store(now_ms, Ordering::Release);
        self.keep_warm_until_ms.store(until_ms, Ordering::Release);
    }

    /// Record one more reference owned by `holder`. Returns the new count.
    pub(crate) fn add_ref(&self, holder: HolderId) -> Result<u32> {
        let count = self.ref_count();
        let next = count
            .checked_add(1)
            .ok_or_else(|| Error::InvalidSegment("reference count overflow".into()))?;

        if let Some(slot) = self.holders.iter().find(|s| s.matches(holder)) {
            slot.refs.fetch_add(1, Ordering::AcqRel);
        } else if let Some(slot) = self
            .holders
            .iter()
            .find(|s| s.refs.load(Ordering::Acquire) == 0)
        {
            slot.pid.store(holder.pid, Ordering::Release);
            slot.pid_ns.store(holder.pid_ns, Ordering::Release);
            slot.refs.store(1, Ordering::Release);
        } else {
            self.untracked_refs.fetch_add(1, Ordering::AcqRel);
        }

        self.ref_count.store(next, Ordering::Release);
        self.idle_since_ms.store(0, Ordering::Release);
        self.keep_warm_until_ms.store(0, Ordering::Release);
        Ok(next)
    }

    /// Drop one reference owned by `holder`. Returns the new count.
    pub(crate) fn remove_ref(&self, holder: HolderId) -> Result<u32> {
        let count = self.ref_count();
        if count == 0 {
            return Err(Error::InvalidSegment(format!(
                "reference count underflow on {}",
                self.fingerprint()
            )));
        }

        if let Some(slot) = self.holders.iter().find(|s| s.matches(holder)) {
            if slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                slot.clear();
            }
        } else if self.untracked_refs() > 0 {
            self.untracked_refs.fetch_sub(1, Ordering::AcqRel);
        } else {
            tracing::warn!(
                fingerprint = %self.fingerprint(),
                pid = holder.pid,
                "releasing a reference with no holder record"
            );
        }

        let next = count - 1;
        self.ref_count.store(next, Ordering::Release);
        Ok(next)
    }

    /// Snapshot of the holder table.
    pub(crate) fn holders(&self) -> Vec<HolderRecord> {
        self.holders
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| {
                let refs = s.refs.load(Ordering::Acquire);
                (refs > 0).then(|| HolderRecord {
                    slot,
                    holder: HolderId {
                        pid: s.pid.load(Ordering::Acquire),
                        pid_ns: s.pid_ns.load(Ordering::Acquire),
                    },
                    refs,
                })
            })
            .collect()
    }

    /// Remove a holder slot and its references from the count.
    ///
    /// Returns the number of references discounted.
    pub(crate) fn discount(&self, slot: usize) -> u32 {
        let Some(s) = self.holders.get(slot) else {
            return 0;
        };
        let refs = s.refs.load(Ordering::Acquire);
        s.clear();
        let count = self.ref_count();
        self.ref_count.store(count.saturating_sub(refs), Ordering::Release);
        refs
    }
}
