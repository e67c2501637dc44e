//! Handles returned by [`Agent::resolve_with`](super::Agent::resolve_with).

use super::AgentInner;
use crate::fingerprint::Fingerprint;
use crate::observability::ResolveKind;
use crate::store::SegmentView;
use bytes::Bytes;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// How a resolve obtained its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// This agent created and populated the segment.
    Created,
    /// The segment already existed (created by another agent or process).
    Attached,
    /// This agent already had the segment mapped and reused the mapping.
    Local,
}

impl From<ResolveOutcome> for ResolveKind {
    fn from(outcome: ResolveOutcome) -> Self {
        match outcome {
            ResolveOutcome::Created => ResolveKind::Miss,
            ResolveOutcome::Attached => ResolveKind::Hit,
            ResolveOutcome::Local => ResolveKind::Local,
        }
    }
}

/// A resolved tensor: a read-only view of a shared segment plus one
/// reference on it.
///
/// The reference is given back by [`Agent::release`](super::Agent::release)
/// or, failing that, when the handle is dropped.
pub struct TensorHandle {
    pub(super) agent: Arc<AgentInner>,
    pub(super) view: Arc<SegmentView>,
    pub(super) outcome: ResolveOutcome,
    pub(super) released: bool,
}

impl TensorHandle {
    /// Fingerprint of the tensor.
    pub fn fingerprint(&self) -> Fingerprint {
        self.view.fingerprint()
    }

    /// How this handle was resolved.
    pub fn outcome(&self) -> ResolveOutcome {
        self.outcome
    }

    /// Tensor bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.view.as_slice()
    }

    /// Zero-copy `Bytes` over the shared mapping.
    ///
    /// The reference is released when the last clone of the `Bytes` is dropped.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for TensorHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.view.as_slice()
    }
}

impl AsRef<[u8]> for TensorHandle {
    fn as_ref(&self) -> &[u8] {
        self.view.as_slice()
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("fingerprint", &self.fingerprint())
            .field("len", &self.view.len())
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl Drop for TensorHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.agent.release_ref(&self.view) {
            tracing::warn!(
                fingerprint = %self.view.fingerprint(),
                "failed to release dropped tensor handle: {e}"
            );
        }
    }
}
