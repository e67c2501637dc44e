//! The allocation agent embedded in each serving process.
//!
//! An [`Agent`] turns tensor descriptors into read-only views of shared
//! segments. The first process to ask for a fingerprint creates and
//! populates the segment; everyone else attaches to it.
//!
//! ```text
//! resolve(desc)
//!   │ fingerprint
//!   ├─ already mapped here? ──▶ lock, increment ─────────────────────▶ Local
//!   ├─ lookup (no lock) hit? ─▶ lock, attach, increment ─────────────▶ Attached
//!   └─ miss ─▶ lock ─▶ re-check ─┬─ present ─▶ attach, increment ────▶ Attached
//!                                └─ absent ──▶ create, increment ────▶ Created
//! ```
//!
//! Resolves of the same fingerprint within one agent are serialized by a
//! per-fingerprint local mutex; across processes the fingerprint's lock file
//! serializes them. `MapFailed` and `LockTimeout` restart the sequence up to
//! `max_retries` times.
//!
//! # Example
//!
//! ```rust,ignore
//! use tensorshm::prelude::*;
//!
//! let store = StoreHandle::open(StoreConfig::from_env())?;
//! let agent = Agent::new(store, AgentConfig::from_env()?);
//! let desc = TensorDescriptor::builder("bert", "encoder.0.weight")
//!     .shape([768, 768])
//!     .dtype(DType::F32)
//!     .source(SourceRef::Offset(4096))
//!     .build()?;
//! let weights = agent.resolve_from_file(&desc, "/models/bert.bin", 4096)?;
//! assert_eq!(weights.len(), 768 * 768 * 4);
//! ```

mod handle;

pub use handle::{ResolveOutcome, TensorHandle};

use crate::config::{AgentConfig, ReclaimPolicy};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, TensorDescriptor, fingerprint};
use crate::lock::{self, HolderId, LockGuard};
use crate::observability::{self, AgentMetrics};
use crate::placement::ModelManifest;
use crate::store::{self, SegmentFile, SegmentView, StoreHandle};
use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-fingerprint state of one agent.
#[derive(Default)]
struct LocalSlot {
    /// Mapping shared by all outstanding handles.
    view: Option<Arc<SegmentView>>,
    /// Outstanding references this agent holds on the segment.
    refs: u32,
}

/// Shared state behind an [`Agent`] and its handles.
pub(crate) struct AgentInner {
    store: StoreHandle,
    config: AgentConfig,
    holder: HolderId,
    slots: Mutex<HashMap<Fingerprint, Arc<Mutex<LocalSlot>>>>,
    manifest: Mutex<ModelManifest>,
    closed: AtomicBool,
    metrics: AgentMetrics,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves tensors to shared segments on behalf of one serving runtime.
///
/// Dropping the agent runs [`shutdown`](Agent::shutdown).
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Create an agent over `store`.
    pub fn new(store: StoreHandle, config: AgentConfig) -> Self {
        observability::init_metrics();
        let metrics = AgentMetrics::new(&config.model_id);
        let manifest = ModelManifest::new(config.model_id.clone());
        Self {
            inner: Arc::new(AgentInner {
                store,
                holder: HolderId::current(),
                slots: Mutex::new(HashMap::new()),
                manifest: Mutex::new(manifest),
                closed: AtomicBool::new(false),
                metrics,
                config,
            }),
        }
    }

    /// Store this agent resolves against.
    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    /// Agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Resolve `desc`, calling `populate` to fill the segment if this agent
    /// ends up creating it.
    ///
    /// `populate` receives the zero-initialized payload (exactly
    /// `desc.byte_size()` bytes) and is called at most once.
    ///
    /// # Errors
    ///
    /// - `InvalidDescriptor` for a malformed descriptor
    /// - `AllocationFailed` if shared memory is exhausted (never retried)
    /// - `MapFailed` / `LockTimeout` once retries are exhausted
    /// - `PopulateFailed` if `populate` fails
    /// - `InvalidSegment` if an existing segment disagrees with `desc`
    /// - `ShutDown` after [`shutdown`](Self::shutdown)
    pub fn resolve_with<F>(&self, desc: &TensorDescriptor, populate: F) -> Result<TensorHandle>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<()>,
    {
        let inner = &self.inner;
        inner.ensure_open()?;
        let fingerprint = fingerprint(desc)?;
        let _span = observability::span_resolve(&inner.config.model_id, fingerprint).entered();

        let slot = inner.slot(fingerprint);
        let result = inner.resolve_in_slot(&slot, desc, fingerprint, populate);
        inner.forget_if_unused(fingerprint, slot);

        let (view, outcome) = result?;
        locked(&inner.manifest).record(desc.variable_name(), fingerprint, desc.byte_size());
        inner.metrics.record_resolve(outcome.into());
        tracing::debug!(%fingerprint, ?outcome, "resolved tensor");

        Ok(TensorHandle {
            agent: inner.clone(),
            view,
            outcome,
            released: false,
        })
    }

    /// Resolve `desc`, copying `bytes` into the segment if it must be created.
    pub fn resolve_bytes(&self, desc: &TensorDescriptor, bytes: &[u8]) -> Result<TensorHandle> {
        if bytes.len() as u64 != desc.byte_size() {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor declares {} bytes, {} supplied",
                desc.byte_size(),
                bytes.len()
            )));
        }
        self.resolve_with(desc, |buf| {
            buf.copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Resolve `desc`, reading `desc.byte_size()` bytes at `offset` of the
    /// model file at `path` if the segment must be created.
    ///
    /// The file is only opened on a miss.
    pub fn resolve_from_file(
        &self,
        desc: &TensorDescriptor,
        path: impl AsRef<Path>,
        offset: u64,
    ) -> Result<TensorHandle> {
        let path = path.as_ref();
        self.resolve_with(desc, |buf| {
            let file = std::fs::File::open(path)?;
            file.read_exact_at(buf, offset)
        })
    }

    /// Give back the reference held by `handle`.
    ///
    /// Unlike dropping the handle, this reports failures.
    pub fn release(&self, mut handle: TensorHandle) -> Result<()> {
        if !Arc::ptr_eq(&handle.agent, &self.inner) {
            return Err(Error::InvalidSegment(
                "tensor handle belongs to a different agent".into(),
            ));
        }
        handle.released = true;
        self.inner.release_ref(&handle.view)
    }

    /// References this agent currently holds on `fingerprint`.
    pub fn outstanding(&self, fingerprint: Fingerprint) -> u32 {
        let slot = locked(&self.inner.slots).get(&fingerprint).cloned();
        slot.map(|s| locked(&s).refs).unwrap_or(0)
    }

    /// Tensors this agent has resolved so far.
    pub fn manifest(&self) -> ModelManifest {
        locked(&self.inner.manifest).clone()
    }

    /// Release every outstanding reference and refuse further resolves.
    ///
    /// Handles still alive keep their mappings but no longer hold a
    /// reference; dropping them afterwards does nothing. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Err(e) = self.inner.shutdown() {
            tracing::warn!(model = %self.inner.config.model_id, "agent shutdown failed: {e}");
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.inner.config.model_id)
            .field("holder", &self.inner.holder)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl AgentInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    fn slot(&self, fingerprint: Fingerprint) -> Arc<Mutex<LocalSlot>> {
        locked(&self.slots).entry(fingerprint).or_default().clone()
    }

    /// Drop the map entry for `fingerprint` if nobody else uses it.
    fn forget_if_unused(&self, fingerprint: Fingerprint, slot: Arc<Mutex<LocalSlot>>) {
        let mut slots = locked(&self.slots);
        // Clones are only made under the map lock, so with the map's copy and
        // ours being the only two, nobody can be waiting on the slot.
        if Arc::strong_count(&slot) == 2 && locked(&slot).refs == 0 {
            slots.remove(&fingerprint);
        }
    }

    fn resolve_in_slot<F>(
        &self,
        slot: &Mutex<LocalSlot>,
        desc: &TensorDescriptor,
        fingerprint: Fingerprint,
        populate: F,
    ) -> Result<(Arc<SegmentView>, ResolveOutcome)>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<()>,
    {
        let mut local = locked(slot);
        // Shutdown may have drained this slot while we waited for it.
        self.ensure_open()?;

        let mut populate = Some(populate);
        let mut attempt = 0;
        let (view, outcome) = loop {
            match self.resolve_once(&local, desc, fingerprint, &mut populate) {
                Ok(resolved) => break resolved,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.metrics.record_retry();
                    tracing::debug!(%fingerprint, attempt, "retrying resolve: {e}");
                }
                Err(e) => return Err(e),
            }
        };

        local.refs += 1;
        local.view = Some(view.clone());
        Ok((view, outcome))
    }

    fn resolve_once<F>(
        &self,
        local: &LocalSlot,
        desc: &TensorDescriptor,
        fingerprint: Fingerprint,
        populate: &mut Option<F>,
    ) -> Result<(Arc<SegmentView>, ResolveOutcome)>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<()>,
    {
        let store = &self.store;
        let timeout = self.config.lock_timeout;

        if let Some(view) = &local.view {
            let guard = store.lock(fingerprint, timeout)?;
            let segment = self.held_segment(&guard, view)?.ok_or_else(|| {
                Error::InvalidSegment(format!(
                    "segment {fingerprint} vanished while this process references it"
                ))
            })?;
            lock::increment(&guard, &segment, self.holder)?;
            return Ok((view.clone(), ResolveOutcome::Local));
        }

        if let Some(segment) = store.lookup(fingerprint)? {
            check_size(&segment, desc)?;
            let guard = store.lock(fingerprint, timeout)?;
            let view = self.attach_counted(&guard, &segment)?;
            return Ok((view, ResolveOutcome::Attached));
        }

        let guard = store.lock(fingerprint, timeout)?;
        // Someone may have created it between our lookup and the lock.
        if let Some(segment) = store.open_locked(&guard)? {
            check_size(&segment, desc)?;
            let view = self.attach_counted(&guard, &segment)?;
            return Ok((view, ResolveOutcome::Attached));
        }

        let populate = populate.take().ok_or_else(|| {
            Error::InvalidSegment(format!(
                "segment {fingerprint} must be re-created but its populate callback was already used"
            ))
        })?;
        let segment = store.create_and_populate(&guard, desc.byte_size(), populate)?;
        let view = self.attach_counted(&guard, &segment)?;
        Ok((view, ResolveOutcome::Created))
    }

    /// Map `segment`, then record this process's reference to it.
    ///
    /// A failed mapping leaves the persisted count untouched.
    fn attach_counted(&self, guard: &LockGuard, segment: &SegmentFile) -> Result<Arc<SegmentView>> {
        let view = self.store.attach(guard, segment)?;
        lock::increment(guard, segment, self.holder)?;
        Ok(Arc::new(view))
    }

    /// The locked segment, if it is still the one `view` maps.
    fn held_segment(&self, guard: &LockGuard, view: &SegmentView) -> Result<Option<SegmentFile>> {
        Ok(self
            .store
            .open_locked(guard)?
            .filter(|segment| view.maps(segment)))
    }

    pub(crate) fn release_ref(&self, view: &Arc<SegmentView>) -> Result<()> {
        let fingerprint = view.fingerprint();
        let _span = observability::span_release(&self.config.model_id, fingerprint).entered();

        let Some(slot) = locked(&self.slots).get(&fingerprint).cloned() else {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            return Err(Error::InvalidSegment(format!(
                "no outstanding reference on {fingerprint}"
            )));
        };

        let result = self.release_in_slot(&slot, view);
        self.forget_if_unused(fingerprint, slot);
        result
    }

    fn release_in_slot(&self, slot: &Mutex<LocalSlot>, view: &SegmentView) -> Result<()> {
        let fingerprint = view.fingerprint();
        let mut local = locked(slot);
        if self.closed.load(Ordering::Acquire) {
            // Shutdown already gave back everything.
            return Ok(());
        }
        if local.refs == 0 {
            return Err(Error::InvalidSegment(format!(
                "no outstanding reference on {fingerprint}"
            )));
        }

        let mut attempt = 0;
        loop {
            match self.drop_refs(view, 1) {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::debug!(%fingerprint, attempt, "retrying release: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        local.refs -= 1;
        if local.refs == 0 {
            local.view = None;
        }
        self.metrics.record_release();
        Ok(())
    }

    /// Decrement the persisted count by `refs` and apply the reclaim policy.
    fn drop_refs(&self, view: &SegmentView, refs: u32) -> Result<()> {
        let fingerprint = view.fingerprint();
        let guard = self.store.lock(fingerprint, self.config.lock_timeout)?;
        let Some(segment) = self.held_segment(&guard, view)? else {
            tracing::warn!(%fingerprint, "segment vanished while referenced, nothing to decrement");
            return Ok(());
        };

        let mut count = segment.header().ref_count();
        for _ in 0..refs {
            count = lock::decrement(&guard, &segment, self.holder)?;
        }
        if count > 0 {
            return Ok(());
        }

        match self.config.reclaim {
            ReclaimPolicy::Eager => {
                drop(segment);
                if self.store.reclaim(&guard)? {
                    observability::record_reclaim("release");
                }
            }
            ReclaimPolicy::KeepWarm(grace) => {
                let now = store::now_ms();
                let until = now.saturating_add(u64::try_from(grace.as_millis()).unwrap_or(u64::MAX));
                segment.header().mark_kept_warm(now, until);
                segment.sync_header()?;
                tracing::debug!(%fingerprint, ?grace, "keeping idle segment warm");
            }
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let slots: Vec<_> = locked(&self.slots).drain().collect();
        let mut released = 0u64;
        let mut first_error = None;
        for (fingerprint, slot) in slots {
            let mut local = locked(&slot);
            let refs = std::mem::take(&mut local.refs);
            let Some(view) = local.view.take() else {
                continue;
            };
            if refs == 0 {
                continue;
            }
            match self.drop_refs(&view, refs) {
                Ok(()) => released += u64::from(refs),
                Err(e) => {
                    tracing::warn!(%fingerprint, refs, "failed to release on shutdown: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(model = %self.config.model_id, released, "agent shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn check_size(segment: &SegmentFile, desc: &TensorDescriptor) -> Result<()> {
    if segment.payload_len() != desc.byte_size() {
        return Err(Error::InvalidSegment(format!(
            "segment {} holds {} bytes but the descriptor declares {}",
            segment.fingerprint(),
            segment.payload_len(),
            desc.byte_size()
        )));
    }
    Ok(())
}
