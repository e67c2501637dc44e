//! # tensorshm
//!
//! Host-wide deduplication of model weight tensors through shared memory.
//!
//! Serving processes on one host (often in different containers) load the
//! same large, immutable weights. tensorshm gives every distinct tensor a
//! content fingerprint and keeps one copy of it in a shared segment under a
//! common tmpfs directory; every process maps that copy read-only.
//!
//! ## Components
//!
//! - **[`fingerprint`]**: validated tensor descriptors and their fingerprints
//! - **[`store`]**: the segment directory (lookup, create, attach, reclaim)
//! - **[`lock`]**: per-fingerprint `flock` locks and persisted reference counts
//! - **[`agent`]**: the resolve/release API embedded in each serving process
//! - **[`collector`]**: per-node inventory reporting and crash reconciliation
//! - **[`placement`]**: the scheduler-side index ranking nodes by warm tensors
//!
//! There is no coordinating daemon. Processes find each other only through
//! the segment and lock directories.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tensorshm::prelude::*;
//!
//! let store = StoreHandle::open(StoreConfig::from_env())?;
//! let agent = Agent::new(store, AgentConfig::new("bert"));
//!
//! let desc = TensorDescriptor::builder("bert", "pooler.dense.weight")
//!     .shape([768, 768])
//!     .dtype(DType::F32)
//!     .source(SourceRef::Offset(0x4000))
//!     .build()?;
//!
//! // First process creates the segment, later ones attach to it.
//! let weights = agent.resolve_from_file(&desc, "/models/bert/model.bin", 0x4000)?;
//! run_inference(&weights[..]);
//! agent.release(weights)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod agent;
pub mod collector;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod observability;
pub mod placement;
pub mod store;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::agent::{Agent, ResolveOutcome, TensorHandle};
    pub use crate::collector::{Collector, InventoryReport, InventorySink};
    pub use crate::config::{AgentConfig, CollectorConfig, ReclaimPolicy, StoreConfig};
    pub use crate::error::{Error, Result};
    pub use crate::fingerprint::{DType, Fingerprint, SourceRef, TensorDescriptor};
    pub use crate::placement::{ModelManifest, PlacementIndex};
    pub use crate::store::StoreHandle;
}

pub use error::{Error, Result};
