//! Scheduler-side view of node inventories.
//!
//! A [`ModelManifest`] lists the tensors a model needs. A [`PlacementIndex`]
//! holds the latest [`InventoryReport`] of every node and ranks candidate
//! nodes by how much of a manifest they already hold, so placement can
//! prefer hosts where the model's weights are warm.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut index = PlacementIndex::new();
//! index.ingest(&report_from_node_a);
//! index.ingest(&report_from_node_b);
//!
//! let manifest = ModelManifest::load("/models/bert.manifest.json")?;
//! let ranked = index.rank(&manifest, ["node-a", "node-b", "node-c"]);
//! let (best, affinity) = &ranked[0];
//! ```

use crate::collector::InventoryReport;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

/// One tensor a model needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Variable name within the model.
    pub variable_name: String,
    /// Fingerprint of the tensor.
    pub fingerprint: Fingerprint,
    /// Payload size in bytes.
    pub byte_size: u64,
}

/// The tensors a model needs, keyed by variable name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelManifest {
    /// Model or function identifier.
    pub model_id: String,
    /// Tensors, ordered by variable name.
    pub tensors: Vec<ManifestEntry>,
}

impl ModelManifest {
    /// Empty manifest for `model_id`.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            tensors: Vec::new(),
        }
    }

    /// Add or replace the entry for `variable_name`.
    pub fn record(&mut self, variable_name: &str, fingerprint: Fingerprint, byte_size: u64) {
        let entry = ManifestEntry {
            variable_name: variable_name.to_string(),
            fingerprint,
            byte_size,
        };
        match self
            .tensors
            .binary_search_by(|e| e.variable_name.as_str().cmp(variable_name))
        {
            Ok(i) => self.tensors[i] = entry,
            Err(i) => self.tensors.insert(i, entry),
        }
    }

    /// Distinct fingerprints with their sizes.
    ///
    /// Tied weights (several variables sharing one fingerprint) count once.
    pub fn required(&self) -> BTreeMap<Fingerprint, u64> {
        self.tensors
            .iter()
            .map(|e| (e.fingerprint, e.byte_size))
            .collect()
    }

    /// Total bytes of the distinct tensors.
    pub fn required_bytes(&self) -> u64 {
        self.required().values().sum()
    }

    /// Read a manifest from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| Error::Config(format!("invalid manifest {}: {e}", path.display())))
    }

    /// Atomically write the manifest as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)
            .map_err(|e| Error::Config(format!("failed to encode manifest: {e}")))?;
        tmp.write_all(b"\n")?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// How much of a manifest a node already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Affinity {
    /// Distinct required tensors resident on the node.
    pub matched: usize,
    /// Distinct tensors the manifest requires.
    pub required: usize,
    /// Bytes of the resident required tensors.
    pub matched_bytes: u64,
    /// Bytes of all required tensors.
    pub required_bytes: u64,
}

impl Affinity {
    /// Whether the node holds any required tensor.
    pub fn is_warm(&self) -> bool {
        self.matched > 0
    }

    /// Share of required bytes already resident, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.required_bytes == 0 {
            return 0.0;
        }
        self.matched_bytes as f64 / self.required_bytes as f64
    }
}

#[derive(Debug, Clone)]
struct NodeInventory {
    generated_at_ms: u64,
    segments: HashMap<Fingerprint, u64>,
}

/// Latest inventory of every reporting node.
#[derive(Debug, Clone, Default)]
pub struct PlacementIndex {
    nodes: HashMap<String, NodeInventory>,
}

impl PlacementIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node's inventory with `report`.
    ///
    /// A report older than the one already held is ignored; returns whether
    /// the report was applied.
    pub fn ingest(&mut self, report: &InventoryReport) -> bool {
        if let Some(current) = self.nodes.get(&report.node_id) {
            if current.generated_at_ms > report.generated_at_ms {
                tracing::debug!(node = %report.node_id, "ignoring out-of-order inventory report");
                return false;
            }
        }
        let segments = report
            .records
            .iter()
            .map(|r| (r.fingerprint, r.byte_size))
            .collect();
        self.nodes.insert(
            report.node_id.clone(),
            NodeInventory {
                generated_at_ms: report.generated_at_ms,
                segments,
            },
        );
        true
    }

    /// Drop nodes whose latest report is older than `cutoff_ms`.
    ///
    /// Returns how many nodes were removed.
    pub fn prune_older_than(&mut self, cutoff_ms: u64) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, inv| inv.generated_at_ms >= cutoff_ms);
        before - self.nodes.len()
    }

    /// Nodes with an inventory, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Affinity of `node` for `manifest` (zero for unknown nodes).
    pub fn affinity(&self, node: &str, manifest: &ModelManifest) -> Affinity {
        let required = manifest.required();
        let mut affinity = Affinity {
            required: required.len(),
            required_bytes: required.values().sum(),
            ..Default::default()
        };
        let Some(inventory) = self.nodes.get(node) else {
            return affinity;
        };
        for (fingerprint, size) in &required {
            if inventory.segments.contains_key(fingerprint) {
                affinity.matched += 1;
                affinity.matched_bytes += size;
            }
        }
        affinity
    }

    /// Order `candidates` best first: most resident bytes, then most
    /// resident tensors, then node id.
    pub fn rank<I, S>(&self, manifest: &ModelManifest, candidates: I) -> Vec<(String, Affinity)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranked: Vec<_> = candidates
            .into_iter()
            .map(|node| {
                let node = node.as_ref();
                (node.to_string(), self.affinity(node, manifest))
            })
            .collect();
        ranked.sort_by(|(a_node, a), (b_node, b)| {
            b.matched_bytes
                .cmp(&a.matched_bytes)
                .then(b.matched.cmp(&a.matched))
                .then_with(|| a_node.cmp(b_node))
        });
        ranked
    }
}
