//! Adapter ordering: which adapters exist, and which model modules they
//! attach to.
//!
//! The ordering file is an external JSON contract (shipped alongside X-LoRA
//! adapter sets); this module consumes and validates it, it does not define
//! it. Keys of `layers` are module paths such as
//! `base_model.model.model.layers.0.self_attn.q_proj`; values index into
//! `order`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrderingError {
    #[error("failed to read ordering file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse ordering file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ordering declares no adapters")]
    Empty,
    #[error("adapter `{0}` listed more than once")]
    DuplicateAdapter(String),
    #[error("module `{module}` references adapter slot {slot}, but only {adapters} adapters are declared")]
    SlotOutOfRange {
        module: String,
        slot: usize,
        adapters: usize,
    },
    #[error("module `{module}` names layer {depth}, but the model has {num_layers} layers")]
    LayerOutOfRange {
        module: String,
        depth: usize,
        num_layers: usize,
    },
    #[error("module `{0}` carries no recognizable layer depth")]
    NoLayerDepth(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterOrdering {
    /// Adapter names in canonical blend order.
    pub order: Vec<String>,
    /// Module path -> adapter slot.
    pub layers: BTreeMap<String, usize>,
    /// Base model the ordering was produced for, when the file records it.
    #[serde(default)]
    pub base_model_id: Option<String>,
}

impl AdapterOrdering {
    pub fn from_path(path: &Path) -> Result<Self, OrderingError> {
        let raw = std::fs::read_to_string(path).map_err(|source| OrderingError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Structural validation against the loaded model's layer count. Runs at
    /// handle load, before any request is accepted.
    pub fn validate(&self, num_layers: usize) -> Result<(), OrderingError> {
        if self.order.is_empty() {
            return Err(OrderingError::Empty);
        }
        let mut seen = BTreeSet::new();
        for name in &self.order {
            if !seen.insert(name.as_str()) {
                return Err(OrderingError::DuplicateAdapter(name.clone()));
            }
        }
        for (module, &slot) in &self.layers {
            if slot >= self.order.len() {
                return Err(OrderingError::SlotOutOfRange {
                    module: module.clone(),
                    slot,
                    adapters: self.order.len(),
                });
            }
            let depth = layer_depth(module)
                .ok_or_else(|| OrderingError::NoLayerDepth(module.clone()))?;
            if depth >= num_layers {
                return Err(OrderingError::LayerOutOfRange {
                    module: module.clone(),
                    depth,
                    num_layers,
                });
            }
        }
        Ok(())
    }

    /// Layer depths where adapters apply. With no cutoff every declared depth
    /// is active; with `Some(c)` depths at or beyond `c` fall back to
    /// base-only behavior. Pure function of the ordering and the cutoff.
    pub fn active_layers(&self, cutoff: Option<usize>) -> BTreeSet<usize> {
        self.layers
            .keys()
            .filter_map(|module| layer_depth(module))
            .filter(|&depth| cutoff.map_or(true, |c| depth < c))
            .collect()
    }

    /// Module kinds (`q_proj`, `v_proj`, ...) declared for a given depth.
    pub fn modules_at(&self, depth: usize) -> BTreeSet<&str> {
        self.layers
            .keys()
            .filter(|module| layer_depth(module) == Some(depth))
            .filter_map(|module| module.rsplit('.').next())
            .collect()
    }

    pub fn num_adapters(&self) -> usize {
        self.order.len()
    }
}

/// Parse the layer depth from a module path: the integer segment following a
/// `layers` segment, e.g. `...model.layers.12.self_attn.q_proj` -> 12.
pub fn layer_depth(module: &str) -> Option<usize> {
    let mut segments = module.split('.');
    while let Some(segment) = segments.next() {
        if segment == "layers" {
            return segments.next()?.parse().ok();
        }
    }
    None
}
