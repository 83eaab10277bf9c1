//! Adapter weight groups: PEFT-format loading, shape validation, and the
//! low-rank delta primitive the model applies at adapter-wrapped projections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::ordering::{layer_depth, AdapterOrdering};

#[derive(Debug, Error)]
pub enum AdapterLoadError {
    #[error("adapter config not found at {0}")]
    ConfigNotFound(PathBuf),
    #[error("failed to parse adapter config: {0}")]
    ConfigParse(String),
    #[error("adapter weights not found at {0}")]
    WeightsNotFound(PathBuf),
    #[error("failed to load adapter weights: {0}")]
    WeightsLoad(String),
    #[error("mismatched low-rank shapes for {module}: a={a_shape:?}, b={b_shape:?}")]
    ShapeMismatch {
        module: String,
        a_shape: Vec<usize>,
        b_shape: Vec<usize>,
    },
    #[error("adapter `{adapter}` is missing lora_A or lora_B for module {module}")]
    IncompleteAdapter { adapter: String, module: String },
    #[error("adapter `{adapter}` provides no weights for ordered module {module}")]
    MissingModule { adapter: String, module: String },
}

/// Configuration from `adapter_config.json` (PEFT format).
#[derive(Debug, Clone, Deserialize)]
pub struct PeftConfig {
    pub r: usize,
    pub lora_alpha: f32,
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub lora_dropout: f32,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl PeftConfig {
    /// `alpha / r`, or `alpha / sqrt(r)` for rank-stabilized adapters.
    pub fn scaling(&self) -> f32 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }
}

/// One low-rank weight pair. The delta contribution of this adapter for an
/// input `x` is `(x · aᵀ · bᵀ) * scale * blend_weight`.
#[derive(Debug, Clone)]
pub struct LowRankAdapter {
    a: Tensor,
    b: Tensor,
    rank: usize,
    scale: f64,
}

impl LowRankAdapter {
    pub fn new(
        module: &str,
        a: Tensor,
        b: Tensor,
        scale: f64,
    ) -> Result<Self, AdapterLoadError> {
        let a_dims = a.dims().to_vec();
        let b_dims = b.dims().to_vec();
        // PEFT convention: lora_A [rank, in], lora_B [out, rank].
        if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[0] != b_dims[1] {
            return Err(AdapterLoadError::ShapeMismatch {
                module: module.to_string(),
                a_shape: a_dims,
                b_shape: b_dims,
            });
        }
        let rank = a_dims[0];
        Ok(Self { a, b, rank, scale })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn in_features(&self) -> usize {
        self.a.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.b.dims()[0]
    }

    /// Low-rank delta for a flattened input `x` of shape `[n, in_features]`.
    pub fn delta(&self, x: &Tensor, blend_weight: f64) -> CandleResult<Tensor> {
        let down = x.matmul(&self.a.t()?)?;
        let up = down.matmul(&self.b.t()?)?;
        up * (self.scale * blend_weight)
    }
}

/// All adapters of an X-LoRA set, grouped by `(layer depth, module kind)` in
/// the ordering's canonical adapter order. Read-only after load; shared by
/// every session against the same handle.
#[derive(Debug)]
pub struct XLoraStack {
    adapter_names: Vec<String>,
    groups: HashMap<(usize, String), Vec<LowRankAdapter>>,
}

impl XLoraStack {
    /// Load one adapter group per name in `ordering.order` from
    /// `root/<name>/` (PEFT directory layout: `adapter_config.json` +
    /// `adapter_model.safetensors`).
    pub fn load(
        root: &Path,
        ordering: &AdapterOrdering,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AdapterLoadError> {
        let mut slot_groups: HashMap<(usize, String), Vec<(usize, LowRankAdapter)>> =
            HashMap::new();

        for (slot, name) in ordering.order.iter().enumerate() {
            let adapter_dir = root.join(name);
            let config = load_config(&adapter_dir)?;
            let tensors = load_safetensors(&adapter_dir, device, dtype)?;
            let modules = group_by_module(tensors);

            let scale = config.scaling() as f64;
            let mut loaded = 0usize;
            for (module, pair) in modules {
                let (Some(a), Some(b)) = (pair.a, pair.b) else {
                    return Err(AdapterLoadError::IncompleteAdapter {
                        adapter: name.clone(),
                        module,
                    });
                };
                let Some(depth) = layer_depth(&module) else {
                    // Adapters outside the decoder stack (embeddings, head)
                    // are not part of the per-layer blend.
                    continue;
                };
                let Some(kind) = module.rsplit('.').next().map(str::to_string) else {
                    continue;
                };
                let adapter = LowRankAdapter::new(&module, a, b, scale)?;
                slot_groups
                    .entry((depth, kind))
                    .or_default()
                    .push((slot, adapter));
                loaded += 1;
            }
            debug!(adapter = %name, modules = loaded, rank = config.r, "loaded adapter group");

            // Every module the ordering declares must exist in this adapter.
            for (module, _) in ordering.layers.iter() {
                let Some(depth) = layer_depth(module) else {
                    continue;
                };
                let kind = module.rsplit('.').next().unwrap_or_default();
                let present = slot_groups
                    .get(&(depth, kind.to_string()))
                    .is_some_and(|group| group.iter().any(|(s, _)| *s == slot));
                if !present {
                    return Err(AdapterLoadError::MissingModule {
                        adapter: name.clone(),
                        module: module.clone(),
                    });
                }
            }
        }

        let groups = slot_groups
            .into_iter()
            .map(|(key, mut group)| {
                group.sort_by_key(|(slot, _)| *slot);
                (key, group.into_iter().map(|(_, adapter)| adapter).collect())
            })
            .collect();

        Ok(Self {
            adapter_names: ordering.order.clone(),
            groups,
        })
    }

    /// Adapters applying at `(depth, kind)`, in canonical order. Empty when
    /// the module carries no adapters.
    pub fn adapters_for(&self, depth: usize, kind: &str) -> &[LowRankAdapter] {
        self.groups
            .get(&(depth, kind.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn num_adapters(&self) -> usize {
        self.adapter_names.len()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn adapter_names(&self) -> &[String] {
        &self.adapter_names
    }

    /// Uniform blend weight: every adapter contributes equally. Dynamic,
    /// token-conditioned scalings belong to the classifier stage, which is
    /// not part of this runtime.
    pub fn blend_weight(&self) -> f64 {
        1.0 / self.adapter_names.len().max(1) as f64
    }
}

fn load_config(dir: &Path) -> Result<PeftConfig, AdapterLoadError> {
    let path = dir.join("adapter_config.json");
    if !path.exists() {
        return Err(AdapterLoadError::ConfigNotFound(path));
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| AdapterLoadError::ConfigParse(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| AdapterLoadError::ConfigParse(e.to_string()))
}

fn load_safetensors(
    dir: &Path,
    device: &Device,
    dtype: DType,
) -> Result<HashMap<String, Tensor>, AdapterLoadError> {
    let path = dir.join("adapter_model.safetensors");
    if !path.exists() {
        return Err(AdapterLoadError::WeightsNotFound(path));
    }
    let tensors = candle_core::safetensors::load(&path, device)
        .map_err(|e| AdapterLoadError::WeightsLoad(e.to_string()))?;
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let tensor = if tensor.dtype() != dtype {
                tensor
                    .to_dtype(dtype)
                    .map_err(|e| AdapterLoadError::WeightsLoad(e.to_string()))?
            } else {
                tensor
            };
            Ok((name, tensor))
        })
        .collect()
}

#[derive(Default)]
struct LowRankPair {
    a: Option<Tensor>,
    b: Option<Tensor>,
}

/// Group raw safetensors entries by module path.
///
/// PEFT weight names look like
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`.
fn group_by_module(tensors: HashMap<String, Tensor>) -> HashMap<String, LowRankPair> {
    let mut grouped: HashMap<String, LowRankPair> = HashMap::new();
    for (full_name, tensor) in tensors {
        let Some((module, is_a)) = parse_weight_name(&full_name) else {
            continue;
        };
        let pair = grouped.entry(module).or_default();
        if is_a {
            pair.a = Some(tensor);
        } else {
            pair.b = Some(tensor);
        }
    }
    grouped
}

/// Extract `(module path, is lora_A)` from a PEFT weight name.
fn parse_weight_name(name: &str) -> Option<(String, bool)> {
    let name = name
        .strip_prefix("base_model.model.")
        .or_else(|| name.strip_prefix("base_model."))
        .or_else(|| name.strip_prefix("model."))
        .unwrap_or(name);
    let name = name.strip_suffix(".weight").unwrap_or(name);

    for (marker, is_a) in [(".lora_A", true), (".lora_B", false), (".lora_a", true), (".lora_b", false)] {
        if let Some(pos) = name.rfind(marker) {
            return Some((name[..pos].to_string(), is_a));
        }
    }
    None
}
