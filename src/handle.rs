//! Model handle: one-time assembly of weights, tokenizer, and adapters.
//!
//! Loading is the only phase that touches disk or network. The resulting
//! handle is immutable and shareable; per-request state lives in sessions.
//! Weight memory is released when the handle drops.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterLoadError, AdapterOrdering, OrderingError, XLoraStack};
use crate::gguf::{GgufError, GgufModelFile};
use crate::model::{CausalModel, ModelBuildError, QuantizedMistral};
use crate::request::{ChatRequest, ChatResponse};
use crate::session::{Session, SessionError};
use crate::spec::{ModelSpec, QuantTag, SpecError};
use crate::tokenizer::{ChatTemplateEngine, TokenizerWrapper};

/// Fallback EOS id (llama convention) when the weights file does not declare
/// one.
const DEFAULT_EOS_TOKEN_ID: u32 = 2;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("quantized weights `{filename}` not found in `{model_id}`: {detail}")]
    MissingWeights {
        model_id: String,
        filename: String,
        detail: String,
    },
    #[error("weights carry {found} tensors but the filename declares {expected}")]
    QuantTagMismatch { expected: QuantTag, found: String },
    #[error("tokenizer could not be resolved: {0}")]
    TokenizerUnresolved(String),
    #[error("adapter ordering mismatch: {0}")]
    OrderingMismatch(String),
    #[error(transparent)]
    Gguf(#[from] GgufError),
    #[error(transparent)]
    Adapter(#[from] AdapterLoadError),
    #[error(transparent)]
    ModelBuild(#[from] ModelBuildError),
}

impl From<OrderingError> for LoadError {
    fn from(err: OrderingError) -> Self {
        LoadError::OrderingMismatch(err.to_string())
    }
}

/// A loaded model: weights, tokenizer, chat template, and adapter selection.
pub struct ModelHandle {
    model: Arc<dyn CausalModel>,
    tokenizer: TokenizerWrapper,
    template: ChatTemplateEngine,
    model_key: String,
    eos_token_id: u32,
    repeat_last_n: usize,
    active_adapter_layers: BTreeSet<usize>,
}

impl ModelHandle {
    pub fn load(spec: &ModelSpec, device: &Device) -> Result<Self, LoadError> {
        spec.validate()?;
        let quant_tag = spec.quant_tag()?;

        let weights_path = resolve_weights(spec.quantized_model_id(), spec.quantized_filename())?;
        let mut file = GgufModelFile::open(&weights_path)?;
        file.require_llama_family()?;

        if let Some(found) = file.dominant_quant_dtype() {
            if !quant_tag.matches_dtype(found) {
                return Err(LoadError::QuantTagMismatch {
                    expected: quant_tag,
                    found: format!("{found:?}"),
                });
            }
        }

        let num_layers = file.block_count()?;

        let adapters = match spec.adapter_source() {
            Some((xlora_id, order_path, cutoff)) => {
                let ordering_path = resolve_ordering_path(xlora_id, order_path)?;
                let ordering = AdapterOrdering::from_path(&ordering_path)?;
                ordering.validate(num_layers)?;
                if let Some(c) = cutoff {
                    if c > num_layers {
                        return Err(LoadError::OrderingMismatch(format!(
                            "non-granular cutoff {c} exceeds the model's {num_layers} layers"
                        )));
                    }
                }
                let root = resolve_adapter_root(xlora_id, &ordering)?;
                let stack = XLoraStack::load(&root, &ordering, device, DType::F32)?;
                let active = ordering.active_layers(cutoff);
                info!(
                    adapters = stack.num_adapters(),
                    active_layers = active.len(),
                    cutoff = ?cutoff,
                    "loaded adapter stack"
                );
                Some((stack, active))
            }
            None => None,
        };

        let model = QuantizedMistral::from_gguf(
            &mut file,
            adapters.as_ref().map(|(stack, active)| (stack, active)),
            device,
        )?;

        let eos_token_id = file.eos_token_id().unwrap_or_else(|| {
            warn!("weights declare no EOS token id, assuming {DEFAULT_EOS_TOKEN_ID}");
            DEFAULT_EOS_TOKEN_ID
        });

        let tokenizer_path = match spec.tokenizer_json() {
            Some(path) => path.to_path_buf(),
            None => resolve_tokenizer(spec.tok_model_id())?,
        };
        let tokenizer = TokenizerWrapper::from_file(&tokenizer_path)
            .map_err(|e| LoadError::TokenizerUnresolved(e.to_string()))?;

        let template = resolve_template(spec.tok_model_id());

        info!(
            model_key = spec.model_key(),
            weights = %weights_path.display(),
            eos_token_id,
            "model handle ready"
        );

        Ok(Self {
            model: Arc::new(model),
            tokenizer,
            template,
            model_key: spec.model_key().to_string(),
            eos_token_id,
            repeat_last_n: spec.repeat_last_n(),
            active_adapter_layers: adapters
                .map(|(_, active)| active)
                .unwrap_or_default(),
        })
    }

    /// Assemble a handle from pre-built parts. Lets session logic be tested
    /// against scripted models without any files on disk.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(
        model: Arc<dyn CausalModel>,
        tokenizer: TokenizerWrapper,
        eos_token_id: u32,
    ) -> Self {
        Self {
            model,
            tokenizer,
            template: ChatTemplateEngine::fallback(),
            model_key: "mistral".to_string(),
            eos_token_id,
            repeat_last_n: crate::spec::DEFAULT_REPEAT_LAST_N,
            active_adapter_layers: BTreeSet::new(),
        }
    }

    /// Run one chat-completion request to completion. Each call owns a fresh
    /// session; nothing is retained between calls.
    pub fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, SessionError> {
        Session::new(self).run(request)
    }

    pub fn new_session(&self) -> Session<'_> {
        Session::new(self)
    }

    pub fn model(&self) -> &Arc<dyn CausalModel> {
        &self.model
    }

    pub fn tokenizer(&self) -> &TokenizerWrapper {
        &self.tokenizer
    }

    pub fn template(&self) -> &ChatTemplateEngine {
        &self.template
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn repeat_last_n(&self) -> usize {
        self.repeat_last_n
    }

    pub fn active_adapter_layers(&self) -> &BTreeSet<usize> {
        &self.active_adapter_layers
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_key", &self.model_key)
            .field("eos_token_id", &self.eos_token_id)
            .field("repeat_last_n", &self.repeat_last_n)
            .field("active_adapter_layers", &self.active_adapter_layers)
            .finish()
    }
}

/// Resolve a file from a model id: a local directory is used as-is, anything
/// else goes through the hub cache.
fn hub_file(model_id: &str, filename: &str) -> Result<PathBuf, String> {
    if Path::new(model_id).is_dir() {
        let local = Path::new(model_id).join(filename);
        return if local.exists() {
            Ok(local)
        } else {
            Err(format!("{} does not exist", local.display()))
        };
    }
    let api = Api::new().map_err(|e| e.to_string())?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
    repo.get(filename).map_err(|e| e.to_string())
}

fn resolve_weights(model_id: &str, filename: &str) -> Result<PathBuf, LoadError> {
    hub_file(model_id, filename).map_err(|detail| LoadError::MissingWeights {
        model_id: model_id.to_string(),
        filename: filename.to_string(),
        detail,
    })
}

fn resolve_tokenizer(tok_model_id: &str) -> Result<PathBuf, LoadError> {
    hub_file(tok_model_id, "tokenizer.json").map_err(LoadError::TokenizerUnresolved)
}

/// An ordering path is used verbatim when it exists locally, otherwise it is
/// fetched from the adapter repository.
fn resolve_ordering_path(xlora_id: &str, order: &Path) -> Result<PathBuf, LoadError> {
    if order.exists() {
        return Ok(order.to_path_buf());
    }
    let name = order.to_string_lossy();
    hub_file(xlora_id, &name).map_err(|detail| {
        LoadError::OrderingMismatch(format!("ordering file `{name}` unavailable: {detail}"))
    })
}

/// Root directory holding one subdirectory per adapter group.
fn resolve_adapter_root(
    xlora_id: &str,
    ordering: &AdapterOrdering,
) -> Result<PathBuf, LoadError> {
    if Path::new(xlora_id).is_dir() {
        return Ok(PathBuf::from(xlora_id));
    }
    // Hub layout: fetch both files of every adapter into the shared snapshot,
    // then hand back the snapshot root.
    let mut root = None;
    for name in &ordering.order {
        let config = hub_file(xlora_id, &format!("{name}/adapter_config.json")).map_err(|e| {
            AdapterLoadError::ConfigNotFound(PathBuf::from(format!("{xlora_id}/{name}: {e}")))
        })?;
        hub_file(xlora_id, &format!("{name}/adapter_model.safetensors")).map_err(|e| {
            AdapterLoadError::WeightsNotFound(PathBuf::from(format!("{xlora_id}/{name}: {e}")))
        })?;
        if root.is_none() {
            root = config
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf);
        }
    }
    root.ok_or_else(|| LoadError::OrderingMismatch("ordering declares no adapters".to_string()))
}

fn resolve_template(tok_model_id: &str) -> ChatTemplateEngine {
    match hub_file(tok_model_id, "tokenizer_config.json")
        .ok()
        .and_then(|path| ChatTemplateEngine::from_tokenizer_config(&path).ok())
    {
        Some(engine) => engine,
        None => {
            debug!("no usable chat template in tokenizer config, using built-in layout");
            ChatTemplateEngine::fallback()
        }
    }
}
