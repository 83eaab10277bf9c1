//! Model source specification.
//!
//! A [`ModelSpec`] names everything needed to assemble one model handle:
//! tokenizer source, quantized weights, and (for adapter variants) the
//! adapter repository plus its layer ordering. Each variant carries only its
//! own required fields and is validated exhaustively before any loading
//! starts; optional fields are real `Option`s with documented defaults, not
//! sentinel values.

use std::path::{Path, PathBuf};

use candle_core::quantized::GgmlDType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default repetition window when a spec does not override it.
pub const DEFAULT_REPEAT_LAST_N: usize = 64;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("quantized filename `{0}` does not end in .gguf")]
    NotGguf(String),
    #[error("quantized filename `{0}` carries no recognizable quant tag")]
    UnknownQuantTag(String),
    #[error("repeat_last_n must be positive")]
    EmptyRepeatWindow,
}

/// Quantization format tag carried in a GGUF filename (e.g. the `Q4_0` in
/// `zephyr-7b-beta.Q4_0.gguf`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum QuantTag {
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    F16,
    F32,
}

impl QuantTag {
    /// Recognize a quant tag inside a filename. Matching is case-insensitive;
    /// K-quant tags are checked before the legacy tags they textually contain.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let upper = filename.to_ascii_uppercase();
        const TAGS: &[(&str, QuantTag)] = &[
            ("Q2_K", QuantTag::Q2K),
            ("Q3_K", QuantTag::Q3K),
            ("Q4_K", QuantTag::Q4K),
            ("Q5_K", QuantTag::Q5K),
            ("Q6_K", QuantTag::Q6K),
            ("Q4_0", QuantTag::Q4_0),
            ("Q4_1", QuantTag::Q4_1),
            ("Q5_0", QuantTag::Q5_0),
            ("Q5_1", QuantTag::Q5_1),
            ("Q8_0", QuantTag::Q8_0),
            ("F16", QuantTag::F16),
            ("FP16", QuantTag::F16),
            ("F32", QuantTag::F32),
        ];
        TAGS.iter()
            .find(|(text, _)| upper.contains(text))
            .map(|&(_, tag)| tag)
    }

    /// Whether the tensor dtype found in the file matches this tag.
    pub fn matches_dtype(self, dtype: GgmlDType) -> bool {
        matches!(
            (self, dtype),
            (QuantTag::Q4_0, GgmlDType::Q4_0)
                | (QuantTag::Q4_1, GgmlDType::Q4_1)
                | (QuantTag::Q5_0, GgmlDType::Q5_0)
                | (QuantTag::Q5_1, GgmlDType::Q5_1)
                | (QuantTag::Q8_0, GgmlDType::Q8_0)
                | (QuantTag::Q2K, GgmlDType::Q2K)
                | (QuantTag::Q3K, GgmlDType::Q3K)
                | (QuantTag::Q4K, GgmlDType::Q4K)
                | (QuantTag::Q5K, GgmlDType::Q5K)
                | (QuantTag::Q6K, GgmlDType::Q6K)
                | (QuantTag::F16, GgmlDType::F16)
                | (QuantTag::F32, GgmlDType::F32)
        )
    }
}

impl std::fmt::Display for QuantTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuantTag::Q4_0 => "Q4_0",
            QuantTag::Q4_1 => "Q4_1",
            QuantTag::Q5_0 => "Q5_0",
            QuantTag::Q5_1 => "Q5_1",
            QuantTag::Q8_0 => "Q8_0",
            QuantTag::Q2K => "Q2_K",
            QuantTag::Q3K => "Q3_K",
            QuantTag::Q4K => "Q4_K",
            QuantTag::Q5K => "Q5_K",
            QuantTag::Q6K => "Q6_K",
            QuantTag::F16 => "F16",
            QuantTag::F32 => "F32",
        };
        f.write_str(s)
    }
}

/// Closed set of model sources this runtime can assemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Quantized Mistral-family GGUF weights, base model only.
    MistralGguf {
        /// Model id (or local directory) the tokenizer is derived from.
        tok_model_id: String,
        /// Model id (or local directory) holding the quantized weights.
        quantized_model_id: String,
        /// GGUF filename inside `quantized_model_id`.
        quantized_filename: String,
        /// Explicit tokenizer.json path. `None` derives it from `tok_model_id`.
        #[serde(default)]
        tokenizer_json: Option<PathBuf>,
        /// Repetition window consulted by the presence penalty.
        #[serde(default = "default_repeat_last_n")]
        repeat_last_n: usize,
    },
    /// Quantized Mistral-family GGUF weights with an X-LoRA adapter set.
    XLoraMistralGguf {
        tok_model_id: String,
        quantized_model_id: String,
        quantized_filename: String,
        #[serde(default)]
        tokenizer_json: Option<PathBuf>,
        #[serde(default = "default_repeat_last_n")]
        repeat_last_n: usize,
        /// Model id (or local directory) holding the adapter weight groups.
        xlora_model_id: String,
        /// Path to the adapter ordering file.
        order: PathBuf,
        /// Layer depth at which adapter blending stops. `None` keeps every
        /// ordered layer active ("fully granular").
        #[serde(default)]
        tgt_non_granular_index: Option<usize>,
    },
}

fn default_repeat_last_n() -> usize {
    DEFAULT_REPEAT_LAST_N
}

impl ModelSpec {
    /// Check everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<(), SpecError> {
        let filename = self.quantized_filename();
        if !filename.to_ascii_lowercase().ends_with(".gguf") {
            return Err(SpecError::NotGguf(filename.to_string()));
        }
        if QuantTag::from_filename(filename).is_none() {
            return Err(SpecError::UnknownQuantTag(filename.to_string()));
        }
        if self.repeat_last_n() == 0 {
            return Err(SpecError::EmptyRepeatWindow);
        }
        Ok(())
    }

    /// Quant tag declared by the weights filename. `validate` guarantees this
    /// succeeds afterwards.
    pub fn quant_tag(&self) -> Result<QuantTag, SpecError> {
        QuantTag::from_filename(self.quantized_filename())
            .ok_or_else(|| SpecError::UnknownQuantTag(self.quantized_filename().to_string()))
    }

    /// Routing key requests must name to be served by a handle built from
    /// this spec.
    pub fn model_key(&self) -> &'static str {
        match self {
            ModelSpec::MistralGguf { .. } | ModelSpec::XLoraMistralGguf { .. } => "mistral",
        }
    }

    pub fn tok_model_id(&self) -> &str {
        match self {
            ModelSpec::MistralGguf { tok_model_id, .. }
            | ModelSpec::XLoraMistralGguf { tok_model_id, .. } => tok_model_id,
        }
    }

    pub fn quantized_model_id(&self) -> &str {
        match self {
            ModelSpec::MistralGguf {
                quantized_model_id, ..
            }
            | ModelSpec::XLoraMistralGguf {
                quantized_model_id, ..
            } => quantized_model_id,
        }
    }

    pub fn quantized_filename(&self) -> &str {
        match self {
            ModelSpec::MistralGguf {
                quantized_filename, ..
            }
            | ModelSpec::XLoraMistralGguf {
                quantized_filename, ..
            } => quantized_filename,
        }
    }

    pub fn tokenizer_json(&self) -> Option<&Path> {
        match self {
            ModelSpec::MistralGguf { tokenizer_json, .. }
            | ModelSpec::XLoraMistralGguf { tokenizer_json, .. } => tokenizer_json.as_deref(),
        }
    }

    pub fn repeat_last_n(&self) -> usize {
        match self {
            ModelSpec::MistralGguf { repeat_last_n, .. }
            | ModelSpec::XLoraMistralGguf { repeat_last_n, .. } => *repeat_last_n,
        }
    }

    /// Adapter configuration for X-LoRA variants: `(xlora_model_id, ordering
    /// path, non-granular cutoff)`.
    pub fn adapter_source(&self) -> Option<(&str, &Path, Option<usize>)> {
        match self {
            ModelSpec::MistralGguf { .. } => None,
            ModelSpec::XLoraMistralGguf {
                xlora_model_id,
                order,
                tgt_non_granular_index,
                ..
            } => Some((xlora_model_id, order, *tgt_non_granular_index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec(filename: &str) -> ModelSpec {
        ModelSpec::MistralGguf {
            tok_model_id: "HuggingFaceH4/zephyr-7b-beta".to_string(),
            quantized_model_id: "TheBloke/zephyr-7B-beta-GGUF".to_string(),
            quantized_filename: filename.to_string(),
            tokenizer_json: None,
            repeat_last_n: 64,
        }
    }

    #[test]
    fn valid_spec_passes() {
        let spec = base_spec("zephyr-7b-beta.Q4_0.gguf");
        assert!(spec.validate().is_ok());
        assert_eq!(spec.quant_tag().unwrap(), QuantTag::Q4_0);
        assert_eq!(spec.model_key(), "mistral");
    }

    #[test]
    fn non_gguf_filename_rejected() {
        let spec = base_spec("zephyr-7b-beta.Q4_0.safetensors");
        assert!(matches!(spec.validate(), Err(SpecError::NotGguf(_))));
    }

    #[test]
    fn untagged_filename_rejected() {
        let spec = base_spec("zephyr-7b-beta.gguf");
        assert!(matches!(
            spec.validate(),
            Err(SpecError::UnknownQuantTag(_))
        ));
    }

    #[test]
    fn zero_repeat_window_rejected() {
        let spec = ModelSpec::MistralGguf {
            tok_model_id: "m".to_string(),
            quantized_model_id: "m".to_string(),
            quantized_filename: "m.Q4_0.gguf".to_string(),
            tokenizer_json: None,
            repeat_last_n: 0,
        };
        assert!(matches!(
            spec.validate(),
            Err(SpecError::EmptyRepeatWindow)
        ));
    }

    #[test]
    fn k_quant_tag_wins_over_contained_legacy_tag() {
        assert_eq!(
            QuantTag::from_filename("model.Q4_K_M.gguf"),
            Some(QuantTag::Q4K)
        );
        assert_eq!(
            QuantTag::from_filename("model.q5_k_s.gguf"),
            Some(QuantTag::Q5K)
        );
    }

    #[test]
    fn quant_tag_matches_ggml_dtype() {
        assert!(QuantTag::Q4_0.matches_dtype(GgmlDType::Q4_0));
        assert!(!QuantTag::Q4_0.matches_dtype(GgmlDType::Q8_0));
        assert!(QuantTag::F32.matches_dtype(GgmlDType::F32));
    }

    #[test]
    fn adapter_source_only_on_xlora_variant() {
        let base = base_spec("m.Q4_0.gguf");
        assert!(base.adapter_source().is_none());

        let xlora = ModelSpec::XLoraMistralGguf {
            tok_model_id: "HuggingFaceH4/zephyr-7b-beta".to_string(),
            quantized_model_id: "TheBloke/zephyr-7B-beta-GGUF".to_string(),
            quantized_filename: "zephyr-7b-beta.Q4_0.gguf".to_string(),
            tokenizer_json: None,
            repeat_last_n: 64,
            xlora_model_id: "lamm-mit/x-lora".to_string(),
            order: PathBuf::from("orderings/xlora-paper-ordering.json"),
            tgt_non_granular_index: None,
        };
        let (id, order, cutoff) = xlora.adapter_source().unwrap();
        assert_eq!(id, "lamm-mit/x-lora");
        assert_eq!(order, Path::new("orderings/xlora-paper-ordering.json"));
        assert!(cutoff.is_none());
    }

    #[test]
    fn spec_deserializes_from_tagged_json() {
        let json = r#"{
            "kind": "x_lora_mistral_gguf",
            "tok_model_id": "HuggingFaceH4/zephyr-7b-beta",
            "quantized_model_id": "TheBloke/zephyr-7B-beta-GGUF",
            "quantized_filename": "zephyr-7b-beta.Q4_0.gguf",
            "xlora_model_id": "lamm-mit/x-lora",
            "order": "orderings/xlora-paper-ordering.json"
        }"#;
        let spec: ModelSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.repeat_last_n(), DEFAULT_REPEAT_LAST_N);
        assert!(spec.tokenizer_json().is_none());
        assert!(spec.validate().is_ok());
    }
}
