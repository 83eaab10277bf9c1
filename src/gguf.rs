//! GGUF container access.
//!
//! Thin, typed veneer over `candle_core::quantized::gguf_file`: opens the
//! weights file once, exposes the metadata the loader validates against
//! (architecture, geometry, quant payload), and hands tensors to the model
//! builder. Dequantization itself stays inside candle.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::quantized::{gguf_file, GgmlDType, QTensor};
use candle_core::{Device, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse GGUF container {path}: {source}")]
    Parse {
        path: PathBuf,
        source: candle_core::Error,
    },
    #[error("metadata key `{0}` missing or of unexpected type")]
    MissingMetadata(String),
    #[error("tensor `{0}` not present in weights file")]
    MissingTensor(String),
    #[error("unsupported architecture `{0}`, expected a llama-family model")]
    UnsupportedArchitecture(String),
    #[error("tensor load failed for `{name}`: {source}")]
    TensorLoad {
        name: String,
        source: candle_core::Error,
    },
}

/// An opened GGUF weights file: parsed header plus the reader used to pull
/// tensor payloads on demand.
pub struct GgufModelFile {
    content: gguf_file::Content,
    reader: File,
    path: PathBuf,
    architecture: String,
}

impl GgufModelFile {
    pub fn open(path: &Path) -> Result<Self, GgufError> {
        let mut reader = File::open(path).map_err(|source| GgufError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let content = gguf_file::Content::read(&mut reader).map_err(|source| GgufError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let architecture = match content.metadata.get("general.architecture") {
            Some(gguf_file::Value::String(s)) => s.clone(),
            _ => return Err(GgufError::MissingMetadata("general.architecture".into())),
        };
        Ok(Self {
            content,
            reader,
            path: path.to_path_buf(),
            architecture,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// Reject files that are not llama-family (mistral/zephyr GGUF exports
    /// declare themselves as `llama`).
    pub fn require_llama_family(&self) -> Result<(), GgufError> {
        match self.architecture.as_str() {
            "llama" | "mistral" => Ok(()),
            other => Err(GgufError::UnsupportedArchitecture(other.to_string())),
        }
    }

    fn meta(&self, key: &str) -> Result<&gguf_file::Value, GgufError> {
        self.content
            .metadata
            .get(key)
            .ok_or_else(|| GgufError::MissingMetadata(key.to_string()))
    }

    fn meta_usize(&self, key: &str) -> Result<usize, GgufError> {
        match self.meta(key)? {
            gguf_file::Value::U8(v) => Ok(*v as usize),
            gguf_file::Value::U16(v) => Ok(*v as usize),
            gguf_file::Value::U32(v) => Ok(*v as usize),
            gguf_file::Value::U64(v) => Ok(*v as usize),
            gguf_file::Value::I32(v) if *v >= 0 => Ok(*v as usize),
            gguf_file::Value::I64(v) if *v >= 0 => Ok(*v as usize),
            _ => Err(GgufError::MissingMetadata(key.to_string())),
        }
    }

    fn meta_f64(&self, key: &str) -> Result<f64, GgufError> {
        match self.meta(key)? {
            gguf_file::Value::F32(v) => Ok(*v as f64),
            gguf_file::Value::F64(v) => Ok(*v),
            _ => Err(GgufError::MissingMetadata(key.to_string())),
        }
    }

    fn arch_key(&self, suffix: &str) -> String {
        format!("{}.{}", self.architecture, suffix)
    }

    pub fn block_count(&self) -> Result<usize, GgufError> {
        self.meta_usize(&self.arch_key("block_count"))
    }

    pub fn embedding_length(&self) -> Result<usize, GgufError> {
        self.meta_usize(&self.arch_key("embedding_length"))
    }

    pub fn head_count(&self) -> Result<usize, GgufError> {
        self.meta_usize(&self.arch_key("attention.head_count"))
    }

    pub fn head_count_kv(&self) -> Result<usize, GgufError> {
        self.meta_usize(&self.arch_key("attention.head_count_kv"))
            .or_else(|_| self.head_count())
    }

    pub fn context_length(&self) -> Result<usize, GgufError> {
        self.meta_usize(&self.arch_key("context_length"))
    }

    pub fn feed_forward_length(&self) -> Result<usize, GgufError> {
        self.meta_usize(&self.arch_key("feed_forward_length"))
    }

    pub fn rms_norm_eps(&self) -> Result<f64, GgufError> {
        self.meta_f64(&self.arch_key("attention.layer_norm_rms_epsilon"))
    }

    pub fn rope_freq_base(&self) -> f64 {
        self.meta_f64(&self.arch_key("rope.freq_base"))
            .unwrap_or(10_000.0)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        match self.content.metadata.get("tokenizer.ggml.eos_token_id") {
            Some(gguf_file::Value::U32(v)) => Some(*v),
            Some(gguf_file::Value::U64(v)) => Some(*v as u32),
            _ => None,
        }
    }

    /// Vocabulary size: declared metadata if present, otherwise the embedding
    /// table's row count.
    pub fn vocab_size(&self) -> Result<usize, GgufError> {
        if let Ok(v) = self.meta_usize(&self.arch_key("vocab_size")) {
            return Ok(v);
        }
        if let Some(gguf_file::Value::Array(tokens)) =
            self.content.metadata.get("tokenizer.ggml.tokens")
        {
            return Ok(tokens.len());
        }
        let info = self
            .content
            .tensor_infos
            .get("token_embd.weight")
            .ok_or_else(|| GgufError::MissingTensor("token_embd.weight".into()))?;
        Ok(info.shape.dims()[0])
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.content.tensor_infos.contains_key(name)
    }

    /// Most common dtype among the weight matrices (rank >= 2 tensors), i.e.
    /// the quantization the file actually carries. Norm vectors are excluded
    /// since they are stored unquantized regardless of the format.
    pub fn dominant_quant_dtype(&self) -> Option<GgmlDType> {
        let mut counts: HashMap<u32, (GgmlDType, usize)> = HashMap::new();
        for info in self.content.tensor_infos.values() {
            if info.shape.dims().len() < 2 {
                continue;
            }
            let entry = counts
                .entry(info.ggml_dtype as u32)
                .or_insert((info.ggml_dtype, 0));
            entry.1 += 1;
        }
        counts
            .into_values()
            .max_by_key(|&(_, count)| count)
            .map(|(dtype, _)| dtype)
    }

    /// Load a tensor in its quantized on-disk form.
    pub fn qtensor(&mut self, name: &str, device: &Device) -> Result<QTensor, GgufError> {
        if !self.content.tensor_infos.contains_key(name) {
            return Err(GgufError::MissingTensor(name.to_string()));
        }
        self.content
            .tensor(&mut self.reader, name, device)
            .map_err(|source| GgufError::TensorLoad {
                name: name.to_string(),
                source,
            })
    }

    /// Load a tensor fully dequantized (norm weights, embeddings).
    pub fn dequant_tensor(&mut self, name: &str, device: &Device) -> Result<Tensor, GgufError> {
        let qt = self.qtensor(name, device)?;
        qt.dequantize(device).map_err(|source| GgufError::TensorLoad {
            name: name.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for GgufModelFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufModelFile")
            .field("path", &self.path)
            .field("architecture", &self.architecture)
            .field("tensors", &self.content.tensor_infos.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::gguf_fixture::TinyGgufConfig;

    #[test]
    fn open_reads_metadata_and_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.F32.gguf");
        TinyGgufConfig::default().write(&path).unwrap();

        let file = GgufModelFile::open(&path).unwrap();
        assert_eq!(file.architecture(), "llama");
        assert!(file.require_llama_family().is_ok());
        assert_eq!(file.block_count().unwrap(), 2);
        assert_eq!(file.embedding_length().unwrap(), 16);
        assert_eq!(file.head_count().unwrap(), 4);
        assert_eq!(file.head_count_kv().unwrap(), 2);
        assert_eq!(file.context_length().unwrap(), 64);
        assert_eq!(file.vocab_size().unwrap(), 32);
        assert_eq!(file.eos_token_id(), Some(1));
    }

    #[test]
    fn dominant_dtype_ignores_norm_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.F32.gguf");
        TinyGgufConfig::default().write(&path).unwrap();

        let file = GgufModelFile::open(&path).unwrap();
        assert_eq!(file.dominant_quant_dtype(), Some(GgmlDType::F32));
    }

    #[test]
    fn missing_file_is_open_error() {
        let err = GgufModelFile::open(Path::new("/nonexistent/x.gguf")).unwrap_err();
        assert!(matches!(err, GgufError::Open { .. }));
    }

    #[test]
    fn missing_tensor_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.F32.gguf");
        TinyGgufConfig::default().write(&path).unwrap();

        let mut file = GgufModelFile::open(&path).unwrap();
        let err = file
            .qtensor("blk.99.attn_q.weight", &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, GgufError::MissingTensor(name) if name.contains("blk.99")));
    }

    #[test]
    fn tensor_roundtrip_preserves_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.F32.gguf");
        TinyGgufConfig::default().write(&path).unwrap();

        let mut file = GgufModelFile::open(&path).unwrap();
        let embd = file.dequant_tensor("token_embd.weight", &Device::Cpu).unwrap();
        assert_eq!(embd.dims(), &[32, 16]);
    }
}
