//! Writes small, valid GGUF v3 files for load-path and forward-path tests.
//!
//! Tensors are stored as F32 so the fixture stays readable by any GGUF
//! consumer without quantization tables. Geometry defaults to a 2-layer
//! Mistral-shaped toy model.

use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GGUF_MAGIC: u32 = 0x4655_4747;
const GGUF_VERSION: u32 = 3;
const ALIGNMENT: u64 = 32;

// GGUF metadata value type ids.
const T_U32: u32 = 4;
const T_F32: u32 = 6;
const T_STRING: u32 = 8;

// GGML tensor dtype id for F32.
const GGML_F32: u32 = 0;

enum MetaValue {
    U32(u32),
    F32(f32),
    Str(String),
}

struct TensorSpec {
    name: String,
    /// Row-major dims, e.g. `[out_features, in_features]`.
    dims: Vec<usize>,
    data: Vec<f32>,
}

/// Geometry of the toy model written by [`TinyGgufConfig::write`].
#[derive(Debug, Clone, Copy)]
pub struct TinyGgufConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub intermediate_size: usize,
    pub context_length: usize,
    pub eos_token_id: u32,
    pub seed: u64,
}

impl Default for TinyGgufConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32,
            hidden_size: 16,
            num_layers: 2,
            num_heads: 4,
            num_kv_heads: 2,
            intermediate_size: 32,
            context_length: 64,
            eos_token_id: 1,
            seed: 0,
        }
    }
}

impl TinyGgufConfig {
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut small = |n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-0.08f32..0.08)).collect()
        };

        let hd = self.hidden_size / self.num_heads;
        let q_out = self.num_heads * hd;
        let kv_out = self.num_kv_heads * hd;

        let mut tensors = Vec::new();
        tensors.push(TensorSpec {
            name: "token_embd.weight".into(),
            dims: vec![self.vocab_size, self.hidden_size],
            data: small(self.vocab_size * self.hidden_size),
        });
        for i in 0..self.num_layers {
            let matrices = [
                ("attn_q", q_out, self.hidden_size),
                ("attn_k", kv_out, self.hidden_size),
                ("attn_v", kv_out, self.hidden_size),
                ("attn_output", self.hidden_size, q_out),
                ("ffn_gate", self.intermediate_size, self.hidden_size),
                ("ffn_up", self.intermediate_size, self.hidden_size),
                ("ffn_down", self.hidden_size, self.intermediate_size),
            ];
            for (suffix, out, inp) in matrices {
                tensors.push(TensorSpec {
                    name: format!("blk.{i}.{suffix}.weight"),
                    dims: vec![out, inp],
                    data: small(out * inp),
                });
            }
            for norm in ["attn_norm", "ffn_norm"] {
                tensors.push(TensorSpec {
                    name: format!("blk.{i}.{norm}.weight"),
                    dims: vec![self.hidden_size],
                    data: vec![1.0; self.hidden_size],
                });
            }
        }
        tensors.push(TensorSpec {
            name: "output_norm.weight".into(),
            dims: vec![self.hidden_size],
            data: vec![1.0; self.hidden_size],
        });
        tensors.push(TensorSpec {
            name: "output.weight".into(),
            dims: vec![self.vocab_size, self.hidden_size],
            data: small(self.vocab_size * self.hidden_size),
        });

        let metadata = vec![
            ("general.architecture", MetaValue::Str("llama".into())),
            ("llama.block_count", MetaValue::U32(self.num_layers as u32)),
            (
                "llama.embedding_length",
                MetaValue::U32(self.hidden_size as u32),
            ),
            (
                "llama.attention.head_count",
                MetaValue::U32(self.num_heads as u32),
            ),
            (
                "llama.attention.head_count_kv",
                MetaValue::U32(self.num_kv_heads as u32),
            ),
            (
                "llama.context_length",
                MetaValue::U32(self.context_length as u32),
            ),
            (
                "llama.feed_forward_length",
                MetaValue::U32(self.intermediate_size as u32),
            ),
            (
                "llama.attention.layer_norm_rms_epsilon",
                MetaValue::F32(1e-5),
            ),
            ("llama.rope.freq_base", MetaValue::F32(10_000.0)),
            (
                "tokenizer.ggml.eos_token_id",
                MetaValue::U32(self.eos_token_id),
            ),
        ];

        write_gguf(path, &metadata, &tensors)
    }
}

fn write_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn write_meta_value(w: &mut impl Write, value: &MetaValue) -> io::Result<()> {
    match value {
        MetaValue::U32(v) => {
            w.write_all(&T_U32.to_le_bytes())?;
            w.write_all(&v.to_le_bytes())
        }
        MetaValue::F32(v) => {
            w.write_all(&T_F32.to_le_bytes())?;
            w.write_all(&v.to_le_bytes())
        }
        MetaValue::Str(v) => {
            w.write_all(&T_STRING.to_le_bytes())?;
            write_str(w, v)
        }
    }
}

fn write_gguf(
    path: &Path,
    metadata: &[(&str, MetaValue)],
    tensors: &[TensorSpec],
) -> io::Result<()> {
    let mut file = File::create(path)?;

    file.write_all(&GGUF_MAGIC.to_le_bytes())?;
    file.write_all(&GGUF_VERSION.to_le_bytes())?;
    file.write_all(&(tensors.len() as u64).to_le_bytes())?;
    file.write_all(&(metadata.len() as u64).to_le_bytes())?;

    for (key, value) in metadata {
        write_str(&mut file, key)?;
        write_meta_value(&mut file, value)?;
    }

    // Tensor data offsets are relative to the aligned start of the data
    // section, each tensor itself aligned.
    let mut offsets = Vec::with_capacity(tensors.len());
    let mut cursor = 0u64;
    for spec in tensors {
        let offset = cursor.div_ceil(ALIGNMENT) * ALIGNMENT;
        offsets.push(offset);
        cursor = offset + (spec.data.len() * 4) as u64;
    }

    for (spec, &offset) in tensors.iter().zip(&offsets) {
        write_str(&mut file, &spec.name)?;
        file.write_all(&(spec.dims.len() as u32).to_le_bytes())?;
        // GGUF stores dimensions innermost-first.
        for &dim in spec.dims.iter().rev() {
            file.write_all(&(dim as u64).to_le_bytes())?;
        }
        file.write_all(&GGML_F32.to_le_bytes())?;
        file.write_all(&offset.to_le_bytes())?;
    }

    // Pad to the aligned start of the data section.
    let position = file.stream_position()?;
    let data_start = position.div_ceil(ALIGNMENT) * ALIGNMENT;
    file.write_all(&vec![0u8; (data_start - position) as usize])?;

    let mut written = 0u64;
    for (spec, &offset) in tensors.iter().zip(&offsets) {
        file.write_all(&vec![0u8; (offset - written) as usize])?;
        for value in &spec.data {
            file.write_all(&value.to_le_bytes())?;
        }
        written = offset + (spec.data.len() * 4) as u64;
    }

    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_writes_nonempty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toy.F32.gguf");
        TinyGgufConfig::default().write(&path).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len > 1024, "fixture unexpectedly small: {len} bytes");
    }
}
