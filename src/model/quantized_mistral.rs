//! Quantized Mistral-family forward pass over GGUF weights.
//!
//! Every projection is an [`AdapterLinear`]: the quantized base matmul plus
//! the low-rank deltas of whatever adapters are installed on that module.
//! Adapter installation happens at build time from the active-layer set, so
//! a non-granular cutoff simply leaves the tail layers with bare base
//! projections.

use std::collections::BTreeSet;
use std::sync::Arc;

use candle_core::quantized::QMatMul;
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::Embedding;
use thiserror::Error;
use tracing::info;

use super::{CausalModel, LayerCaches};
use crate::adapter::{LowRankAdapter, XLoraStack};
use crate::gguf::{GgufError, GgufModelFile};
use crate::layers::{causal_mask, repeat_kv, RmsNorm, RotaryEmbedding};

#[derive(Debug, Error)]
pub enum ModelBuildError {
    #[error(transparent)]
    Gguf(#[from] GgufError),
    #[error("tensor construction failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Quantized base projection plus installed adapter deltas.
struct AdapterLinear {
    inner: QMatMul,
    adapters: Vec<LowRankAdapter>,
    blend_weight: f64,
}

impl AdapterLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = self.inner.forward(xs)?;
        if self.adapters.is_empty() {
            return Ok(ys);
        }
        let (b, s, h) = xs.dims3()?;
        let flat = xs.reshape((b * s, h))?;
        let out = ys.dims3()?.2;
        for adapter in &self.adapters {
            let delta = adapter.delta(&flat, self.blend_weight)?.reshape((b, s, out))?;
            ys = (ys + delta)?;
        }
        Ok(ys)
    }
}

struct Attention {
    q_proj: AdapterLinear,
    k_proj: AdapterLinear,
    v_proj: AdapterLinear,
    o_proj: AdapterLinear,
    rotary: Arc<RotaryEmbedding>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        seqlen_offset: usize,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let (b, q_len, _) = xs.dims3()?;

        let q = self.q_proj.forward(xs)?;
        let k = self.k_proj.forward(xs)?;
        let v = self.v_proj.forward(xs)?;

        let q = q
            .reshape((b, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = self.rotary.apply(&q, &k, seqlen_offset)?;
        let v = v.contiguous()?;

        let (k, v) = match cache.take() {
            Some((prev_k, prev_v)) => {
                let k = Tensor::cat(&[&prev_k, &k], 2)?;
                let v = Tensor::cat(&[&prev_v, &v], 2)?;
                (k, v)
            }
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v.contiguous()?)?;
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, q_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}

struct Mlp {
    gate_proj: AdapterLinear,
    up_proj: AdapterLinear,
    down_proj: AdapterLinear,
}

impl Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?;
        let up = self.up_proj.forward(xs)?;
        let hidden = (candle_nn::ops::silu(&gate)? * up)?;
        self.down_proj.forward(&hidden)
    }
}

struct Block {
    attn_norm: RmsNorm,
    attn: Attention,
    ffn_norm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        seqlen_offset: usize,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.attn_norm.forward(xs)?;
        let xs = self.attn.forward(&xs, mask, seqlen_offset, cache)?;
        let xs = (xs + residual)?;

        let residual = &xs;
        let mlp_out = self.mlp.forward(&self.ffn_norm.forward(&xs)?)?;
        residual + mlp_out
    }
}

pub struct QuantizedMistral {
    embed: Embedding,
    blocks: Vec<Block>,
    final_norm: RmsNorm,
    lm_head: QMatMul,
    device: Device,
    dtype: DType,
    vocab_size: usize,
    max_seq_len: usize,
}

impl QuantizedMistral {
    /// Assemble the model from an opened GGUF file, installing adapter
    /// deltas on the layers in `active` (X-LoRA variants only).
    pub fn from_gguf(
        file: &mut GgufModelFile,
        adapters: Option<(&XLoraStack, &BTreeSet<usize>)>,
        device: &Device,
    ) -> std::result::Result<Self, ModelBuildError> {
        file.require_llama_family()?;

        let num_layers = file.block_count()?;
        let hidden_size = file.embedding_length()?;
        let num_heads = file.head_count()?;
        let num_kv_heads = file.head_count_kv()?;
        let head_dim = hidden_size / num_heads;
        let max_seq_len = file.context_length()?;
        let eps = file.rms_norm_eps()?;
        let rope_theta = file.rope_freq_base();
        let vocab_size = file.vocab_size()?;

        let dtype = DType::F32;
        let rotary = Arc::new(RotaryEmbedding::new(
            head_dim,
            max_seq_len,
            rope_theta,
            dtype,
            device,
        )?);

        let embed_weight = file.dequant_tensor("token_embd.weight", device)?;
        let embed = Embedding::new(embed_weight.clone(), hidden_size);

        let blend_weight = adapters
            .map(|(stack, _)| stack.blend_weight())
            .unwrap_or(1.0);
        let linear = |file: &mut GgufModelFile,
                          layer: usize,
                          gguf_name: &str,
                          kind: &str|
         -> std::result::Result<AdapterLinear, ModelBuildError> {
            let qt = file.qtensor(&format!("blk.{layer}.{gguf_name}.weight"), device)?;
            let installed = match adapters {
                Some((stack, active)) if active.contains(&layer) => {
                    stack.adapters_for(layer, kind).to_vec()
                }
                _ => Vec::new(),
            };
            Ok(AdapterLinear {
                inner: QMatMul::from_qtensor(qt)?,
                adapters: installed,
                blend_weight,
            })
        };

        let mut blocks = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            // GGUF projection names paired with their PEFT module kinds.
            let q_proj = linear(file, i, "attn_q", "q_proj")?;
            let k_proj = linear(file, i, "attn_k", "k_proj")?;
            let v_proj = linear(file, i, "attn_v", "v_proj")?;
            let o_proj = linear(file, i, "attn_output", "o_proj")?;
            let gate_proj = linear(file, i, "ffn_gate", "gate_proj")?;
            let up_proj = linear(file, i, "ffn_up", "up_proj")?;
            let down_proj = linear(file, i, "ffn_down", "down_proj")?;

            let attn_norm = RmsNorm::new(
                file.dequant_tensor(&format!("blk.{i}.attn_norm.weight"), device)?,
                eps,
            );
            let ffn_norm = RmsNorm::new(
                file.dequant_tensor(&format!("blk.{i}.ffn_norm.weight"), device)?,
                eps,
            );

            blocks.push(Block {
                attn_norm,
                attn: Attention {
                    q_proj,
                    k_proj,
                    v_proj,
                    o_proj,
                    rotary: rotary.clone(),
                    num_heads,
                    num_kv_heads,
                    head_dim,
                },
                ffn_norm,
                mlp: Mlp {
                    gate_proj,
                    up_proj,
                    down_proj,
                },
            });
        }

        let final_norm = RmsNorm::new(file.dequant_tensor("output_norm.weight", device)?, eps);
        let lm_head = if file.has_tensor("output.weight") {
            QMatMul::from_qtensor(file.qtensor("output.weight", device)?)?
        } else {
            // Tied embeddings: reuse the embedding table as the output head.
            QMatMul::Tensor(embed_weight)
        };

        let adapted_layers = adapters
            .map(|(_, active)| active.len())
            .unwrap_or(0);
        info!(
            layers = num_layers,
            hidden_size,
            vocab_size,
            adapted_layers,
            "assembled quantized model"
        );

        Ok(Self {
            embed,
            blocks,
            final_norm,
            lm_head,
            device: device.clone(),
            dtype,
            vocab_size,
            max_seq_len,
        })
    }
}

impl CausalModel for QuantizedMistral {
    fn forward(
        &self,
        input_ids: &Tensor,
        seqlen_offset: usize,
        cache: &mut LayerCaches,
    ) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mask = if seq_len <= 1 {
            None
        } else {
            Some(causal_mask(seq_len, seqlen_offset, self.dtype, &self.device)?)
        };

        let mut xs = self.embed.forward(input_ids)?;
        for (layer_cache, block) in cache.iter_mut().zip(&self.blocks) {
            xs = block.forward(&xs, mask.as_ref(), seqlen_offset, layer_cache)?;
        }
        let xs = self.final_norm.forward(&xs)?;
        let logits = self.lm_head.forward(&xs)?;
        logits.squeeze(0)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
