//! Mock models for exercising session logic without real weights.

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{Device, Result, Tensor};

use crate::model::{CausalModel, LayerCaches};

/// A model that emits a scripted token sequence: on its k-th forward call it
/// strongly favors `script[k]`, and favors `eos_token_id` once the script is
/// exhausted. The first call is the prompt prefill, so generated token k
/// comes from call k.
pub struct ScriptedModel {
    vocab_size: usize,
    max_seq_len: usize,
    script: Vec<u32>,
    eos_token_id: u32,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(vocab_size: usize, max_seq_len: usize, script: Vec<u32>, eos_token_id: u32) -> Self {
        Self {
            vocab_size,
            max_seq_len,
            script,
            eos_token_id,
            calls: AtomicUsize::new(0),
        }
    }

    /// A model that never emits EOS (the script repeats forever).
    pub fn endless(vocab_size: usize, max_seq_len: usize, token: u32) -> Self {
        // An out-of-range EOS id keeps the favored token in play indefinitely.
        let mut model = Self::new(vocab_size, max_seq_len, Vec::new(), 0);
        model.script = vec![token];
        model.eos_token_id = vocab_size as u32; // never representable
        model
    }

    fn favored_for_call(&self, call: usize) -> u32 {
        if self.script.is_empty() {
            return self.eos_token_id;
        }
        if self.eos_token_id as usize >= self.vocab_size {
            // Endless mode: cycle the script.
            self.script[call % self.script.len()]
        } else if call < self.script.len() {
            self.script[call]
        } else {
            self.eos_token_id
        }
    }
}

impl CausalModel for ScriptedModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        _seqlen_offset: usize,
        _cache: &mut LayerCaches,
    ) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let favored = self.favored_for_call(call) as usize;

        let mut logits = vec![0.0f32; seq_len * self.vocab_size];
        if favored < self.vocab_size {
            // Only the last position matters to the sampler.
            logits[(seq_len - 1) * self.vocab_size + favored] = 20.0;
        }
        Tensor::from_vec(logits, (seq_len, self.vocab_size), &Device::Cpu)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn num_layers(&self) -> usize {
        1
    }

    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn device(&self) -> &Device {
        &Device::Cpu
    }
}

/// A model whose logits are identical for every token: sampling sees a
/// uniform distribution, useful for nucleus-filter and determinism tests.
pub struct FlatModel {
    vocab_size: usize,
    max_seq_len: usize,
}

impl FlatModel {
    pub fn new(vocab_size: usize, max_seq_len: usize) -> Self {
        Self {
            vocab_size,
            max_seq_len,
        }
    }
}

impl CausalModel for FlatModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        _seqlen_offset: usize,
        _cache: &mut LayerCaches,
    ) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        Tensor::ones((seq_len, self.vocab_size), candle_core::DType::F32, &Device::Cpu)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn num_layers(&self) -> usize {
        1
    }

    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn device(&self) -> &Device {
        &Device::Cpu
    }
}
