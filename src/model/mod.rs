//! Model seam between the session orchestrator and the weights.
//!
//! The orchestrator only ever sees [`CausalModel`]: one forward pass over a
//! chunk of token ids, returning logits for every input position. Weights are
//! immutable after load and shared behind `Arc`; all mutable decoding state
//! (the KV cache) lives in [`LayerCaches`], owned exclusively by one session.

mod quantized_mistral;

pub use quantized_mistral::{ModelBuildError, QuantizedMistral};

use candle_core::{Device, Result, Tensor};

/// Per-layer key/value cache for a single session. Entries start empty and
/// grow along the sequence dimension as the session decodes.
pub type LayerCaches = Vec<Option<(Tensor, Tensor)>>;

/// Allocate an empty cache for a model with `num_layers` layers.
pub fn empty_caches(num_layers: usize) -> LayerCaches {
    vec![None; num_layers]
}

pub trait CausalModel: Send + Sync {
    /// Run the model over `input_ids` (shape `[seq_len]` worth of token ids,
    /// passed as a `[1, seq_len]` tensor) with `seqlen_offset` positions
    /// already in `cache`. Returns logits of shape `[seq_len, vocab_size]`.
    fn forward(
        &self,
        input_ids: &Tensor,
        seqlen_offset: usize,
        cache: &mut LayerCaches,
    ) -> Result<Tensor>;

    fn vocab_size(&self) -> usize;

    fn num_layers(&self) -> usize;

    /// Maximum total sequence length (prompt + generated) the model supports.
    fn max_seq_len(&self) -> usize;

    fn device(&self) -> &Device;
}
