//! X-LoRA adapter support: the ordering contract, the loaded weight groups,
//! and the per-layer selection logic.

pub mod ordering;
pub mod stack;

pub use ordering::{AdapterOrdering, OrderingError};
pub use stack::{AdapterLoadError, LowRankAdapter, PeftConfig, XLoraStack};
