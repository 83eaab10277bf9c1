//! Test support: scripted models and on-disk model fixtures.

pub mod gguf_fixture;
mod mock;

pub use mock::{FlatModel, ScriptedModel};
