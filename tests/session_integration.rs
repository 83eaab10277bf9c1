//! End-to-end tests: load a real (toy-sized) GGUF model from disk and drive
//! chat sessions through the public surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tempfile::TempDir;

use xlora_rt::handle::ModelHandle;
use xlora_rt::request::{ChatMessage, ChatRequest, FinishReason};
use xlora_rt::session::SessionError;
use xlora_rt::spec::ModelSpec;
use xlora_rt::testing::gguf_fixture::TinyGgufConfig;
use xlora_rt::tokenizer::TokenizerWrapper;

struct Fixture {
    _root: TempDir,
    weights_dir: PathBuf,
    tok_dir: PathBuf,
    adapters_dir: PathBuf,
    ordering: PathBuf,
}

fn fixture(context_length: usize) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let weights_dir = root.path().join("weights");
    let tok_dir = root.path().join("tok");
    let adapters_dir = root.path().join("adapters");

    std::fs::create_dir_all(&weights_dir).unwrap();
    TinyGgufConfig {
        context_length,
        ..Default::default()
    }
    .write(&weights_dir.join("tiny.F32.gguf"))
    .unwrap();

    std::fs::create_dir_all(&tok_dir).unwrap();
    TokenizerWrapper::for_testing(32)
        .save(&tok_dir.join("tokenizer.json"))
        .unwrap();

    write_adapter(&adapters_dir.join("solo"));
    let ordering = root.path().join("ordering.json");
    std::fs::write(
        &ordering,
        r#"{
            "order": ["solo"],
            "layers": {
                "base_model.model.model.layers.0.self_attn.q_proj": 0,
                "base_model.model.model.layers.1.self_attn.q_proj": 0
            }
        }"#,
    )
    .unwrap();

    Fixture {
        _root: root,
        weights_dir,
        tok_dir,
        adapters_dir,
        ordering,
    }
}

fn write_adapter(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("adapter_config.json"),
        r#"{"r": 2, "lora_alpha": 4, "target_modules": ["q_proj"]}"#,
    )
    .unwrap();
    let mut tensors = HashMap::new();
    for layer in 0..2 {
        tensors.insert(
            format!("base_model.model.model.layers.{layer}.self_attn.q_proj.lora_A.weight"),
            Tensor::full(0.3f32, (2, 16), &Device::Cpu).unwrap(),
        );
        tensors.insert(
            format!("base_model.model.model.layers.{layer}.self_attn.q_proj.lora_B.weight"),
            Tensor::full(0.3f32, (16, 2), &Device::Cpu).unwrap(),
        );
    }
    candle_core::safetensors::save(&tensors, dir.join("adapter_model.safetensors")).unwrap();
}

fn base_spec(fx: &Fixture) -> ModelSpec {
    ModelSpec::MistralGguf {
        tok_model_id: fx.tok_dir.to_string_lossy().into_owned(),
        quantized_model_id: fx.weights_dir.to_string_lossy().into_owned(),
        quantized_filename: "tiny.F32.gguf".to_string(),
        tokenizer_json: None,
        repeat_last_n: 64,
    }
}

fn xlora_spec(fx: &Fixture, cutoff: Option<usize>) -> ModelSpec {
    ModelSpec::XLoraMistralGguf {
        tok_model_id: fx.tok_dir.to_string_lossy().into_owned(),
        quantized_model_id: fx.weights_dir.to_string_lossy().into_owned(),
        quantized_filename: "tiny.F32.gguf".to_string(),
        tokenizer_json: None,
        repeat_last_n: 64,
        xlora_model_id: fx.adapters_dir.to_string_lossy().into_owned(),
        order: fx.ordering.clone(),
        tgt_non_granular_index: cutoff,
    }
}

fn greedy_request(max_tokens: usize) -> ChatRequest {
    let mut request = ChatRequest::new("mistral", vec![ChatMessage::user("t3 t4 t5")]);
    request.max_tokens = max_tokens;
    request.temperature = 0.0;
    request
}

#[test]
fn base_model_round_trip() {
    let fx = fixture(512);
    let handle = ModelHandle::load(&base_spec(&fx), &Device::Cpu).unwrap();

    let response = handle.chat(&greedy_request(8)).unwrap();
    assert!(response.token_counts.completion <= 8);
    assert!(response.token_counts.prompt > 0);
    assert!(matches!(
        response.finish_reason,
        FinishReason::Stop | FinishReason::Length
    ));
}

#[test]
fn greedy_sessions_are_deterministic_across_handles() {
    let fx = fixture(512);
    let first = ModelHandle::load(&base_spec(&fx), &Device::Cpu).unwrap();
    let second = ModelHandle::load(&base_spec(&fx), &Device::Cpu).unwrap();

    let request = greedy_request(8);
    assert_eq!(
        first.chat(&request).unwrap().text,
        second.chat(&request).unwrap().text
    );
}

#[test]
fn seeded_stochastic_sessions_reproduce() {
    let fx = fixture(512);
    let handle = ModelHandle::load(&base_spec(&fx), &Device::Cpu).unwrap();

    let mut request = greedy_request(12);
    request.temperature = 0.8;
    request.top_p = 0.9;

    let run = |seed| {
        let mut session = handle.new_session().with_seed(seed);
        session.run(&request).unwrap().text
    };
    assert_eq!(run(7), run(7));
}

#[test]
fn cutoff_zero_xlora_matches_base_model_exactly() {
    let fx = fixture(512);
    let base = ModelHandle::load(&base_spec(&fx), &Device::Cpu).unwrap();
    let gated = ModelHandle::load(&xlora_spec(&fx, Some(0)), &Device::Cpu).unwrap();

    assert!(gated.active_adapter_layers().is_empty());
    let request = greedy_request(8);
    assert_eq!(
        base.chat(&request).unwrap().text,
        gated.chat(&request).unwrap().text
    );
}

#[test]
fn xlora_handle_serves_requests_with_adapters_active() {
    let fx = fixture(512);
    let handle = ModelHandle::load(&xlora_spec(&fx, None), &Device::Cpu).unwrap();
    assert_eq!(handle.active_adapter_layers().len(), 2);

    let response = handle.chat(&greedy_request(8)).unwrap();
    assert!(response.token_counts.completion <= 8);
}

#[test]
fn example_request_wire_shape_is_served() {
    // The canonical client payload, deserialized from JSON as a transport
    // layer would hand it over.
    let fx = fixture(512);
    let handle = ModelHandle::load(&base_spec(&fx), &Device::Cpu).unwrap();

    let request: ChatRequest = serde_json::from_str(
        r#"{
            "model": "mistral",
            "messages": [{"role": "user", "content": "What is graphene?"}],
            "max_tokens": 256,
            "presence_penalty": 1.0,
            "top_p": 0.1,
            "temperature": 0.5
        }"#,
    )
    .unwrap();

    let mut session = handle.new_session().with_seed(0);
    let response = session.run(&request).unwrap();
    assert!(response.token_counts.completion <= 256);
    assert!(matches!(
        response.finish_reason,
        FinishReason::Stop | FinishReason::Length
    ));

    let wire = serde_json::to_value(&response).unwrap();
    assert!(wire["finish_reason"] == "stop" || wire["finish_reason"] == "length");
    assert!(wire["token_counts"]["prompt"].as_u64().unwrap() > 0);
}

#[test]
fn oversized_prompt_overflows_with_structured_error() {
    let fx = fixture(16);
    let handle = ModelHandle::load(&base_spec(&fx), &Device::Cpu).unwrap();

    let mut request = greedy_request(100);
    let long: Vec<String> = (0..24).map(|i| format!("t{}", i % 30)).collect();
    request.messages = vec![ChatMessage::user(long.join(" "))];

    match handle.chat(&request) {
        Err(SessionError::ContextOverflow { counts, max_seq_len }) => {
            assert_eq!(max_seq_len, 16);
            assert!(counts.prompt >= 16);
            assert_eq!(counts.completion, 0);
        }
        other => panic!("expected ContextOverflow, got {other:?}"),
    }
}
