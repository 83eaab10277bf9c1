//! Session orchestration: one request driven synchronously to completion.
//!
//! A session validates the request against the loaded handle, renders and
//! encodes the conversation, then drives the autoregressive loop through
//! [`TokenStream`] — a lazy, finite, non-restartable sequence of sampled
//! tokens. Steady-state generation is pure compute: no I/O after load.
//!
//! Cancellation is cooperative, checked between steps. Forced stops
//! (context exhaustion, model failure) surface as structured errors carrying
//! the token counts accumulated so far; only clean stops produce a response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, info};

use crate::handle::ModelHandle;
use crate::model::{empty_caches, CausalModel, LayerCaches};
use crate::request::{ChatRequest, ChatResponse, FinishReason, RequestError, TokenCounts};
use crate::sampling::{sample_next, SamplerState, SamplingParams};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("request names model `{requested}`, but this handle serves `{served}`")]
    ModelMismatch { requested: String, served: String },
    #[error("tokenization failed: {0}")]
    Tokenize(String),
    #[error("context window of {max_seq_len} tokens exhausted")]
    ContextOverflow {
        max_seq_len: usize,
        counts: TokenCounts,
    },
    #[error("model execution failed: {detail}")]
    Model {
        detail: String,
        counts: TokenCounts,
    },
    #[error("generation cancelled")]
    Cancelled { counts: TokenCounts },
}

impl SessionError {
    /// Token counts accumulated before the failure, when generation had
    /// already started.
    pub fn token_counts(&self) -> Option<TokenCounts> {
        match self {
            SessionError::ContextOverflow { counts, .. }
            | SessionError::Model { counts, .. }
            | SessionError::Cancelled { counts } => Some(*counts),
            _ => None,
        }
    }

    pub fn finish_reason(&self) -> FinishReason {
        FinishReason::Error
    }
}

/// Cooperative cancellation flag, checked after every emitted token.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    Generating,
    Completed,
    Failed,
}

/// One request's lifecycle against a loaded handle.
pub struct Session<'m> {
    handle: &'m ModelHandle,
    state: SessionState,
    cancel: CancelToken,
    seed: Option<u64>,
}

impl<'m> Session<'m> {
    pub fn new(handle: &'m ModelHandle) -> Self {
        Self {
            handle,
            state: SessionState::Initialized,
            cancel: CancelToken::new(),
            seed: None,
        }
    }

    /// Fix the sampling seed for reproducible output.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token for cancelling this session from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drive the request to completion and assemble the response.
    pub fn run(&mut self, request: &ChatRequest) -> Result<ChatResponse, SessionError> {
        let result = self.run_inner(request);
        self.state = match result {
            Ok(_) => SessionState::Completed,
            Err(_) => SessionState::Failed,
        };
        result
    }

    fn run_inner(&mut self, request: &ChatRequest) -> Result<ChatResponse, SessionError> {
        let mut stream = self.stream(request)?;
        for token in &mut stream {
            token?;
        }
        let finish_reason = stream.finish_reason().unwrap_or(FinishReason::Length);
        let token_counts = stream.token_counts();
        let text = self
            .handle
            .tokenizer()
            .decode(stream.generated())
            .map_err(|e| SessionError::Tokenize(e.to_string()))?;

        info!(
            prompt_tokens = token_counts.prompt,
            completion_tokens = token_counts.completion,
            finish_reason = ?finish_reason,
            "session complete"
        );
        Ok(ChatResponse {
            text,
            finish_reason,
            token_counts,
        })
    }

    /// Validate the request, encode the prompt, and hand back the lazy token
    /// sequence. The stream yields each sampled token exactly once.
    pub fn stream(&mut self, request: &ChatRequest) -> Result<TokenStream, SessionError> {
        request.validate()?;
        if request.model != self.handle.model_key() {
            return Err(SessionError::ModelMismatch {
                requested: request.model.clone(),
                served: self.handle.model_key().to_string(),
            });
        }

        let prompt = self
            .handle
            .template()
            .apply(&request.messages, true)
            .map_err(|e| SessionError::Tokenize(format!("chat template: {e}")))?;
        let prompt_ids = self
            .handle
            .tokenizer()
            .encode(&prompt)
            .map_err(|e| SessionError::Tokenize(e.to_string()))?;
        if prompt_ids.is_empty() {
            return Err(SessionError::Tokenize(
                "prompt encoded to zero tokens".to_string(),
            ));
        }

        let model = self.handle.model().clone();
        let max_seq_len = model.max_seq_len();
        if prompt_ids.len() >= max_seq_len {
            return Err(SessionError::ContextOverflow {
                max_seq_len,
                counts: TokenCounts {
                    prompt: prompt_ids.len(),
                    completion: 0,
                },
            });
        }

        let params = SamplingParams {
            temperature: request.temperature,
            top_p: request.top_p,
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
            repeat_last_n: self.handle.repeat_last_n(),
            seed: self.seed,
            ..Default::default()
        };
        debug!(
            prompt_tokens = prompt_ids.len(),
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            top_p = request.top_p,
            "starting generation"
        );

        self.state = SessionState::Generating;
        let cache = empty_caches(model.num_layers());
        let sampler_state = SamplerState::new(self.seed);
        Ok(TokenStream {
            model,
            cache,
            prompt_ids,
            generated: Vec::new(),
            params,
            sampler_state,
            eos_token_id: self.handle.eos_token_id(),
            max_tokens: request.max_tokens,
            max_seq_len,
            seqlen_offset: 0,
            cancel: self.cancel.clone(),
            finish: None,
            failed: false,
        })
    }
}

/// Lazy autoregressive token sequence. Finite, not restartable once
/// consumed; a streaming response surface can iterate it directly.
pub struct TokenStream {
    model: Arc<dyn CausalModel>,
    cache: LayerCaches,
    prompt_ids: Vec<u32>,
    generated: Vec<u32>,
    params: SamplingParams,
    sampler_state: SamplerState,
    eos_token_id: u32,
    max_tokens: usize,
    max_seq_len: usize,
    seqlen_offset: usize,
    cancel: CancelToken,
    finish: Option<FinishReason>,
    failed: bool,
}

impl TokenStream {
    /// Clean stop reason, once the stream is exhausted without error.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn generated(&self) -> &[u32] {
        &self.generated
    }

    pub fn token_counts(&self) -> TokenCounts {
        TokenCounts {
            prompt: self.prompt_ids.len(),
            completion: self.generated.len(),
        }
    }

    fn step(&mut self) -> Result<Option<u32>, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled {
                counts: self.token_counts(),
            });
        }
        if self.generated.len() >= self.max_tokens {
            self.finish = Some(FinishReason::Length);
            return Ok(None);
        }

        // First step feeds the whole prompt, later steps feed the last
        // sampled token against the cache.
        let input: Vec<u32> = if self.seqlen_offset == 0 {
            self.prompt_ids.clone()
        } else {
            vec![*self.generated.last().expect("decode step without token")]
        };

        if self.seqlen_offset + input.len() > self.max_seq_len {
            return Err(SessionError::ContextOverflow {
                max_seq_len: self.max_seq_len,
                counts: self.token_counts(),
            });
        }

        let input_len = input.len();
        let input = Tensor::from_vec(input, (1, input_len), self.model.device()).map_err(|e| {
            SessionError::Model {
                detail: e.to_string(),
                counts: self.token_counts(),
            }
        })?;
        let logits = self
            .model
            .forward(&input, self.seqlen_offset, &mut self.cache)
            .map_err(|e| SessionError::Model {
                detail: e.to_string(),
                counts: self.token_counts(),
            })?;
        self.seqlen_offset += input_len;

        let last = logits
            .narrow(0, input_len - 1, 1)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| SessionError::Model {
                detail: e.to_string(),
                counts: self.token_counts(),
            })?;

        let token = sample_next(&last, &self.generated, &self.params, &mut self.sampler_state);
        if token == self.eos_token_id {
            self.finish = Some(FinishReason::Stop);
            return Ok(None);
        }
        self.generated.push(token);
        Ok(Some(token))
    }
}

impl Iterator for TokenStream {
    type Item = Result<u32, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.finish.is_some() {
            return None;
        }
        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;
    use crate::testing::{FlatModel, ScriptedModel};
    use crate::tokenizer::TokenizerWrapper;

    fn handle_with(model: Arc<dyn CausalModel>, eos: u32) -> ModelHandle {
        ModelHandle::for_testing(model, TokenizerWrapper::for_testing(32), eos)
    }

    fn greedy_request(max_tokens: usize) -> ChatRequest {
        let mut request = ChatRequest::new("mistral", vec![ChatMessage::user("t3 t4")]);
        request.max_tokens = max_tokens;
        request.temperature = 0.0;
        request
    }

    #[test]
    fn script_shorter_than_budget_finishes_with_stop() {
        let handle = handle_with(Arc::new(ScriptedModel::new(32, 128, vec![5, 6, 7], 1)), 1);
        let response = handle.chat(&greedy_request(10)).unwrap();

        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.token_counts.completion, 3);
        assert_eq!(response.text, "t5 t6 t7");
    }

    #[test]
    fn budget_reached_without_eos_finishes_with_length() {
        let handle = handle_with(Arc::new(ScriptedModel::endless(32, 128, 5)), 1);
        let response = handle.chat(&greedy_request(4)).unwrap();

        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.token_counts.completion, 4);
    }

    #[test]
    fn exactly_max_tokens_then_eos_reports_length() {
        // Script emits 3 tokens then EOS, but the budget is 3: the budget
        // check fires first.
        let handle = handle_with(Arc::new(ScriptedModel::new(32, 128, vec![5, 6, 7], 1)), 1);
        let response = handle.chat(&greedy_request(3)).unwrap();
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.token_counts.completion, 3);
    }

    #[test]
    fn wrong_model_key_is_rejected() {
        let handle = handle_with(Arc::new(ScriptedModel::new(32, 128, vec![], 1)), 1);
        let mut request = greedy_request(4);
        request.model = "llama".to_string();
        let err = handle.chat(&request).unwrap_err();
        assert!(matches!(
            err,
            SessionError::ModelMismatch { requested, .. } if requested == "llama"
        ));
    }

    #[test]
    fn invalid_request_fails_the_session() {
        let handle = handle_with(Arc::new(ScriptedModel::new(32, 128, vec![], 1)), 1);
        let mut session = handle.new_session();
        let mut request = greedy_request(4);
        request.top_p = 0.0;
        let err = session.run(&request).unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
        assert_eq!(err.finish_reason(), FinishReason::Error);
        assert!(err.token_counts().is_none());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn session_states_progress_to_completed() {
        let handle = handle_with(Arc::new(ScriptedModel::new(32, 128, vec![5], 1)), 1);
        let mut session = handle.new_session();
        assert_eq!(session.state(), SessionState::Initialized);
        session.run(&greedy_request(4)).unwrap();
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn oversized_prompt_is_context_overflow() {
        let handle = handle_with(Arc::new(ScriptedModel::new(32, 4, vec![5], 1)), 1);
        let mut request = greedy_request(4);
        request.messages = vec![ChatMessage::user("t1 t2 t3 t4 t5 t6 t7 t8")];
        let err = handle.chat(&request).unwrap_err();
        assert!(matches!(err, SessionError::ContextOverflow { .. }));
    }

    #[test]
    fn window_exhaustion_mid_generation_is_an_error_not_a_truncated_result() {
        // Window of 16: the prompt fits, but an endless script keeps
        // generating until the window runs out before max_tokens is reached.
        let handle = handle_with(Arc::new(ScriptedModel::endless(32, 16, 5)), 1);
        let err = handle.chat(&greedy_request(100)).unwrap_err();
        match err {
            SessionError::ContextOverflow { counts, .. } => {
                assert!(counts.completion > 0, "partial progress must be reported");
            }
            other => panic!("expected ContextOverflow, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_between_steps_reports_partial_counts() {
        let handle = handle_with(Arc::new(ScriptedModel::endless(32, 256, 5)), 1);
        let mut session = handle.new_session();
        let cancel = session.cancel_token();

        let mut stream = session.stream(&greedy_request(50)).unwrap();
        // Take two tokens, then cancel between steps.
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_ok());
        cancel.cancel();
        match stream.next() {
            Some(Err(SessionError::Cancelled { counts })) => {
                assert_eq!(counts.completion, 2);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(stream.next().is_none(), "stream is terminal after failure");
    }

    #[test]
    fn fixed_seed_makes_stochastic_sessions_reproducible() {
        let handle = handle_with(Arc::new(FlatModel::new(32, 256)), 31);
        let mut request = ChatRequest::new("mistral", vec![ChatMessage::user("t2 t3")]);
        request.max_tokens = 12;
        request.temperature = 0.9;
        request.top_p = 0.9;

        let run = |seed: u64| {
            let mut session = handle.new_session().with_seed(seed);
            session.run(&request).unwrap().text
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn graphene_scenario_shape() {
        // The canonical client request: bounded completion, clean finish.
        let handle = handle_with(Arc::new(FlatModel::new(32, 4096)), 31);
        let mut request =
            ChatRequest::new("mistral", vec![ChatMessage::user("What is graphene?")]);
        request.max_tokens = 256;
        request.presence_penalty = 1.0;
        request.top_p = 0.1;
        request.temperature = 0.5;

        let mut session = handle.new_session().with_seed(0);
        let response = session.run(&request).unwrap();
        assert!(response.token_counts.completion <= 256);
        assert!(matches!(
            response.finish_reason,
            FinishReason::Stop | FinishReason::Length
        ));
    }
}
