//! Chat request and response shapes.
//!
//! One `ChatRequest` in, one `ChatResponse` out; nothing is retained between
//! calls. Message order is conversation order and is preserved through
//! templating and encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("temperature must be between 0 and 2, got {0}")]
    InvalidTemperature(f32),
    #[error("top_p must be between 0 (exclusive) and 1, got {0}")]
    InvalidTopP(f32),
    #[error("presence_penalty must be between -2 and 2, got {0}")]
    InvalidPresencePenalty(f32),
    #[error("frequency_penalty must be between -2 and 2, got {0}")]
    InvalidFrequencyPenalty(f32),
    #[error("max_tokens must be at least 1")]
    ZeroMaxTokens,
    #[error("messages must not be empty")]
    NoMessages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Routing key; must match the loaded handle's model family.
    pub model: String,
    /// Conversation messages in insertion order.
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
}

fn default_max_tokens() -> usize {
    128
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RequestError::InvalidTemperature(self.temperature));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(RequestError::InvalidTopP(self.top_p));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(RequestError::InvalidPresencePenalty(self.presence_penalty));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(RequestError::InvalidFrequencyPenalty(self.frequency_penalty));
        }
        if self.max_tokens == 0 {
            return Err(RequestError::ZeroMaxTokens);
        }
        if self.messages.is_empty() {
            return Err(RequestError::NoMessages);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model emitted its end-of-sequence marker.
    Stop,
    /// The completion reached `max_tokens` without an end marker.
    Length,
    /// Generation ended because of a failure; paired with a `SessionError`.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt: usize,
    pub completion: usize,
}

impl TokenCounts {
    pub fn total(&self) -> usize {
        self.prompt + self.completion
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub finish_reason: FinishReason,
    pub token_counts: TokenCounts,
}
