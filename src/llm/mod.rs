//! Backend interface for promptwright
//!
//! This module defines what the compiler/parser pipeline needs from a text-generation backend:
//! role-tagged messages in, plain text (or a sequence of text chunks) out. Concrete providers
//! live behind feature gates.

pub mod error;
#[cfg(feature = "llm")]
pub mod ollama;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::BackendError;
#[cfg(feature = "llm")]
pub use ollama::{OllamaBackend, OllamaConfig};

// ============================================================================
// Messages
// ============================================================================

/// The author of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rendered message sent to (or received from) a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.text)
    }
}

// ============================================================================
// Request parameters
// ============================================================================

/// Sampling and formatting parameters forwarded to the backend on every call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    /// Model override; `None` lets the backend pick its default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Ask the backend to constrain its output to a JSON object.
    #[serde(default)]
    pub json_mode: bool,
}

impl LlmParams {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn stop_sequences(mut self, sequences: Vec<String>) -> Self {
        self.stop = Some(sequences);
        self
    }

    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    /// These parameters with every value set in `other` taking precedence.
    pub fn overlay(mut self, other: &LlmParams) -> Self {
        if other.model.is_some() {
            self.model = other.model.clone();
        }
        if other.temperature.is_some() {
            self.temperature = other.temperature;
        }
        if other.top_p.is_some() {
            self.top_p = other.top_p;
        }
        if other.max_tokens.is_some() {
            self.max_tokens = other.max_tokens;
        }
        if other.stop.is_some() {
            self.stop = other.stop.clone();
        }
        self.json_mode |= other.json_mode;
        self
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A complete (non-streamed) backend answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// One increment of a streamed answer. The last chunk has `done == true`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseChunk {
    pub delta: String,
    pub done: bool,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ResponseChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            ..Default::default()
        }
    }

    pub fn terminal(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            done: true,
            ..Default::default()
        }
    }
}

/// A lazily pulled, one-shot sequence of chunks. Each `next()` blocks on the backend.
pub type ChunkStream = Box<dyn Iterator<Item = Result<ResponseChunk, BackendError>> + Send>;

// ============================================================================
// Backend
// ============================================================================

/// A text-generation service.
///
/// Implementations own transport, authentication and retries (if any); the pipeline only
/// hands over rendered messages and reads text back.
pub trait Backend: Send + Sync {
    /// Generate a complete answer for the given conversation.
    fn predict(&self, messages: &[Message], params: &LlmParams) -> Result<LlmResponse, BackendError>;

    /// Generate an answer as a stream of chunks.
    ///
    /// The default implementation performs a regular `predict` and yields the whole text as a
    /// single terminal chunk.
    fn predict_stream(
        &self,
        messages: &[Message],
        params: &LlmParams,
    ) -> Result<ChunkStream, BackendError> {
        let response = self.predict(messages, params)?;
        let chunk = ResponseChunk {
            delta: response.text,
            done: true,
            model: response.model,
            usage: response.usage,
        };
        Ok(Box::new(std::iter::once(Ok(chunk))))
    }

    /// Name of the model answering when no override is given.
    fn default_model(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Backend for Echo {
        fn predict(&self, messages: &[Message], _params: &LlmParams) -> Result<LlmResponse, BackendError> {
            let last = messages.last().map(|m| m.text.clone()).unwrap_or_default();
            Ok(LlmResponse::new(last))
        }
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::user("hi").to_string(), "user: hi");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","text":"ok"}"#);
    }

    #[test]
    fn test_default_stream_yields_single_terminal_chunk() {
        let chunks: Vec<_> = Echo
            .predict_stream(&[Message::user("hello")], &LlmParams::default())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert_eq!(chunks[0].delta, "hello");
    }

    #[test]
    fn test_params_builder() {
        let params = LlmParams::default().model("phi4").temperature(0.2).json_mode(true);
        assert_eq!(params.model.as_deref(), Some("phi4"));
        assert_eq!(params.temperature, Some(0.2));
        assert!(params.json_mode);
        assert_eq!(TokenUsage::new(3, 4).total_tokens, 7);
    }

    #[test]
    fn test_params_overlay() {
        let base = LlmParams::default().model("phi4").temperature(0.7).json_mode(true);
        let merged = base.overlay(&LlmParams::default().temperature(0.1).max_tokens(64));
        assert_eq!(merged.model.as_deref(), Some("phi4"));
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.max_tokens, Some(64));
        assert!(merged.json_mode);
    }
}
