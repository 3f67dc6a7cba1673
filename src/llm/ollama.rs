//! Ollama backend for local inference

use std::io::{BufRead, BufReader};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{
    error::BackendError, Backend, ChunkStream, LlmParams, LlmResponse, Message, ResponseChunk,
    TokenUsage,
};

/// Configuration for the Ollama backend
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama server URL (default: http://localhost:11434)
    pub host: String,
    /// Default model to use (default: phi4)
    pub default_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            default_model: "phi4".to_string(),
        }
    }
}

/// Request structure for Ollama chat completions
#[derive(Debug, Serialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// A message in Ollama's chat format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for OllamaMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.text.clone(),
        }
    }
}

/// Options for Ollama generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Response (or streamed response line) from Ollama's chat endpoint
#[derive(Debug, Deserialize)]
pub struct OllamaChatResponse {
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub message: OllamaMessage,
    pub done: bool,
    #[serde(default)]
    pub total_duration: u64,
    #[serde(default)]
    pub prompt_eval_count: u32,
    #[serde(default)]
    pub eval_count: u32,
}

impl OllamaChatResponse {
    fn usage(&self) -> Option<TokenUsage> {
        if self.done {
            Some(TokenUsage::new(self.prompt_eval_count, self.eval_count))
        } else {
            None
        }
    }
}

/// Blocking Ollama client implementing [`Backend`].
#[derive(Clone)]
pub struct OllamaBackend {
    client: reqwest::blocking::Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    /// Backend with the default host (http://localhost:11434) and default model (phi4)
    pub fn new() -> Self {
        Self::with_config(OllamaConfig::default())
    }

    /// Backend pointing at a custom host URL
    pub fn at(host: impl Into<String>) -> Self {
        Self::with_config(OllamaConfig {
            host: host.into(),
            ..Default::default()
        })
    }

    pub fn with_config(config: OllamaConfig) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            config,
        }
    }

    /// Update the default model
    pub fn edit_default_model(&mut self, model: impl Into<String>) {
        self.config.default_model = model.into();
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn request(&self, messages: &[Message], params: &LlmParams, stream: bool) -> OllamaChatRequest {
        OllamaChatRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages: messages.iter().map(OllamaMessage::from).collect(),
            stream,
            options: Some(OllamaOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                num_predict: params.max_tokens,
                stop: params.stop.clone(),
            }),
            format: params.json_mode.then(|| "json".to_string()),
        }
    }

    fn send(&self, request: &OllamaChatRequest) -> Result<reqwest::blocking::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.config.host))
            .json(request)
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(BackendError::OllamaError(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }
        Ok(response)
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for OllamaBackend {
    fn predict(&self, messages: &[Message], params: &LlmParams) -> Result<LlmResponse, BackendError> {
        let request = self.request(messages, params, false);
        let chat_response: OllamaChatResponse = self.send(&request)?.json()?;
        Ok(LlmResponse {
            usage: chat_response.usage(),
            model: Some(chat_response.model),
            text: chat_response.message.content,
        })
    }

    fn predict_stream(&self, messages: &[Message], params: &LlmParams) -> Result<ChunkStream, BackendError> {
        let request = self.request(messages, params, true);
        let response = self.send(&request)?;
        let lines = BufReader::new(response).lines();

        let chunks = lines
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .map(|line| -> Result<ResponseChunk, BackendError> {
                let line = line?;
                let parsed: OllamaChatResponse = serde_json::from_str(&line)?;
                Ok(ResponseChunk {
                    usage: parsed.usage(),
                    done: parsed.done,
                    model: Some(parsed.model),
                    delta: parsed.message.content,
                })
            });
        Ok(Box::new(chunks))
    }

    fn default_model(&self) -> Option<&str> {
        Some(&self.config.default_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_defaults() {
        let backend = OllamaBackend::new();
        assert_eq!(backend.config().host, "http://localhost:11434");
        assert_eq!(backend.default_model(), Some("phi4"));

        let custom = OllamaBackend::at("http://192.168.1.10:11434");
        assert_eq!(custom.config().host, "http://192.168.1.10:11434");
    }

    #[test]
    fn test_request_maps_params() {
        let backend = OllamaBackend::new();
        let params = LlmParams::default().temperature(0.1).max_tokens(64).json_mode(true);
        let request = backend.request(&[Message::system("be terse"), Message::user("hi")], &params, false);

        assert_eq!(request.model, "phi4");
        assert_eq!(request.format.as_deref(), Some("json"));
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[1].content, "hi");
        let options = request.options.unwrap();
        assert_eq!(options.num_predict, Some(64));
    }

    #[test]
    fn test_stream_line_parses() {
        let line = r#"{"model":"phi4","created_at":"2024-01-01T00:00:00Z","message":{"role":"assistant","content":"He"},"done":false}"#;
        let parsed: OllamaChatResponse = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.message.content, "He");
        assert!(parsed.usage().is_none());
    }
}
