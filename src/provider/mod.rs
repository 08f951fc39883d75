//! Provider abstraction over chat-completion vendor APIs.
//!
//! Each vendor speaks a different wire format. The rest of the pipeline only
//! ever talks to the `ChatProvider` trait, which normalizes request/response
//! shapes the way `proxy::translation` normalizes Anthropic↔OpenAI traffic,
//! generalized to three vendors instead of two.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod registry;

use crate::error::ProviderError;
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A single chat message, role-tagged OpenAI-style. Adapters translate this
/// into whatever shape their vendor expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Whether the caller wants the model to emit plain text or strict JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

/// A normalized chat request, independent of vendor wire format.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    pub response_format: ResponseFormat,
    pub stream: bool,
}

/// Token accounting, normalized across vendors (OpenAI's prompt/completion,
/// Anthropic's input/output, Gemini's promptTokenCount/candidatesTokenCount).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Other,
}

/// A completed (non-streaming) chat response.
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub model: String,
}

/// One incremental piece of a streaming response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Result of a chat call: either fully materialized, or an incremental stream.
pub enum ChatOutcome {
    Completed(CompletedResponse),
    Streaming(ChatStream),
}

/// Capability set a provider advertises, mirroring the Python
/// `ModelProvider.supported_features` property.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub native_json_mode: bool,
    pub streaming: bool,
    pub max_chars: Option<usize>,
}

/// Shared contract every vendor adapter implements.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Perform a chat completion request.
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ProviderError>;

    /// Parse `content` as strict JSON, allowing vendor-specific salvage
    /// (e.g. Claude sometimes wraps JSON in prose; extract the first
    /// balanced `{...}` span before giving up).
    fn validate_json_response(&self, content: &str) -> Result<serde_json::Value, ProviderError> {
        if let Ok(value) = serde_json::from_str(content) {
            return Ok(value);
        }

        let trimmed = content.trim();
        if let Some(start) = trimmed.find('{') {
            let mut depth = 0i32;
            for (i, ch) in trimmed[start..].char_indices() {
                match ch {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            let candidate = &trimmed[start..start + i + 1];
                            if let Ok(value) = serde_json::from_str(candidate) {
                                return Ok(value);
                            }
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }

        Err(ProviderError::MalformedJson {
            provider: self.provider_name().to_string(),
            detail: format!(
                "could not extract valid JSON from response (first 100 chars: {})",
                &content.chars().take(100).collect::<String>()
            ),
        })
    }

    fn provider_name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;
}

/// Strip a leading/trailing ``` fence (optionally ```json) from a response,
/// used by adapters that emulate JSON mode via prompt instruction rather
/// than a native structured-output mode.
pub(crate) fn strip_markdown_fences(content: &str) -> String {
    let content = content.trim();
    let Some(rest) = content.strip_prefix("```") else {
        return content.to_string();
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider;

    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatOutcome, ProviderError> {
            unimplemented!()
        }
        fn provider_name(&self) -> &str {
            "stub"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
    }

    #[test]
    fn validate_json_response_parses_plain_json() {
        let stub = StubProvider;
        let value = stub.validate_json_response(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn validate_json_response_extracts_embedded_json() {
        let stub = StubProvider;
        let text = "Sure, here you go:\n{\"a\": 1, \"b\": [1,2]}\nLet me know if you need more.";
        let value = stub.validate_json_response(text).unwrap();
        assert_eq!(value["b"][1], 2);
    }

    #[test]
    fn validate_json_response_fails_on_garbage() {
        let stub = StubProvider;
        assert!(stub.validate_json_response("not json at all").is_err());
    }

    #[test]
    fn strip_markdown_fences_removes_json_fence() {
        let input = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(input), "{\"a\": 1}");
    }

    #[test]
    fn strip_markdown_fences_passthrough_without_fence() {
        let input = "{\"a\": 1}";
        assert_eq!(strip_markdown_fences(input), "{\"a\": 1}");
    }
}
