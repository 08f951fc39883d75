//! Anthropic adapter.
//!
//! Claude has three wire-format quirks relative to the OpenAI shape our
//! `ChatRequest` is modeled on: the system message is a top-level field
//! rather than part of the message list, there is no native JSON mode (it
//! is emulated via a trailing prompt instruction plus markdown-fence
//! stripping), and `temperature`/`top_p` cannot both be set. All three are
//! carried over from `claude_provider.py::chat_completion` verbatim in
//! semantics.

use super::{
    strip_markdown_fences, CompletedResponse, Capabilities, ChatOutcome, ChatProvider,
    ChatRequest, FinishReason, Message, Role, ResponseFormat, StreamChunk, Usage,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

const JSON_MODE_INSTRUCTION: &str = "\n\nIMPORTANT: You must respond with valid JSON only. \
Do not include any text before or after the JSON object. \
Do not wrap the JSON in markdown code fences.";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_output_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String, max_output_tokens: u32) -> Self {
        Self {
            client,
            base_url,
            api_key,
            max_output_tokens,
        }
    }

    /// Lift the system message out of the message list and fold consecutive
    /// same-role turns into Claude's plain string-content format.
    fn split_system_and_messages(messages: &[Message], json_mode: bool) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut out = Vec::new();

        for m in messages {
            match m.role {
                Role::System => {
                    system = Some(match &system {
                        Some(existing) => format!("{existing}\n{}", m.content),
                        None => m.content.clone(),
                    });
                }
                Role::User | Role::Assistant => {
                    out.push(WireMessage {
                        role: if m.role == Role::User { "user" } else { "assistant" }.to_string(),
                        content: m.content.clone(),
                    });
                }
            }
        }

        if json_mode {
            if let Some(last) = out.last_mut() {
                last.content.push_str(JSON_MODE_INSTRUCTION);
            }
        }

        (system, out)
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsageWire>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageWire {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn map_finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::MaxTokens,
        _ => FinishReason::Other,
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let json_mode = request.response_format == ResponseFormat::Json;
        let (system, wire_messages) = Self::split_system_and_messages(&request.messages, json_mode);

        let mut body = json!({
            "model": request.model,
            "messages": wire_messages,
            "max_tokens": self.max_output_tokens,
            "temperature": request.temperature,
            "stream": request.stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.provider_name().to_string(),
                source,
            })?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Auth(self.provider_name().to_string()));
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimit {
                provider: self.provider_name().to_string(),
                retry_after_secs,
            });
        }

        if !request.stream {
            let parsed: MessagesResponse =
                resp.json().await.map_err(|source| ProviderError::Transport {
                    provider: self.provider_name().to_string(),
                    source,
                })?;

            let mut content = parsed
                .content
                .into_iter()
                .find(|b| b.kind == "text")
                .map(|b| b.text)
                .unwrap_or_default();

            if json_mode {
                content = strip_markdown_fences(&content);
            }

            let usage = parsed
                .usage
                .map(|u| Usage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                })
                .unwrap_or_default();

            return Ok(ChatOutcome::Completed(CompletedResponse {
                content,
                finish_reason: map_finish_reason(parsed.stop_reason.as_deref()),
                usage,
                model: parsed.model,
            }));
        }

        let provider_name = self.provider_name().to_string();
        let byte_stream = resp.bytes_stream();
        let stream = stream_sse_deltas(byte_stream, provider_name);
        Ok(ChatOutcome::Streaming(Box::pin(stream)))
    }

    fn provider_name(&self) -> &str {
        "Anthropic Claude"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_json_mode: false,
            streaming: true,
            max_chars: None,
        }
    }
}

/// Assemble `content_block_delta`/`message_delta` SSE events into
/// normalized `StreamChunk`s, reusing the event-type dispatch idiom from
/// `src/proxy/sse/mod.rs::assemble_to_json` but incrementally rather than
/// as a final assembly pass.
fn stream_sse_deltas(
    byte_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    provider_name: String,
) -> impl futures::Stream<Item = Result<StreamChunk, ProviderError>> + Send {
    async_stream::stream! {
        let mut buf = String::new();
        futures::pin_mut!(byte_stream);

        while let Some(next) = byte_stream.next().await {
            let bytes = match next {
                Ok(b) => b,
                Err(source) => {
                    yield Err(ProviderError::Transport { provider: provider_name.clone(), source });
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(idx) = buf.find('\n') {
                let line = buf[..idx].trim_end_matches('\r').to_string();
                buf.drain(..=idx);

                let Some(data) = line.strip_prefix("data:").map(str::trim) else { continue };
                if data.is_empty() {
                    continue;
                }

                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                match value.get("type").and_then(|t| t.as_str()) {
                    Some("content_block_delta") => {
                        if let Some(text) = value.pointer("/delta/text").and_then(|t| t.as_str()) {
                            yield Ok(StreamChunk { delta: text.to_string(), finish_reason: None, usage: None });
                        }
                    }
                    Some("message_delta") => {
                        let finish_reason = value
                            .pointer("/delta/stop_reason")
                            .and_then(|v| v.as_str())
                            .map(|r| map_finish_reason(Some(r)));
                        let usage = value.get("usage").map(|u| Usage {
                            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                            output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                        });
                        if finish_reason.is_some() || usage.is_some() {
                            yield Ok(StreamChunk { delta: String::new(), finish_reason, usage });
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_system_lifts_system_message_out() {
        let messages = vec![
            Message { role: Role::System, content: "be terse".into() },
            Message { role: Role::User, content: "hi".into() },
        ];
        let (system, wire) = AnthropicProvider::split_system_and_messages(&messages, false);
        assert_eq!(system.as_deref(), Some("be terse"));
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].role, "user");
    }

    #[test]
    fn split_system_appends_json_instruction_to_last_message() {
        let messages = vec![Message { role: Role::User, content: "translate this".into() }];
        let (_, wire) = AnthropicProvider::split_system_and_messages(&messages, true);
        assert!(wire[0].content.ends_with(JSON_MODE_INSTRUCTION));
    }
}
