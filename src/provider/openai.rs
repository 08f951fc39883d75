//! OpenAI-compatible adapter.
//!
//! Covers both native OpenAI and OpenAI-compatible endpoints (DeepSeek et al)
//! by varying only `base_url`, mirroring `OpenAIProvider.__init__` in the
//! original Python implementation.

use super::{
    CompletedResponse, Capabilities, ChatOutcome, ChatProvider, ChatRequest, ChatStream,
    FinishReason, Message, Role, StreamChunk, Usage,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    display_name: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        let display_name = if base_url.to_lowercase().contains("deepseek") {
            "DeepSeek (via OpenAI API)".to_string()
        } else if base_url != "https://api.openai.com/v1" {
            format!("OpenAI-Compatible ({base_url})")
        } else {
            "OpenAI".to_string()
        };

        Self {
            client,
            base_url,
            api_key,
            display_name,
        }
    }

    fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                }
                .to_string(),
                content: m.content.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::MaxTokens,
        Some("content_filter") => FinishReason::Safety,
        _ => FinishReason::Other,
    }
}

#[derive(Debug, Deserialize)]
struct StreamWireChunk {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let mut body = json!({
            "model": request.model,
            "messages": Self::to_wire_messages(&request.messages),
            "temperature": request.temperature,
            "top_p": request.top_p,
            "stream": request.stream,
        });

        if request.response_format == super::ResponseFormat::Json {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.display_name.clone(),
                source,
            })?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Auth(self.display_name.clone()));
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimit {
                provider: self.display_name.clone(),
                retry_after_secs,
            });
        }

        if !request.stream {
            let parsed: CompletionResponse =
                resp.json().await.map_err(|source| ProviderError::Transport {
                    provider: self.display_name.clone(),
                    source,
                })?;

            let choice = parsed
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::UnexpectedShape(
                    self.display_name.clone(),
                    "response had no choices".to_string(),
                ))?;

            let usage = parsed
                .usage
                .map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default();

            return Ok(ChatOutcome::Completed(CompletedResponse {
                content: choice.message.content.unwrap_or_default(),
                finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
                usage,
                model: parsed.model,
            }));
        }

        let display_name = self.display_name.clone();
        let byte_stream = resp.bytes_stream();
        let stream = byte_stream_to_sse_chunks(byte_stream, display_name);
        Ok(ChatOutcome::Streaming(Box::pin(stream)))
    }

    fn provider_name(&self) -> &str {
        &self.display_name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_json_mode: true,
            streaming: true,
            max_chars: None,
        }
    }
}

/// Turn a raw SSE byte stream into normalized `StreamChunk`s. Each `data:`
/// line carries one JSON chunk; `data: [DONE]` ends the stream, exactly the
/// shape `src/proxy/sse/mod.rs` already parses for the Anthropic side.
fn byte_stream_to_sse_chunks(
    byte_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    display_name: String,
) -> impl futures::Stream<Item = Result<StreamChunk, ProviderError>> + Send {
    async_stream::stream! {
        let mut buf = String::new();
        futures::pin_mut!(byte_stream);

        while let Some(next) = byte_stream.next().await {
            let bytes = match next {
                Ok(b) => b,
                Err(source) => {
                    yield Err(ProviderError::Transport { provider: display_name.clone(), source });
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(idx) = buf.find('\n') {
                let line = buf[..idx].trim_end_matches('\r').to_string();
                buf.drain(..=idx);

                let Some(data) = line.strip_prefix("data:").map(str::trim) else { continue };
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }

                match serde_json::from_str::<StreamWireChunk>(data) {
                    Ok(chunk) => {
                        let Some(choice) = chunk.choices.into_iter().next() else { continue };
                        let usage = chunk.usage.map(|u| Usage {
                            input_tokens: u.prompt_tokens,
                            output_tokens: u.completion_tokens,
                        });
                        yield Ok(StreamChunk {
                            delta: choice.delta.content.unwrap_or_default(),
                            finish_reason: choice.finish_reason.as_deref().map(map_finish_reason),
                            usage,
                        });
                    }
                    Err(detail) => {
                        yield Err(ProviderError::MalformedJson {
                            provider: display_name.clone(),
                            detail: detail.to_string(),
                        });
                    }
                }
            }
        }
    }
}
