//! Google Gemini adapter (REST `generateContent`/`streamGenerateContent`).
//!
//! Differences from the OpenAI shape, carried over from
//! `gemini_provider.py`: the system message becomes `system_instruction`,
//! `assistant` becomes the `"model"` role, JSON mode sets
//! `response_mime_type` plus a concrete `response_schema`, and every harm
//! category is set to `BLOCK_NONE` since this pipeline translates fiction
//! that legitimately contains violence, which default safety filters
//! over-trigger on.

use super::{
    CompletedResponse, Capabilities, ChatOutcome, ChatProvider, ChatRequest, FinishReason,
    Message, Role, ResponseFormat, StreamChunk, Usage,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_output_tokens: Option<u32>,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String, max_output_tokens: Option<u32>) -> Self {
        Self {
            client,
            base_url,
            api_key,
            max_output_tokens,
        }
    }

    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_instruction = None;
        let mut out = Vec::new();

        for m in messages {
            match m.role {
                Role::System => {
                    system_instruction = Some(match &system_instruction {
                        Some(existing) => format!("{existing}\n{}", m.content),
                        None => m.content.clone(),
                    });
                }
                Role::User => out.push(json!({ "role": "user", "parts": [{ "text": m.content }] })),
                Role::Assistant => out.push(json!({ "role": "model", "parts": [{ "text": m.content }] })),
            }
        }

        (system_instruction, out)
    }

    /// The translation response schema, matching the JSON shape the default
    /// prompt template asks for (see `prompt.rs`).
    fn translation_response_schema() -> serde_json::Value {
        let entity_category = || {
            json!({
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "properties": {
                        "translation": { "type": "string" },
                        "last_chapter": { "type": "integer" }
                    }
                }
            })
        };

        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "chapter": { "type": "integer" },
                "summary": { "type": "string" },
                "content": { "type": "array", "items": { "type": "string" } },
                "entities": {
                    "type": "object",
                    "properties": {
                        "characters": entity_category(),
                        "places": entity_category(),
                        "organizations": entity_category(),
                        "abilities": entity_category(),
                        "titles": entity_category(),
                        "equipment": entity_category(),
                    }
                }
            },
            "required": ["title", "chapter", "summary", "content", "entities"]
        })
    }

    fn safety_settings() -> Vec<serde_json::Value> {
        HARM_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}

/// Map Gemini's `finishReason` to our normalized reason, returning a
/// dedicated `ProviderError` for safety blocks and truncation so callers
/// can branch on spec §7's taxonomy instead of pattern-matching strings.
fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => FinishReason::Safety,
        _ => FinishReason::Other,
    }
}

fn candidate_text(candidate: &Candidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join(""))
        .unwrap_or_default()
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let (system_instruction, contents) = Self::convert_messages(&request.messages);
        let json_mode = request.response_format == ResponseFormat::Json;

        let mut generation_config = json!({
            "temperature": request.temperature,
            "topP": request.top_p,
        });
        if let Some(max_output_tokens) = self.max_output_tokens {
            generation_config["maxOutputTokens"] = json!(max_output_tokens);
        }
        if json_mode {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = Self::translation_response_schema();
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
            "safetySettings": Self::safety_settings(),
        });
        if let Some(system_instruction) = system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": system_instruction }] });
        }

        let method = if request.stream { "streamGenerateContent" } else { "generateContent" };
        let mut url = format!(
            "{}/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            request.model,
            method
        );
        if request.stream {
            url.push_str("?alt=sse");
        }

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.provider_name().to_string(),
                source,
            })?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED || resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Auth(self.provider_name().to_string()));
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimit {
                provider: self.provider_name().to_string(),
                retry_after_secs: None,
            });
        }

        if !request.stream {
            let parsed: GenerateContentResponse =
                resp.json().await.map_err(|source| ProviderError::Transport {
                    provider: self.provider_name().to_string(),
                    source,
                })?;

            let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
                ProviderError::UnexpectedShape(
                    self.provider_name().to_string(),
                    "response had no candidates".to_string(),
                )
            })?;

            let finish_reason_str = candidate.finish_reason.clone().unwrap_or_else(|| "STOP".to_string());
            let finish_reason = map_finish_reason(&finish_reason_str);
            let content = candidate_text(&candidate);

            if finish_reason == FinishReason::Safety {
                return Err(ProviderError::SafetyBlocked {
                    provider: self.provider_name().to_string(),
                    reason: finish_reason_str,
                });
            }

            let usage = parsed
                .usage_metadata
                .map(|u| Usage {
                    input_tokens: u.prompt_token_count,
                    output_tokens: u.candidates_token_count,
                })
                .unwrap_or_default();

            return Ok(ChatOutcome::Completed(CompletedResponse {
                content,
                finish_reason,
                usage,
                model: request.model,
            }));
        }

        let provider_name = self.provider_name().to_string();
        let byte_stream = resp.bytes_stream();
        let stream = stream_sse_deltas(byte_stream, provider_name);
        Ok(ChatOutcome::Streaming(Box::pin(stream)))
    }

    fn provider_name(&self) -> &str {
        "Google Gemini"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_json_mode: true,
            streaming: true,
            max_chars: None,
        }
    }
}

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

                let parsed: Result<GenerateContentResponse, _> = serde_json::from_str(data);
                match parsed {
                    Ok(chunk) => {
                        let Some(candidate) = chunk.candidates.into_iter().next() else { continue };
                        let finish_reason = candidate.finish_reason.as_deref().map(map_finish_reason);
                        let usage = chunk.usage_metadata.map(|u| Usage {
                            input_tokens: u.prompt_token_count,
                            output_tokens: u.candidates_token_count,
                        });
                        yield Ok(StreamChunk {
                            delta: candidate_text(&candidate),
                            finish_reason,
                            usage,
                        });
                    }
                    Err(detail) => {
                        yield Err(ProviderError::MalformedJson {
                            provider: provider_name.clone(),
                            detail: detail.to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_messages_renames_assistant_to_model() {
        let messages = vec![
            Message { role: Role::System, content: "sys".into() },
            Message { role: Role::User, content: "hi".into() },
            Message { role: Role::Assistant, content: "hello".into() },
        ];
        let (system, contents) = GeminiProvider::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("sys"));
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn map_finish_reason_classifies_safety_blocks() {
        assert_eq!(map_finish_reason("SAFETY"), FinishReason::Safety);
        assert_eq!(map_finish_reason("RECITATION"), FinishReason::Safety);
        assert_eq!(map_finish_reason("MAX_TOKENS"), FinishReason::MaxTokens);
        assert_eq!(map_finish_reason("STOP"), FinishReason::Stop);
    }
}
