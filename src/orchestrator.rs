//! Chapter translation orchestrator (C6): splits chapter text into
//! chunks, drives one streaming or non-streaming chat call per chunk,
//! merges the results, and learns the char→token ratio. Grounded on
//! `translation_engine.py::translate_chapter` (lines 333–586) and
//! `split_by_n`.

use crate::error::{PipelineError, ProviderError};
use crate::prompt;
use crate::provider::{ChatOutcome, ChatProvider, ChatRequest, Message, ResponseFormat, Role};
use crate::ratio::RatioStore;
use crate::reconcile::{self, ChapterChunk, PotentialDuplicate};
use crate::store::entities::{self, EntityMap};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Split `sequence` into `n` near-equal-sized contiguous chunks, the
/// first `remainder` chunks getting one extra element. `n` is clamped to
/// `[1, sequence.len()]`. Ported from `split_by_n`.
pub fn split_into_chunks(sequence: &[String], n: usize) -> Vec<Vec<String>> {
    if sequence.is_empty() {
        return Vec::new();
    }
    let n = n.clamp(1, sequence.len());
    let chunk_size = sequence.len() / n;
    let remainder = sequence.len() % n;

    let mut chunks = Vec::with_capacity(n);
    let mut offset = 0;
    for i in 0..n {
        let take = if i < remainder { chunk_size + 1 } else { chunk_size };
        chunks.push(sequence[offset..offset + take].to_vec());
        offset += take;
    }
    chunks
}

/// Result of translating one chapter end to end.
#[derive(Debug, Clone)]
pub struct ChapterTranslationOutcome {
    pub title: String,
    pub chapter: i64,
    pub summary: String,
    pub content: Vec<String>,
    /// Entities present after the chapter, merged with what was already known.
    pub entities: EntityMap,
    /// Only the entities first introduced in this chapter.
    pub new_entities: EntityMap,
    pub total_char_count: usize,
    pub duplicates: Vec<PotentialDuplicate>,
}

fn chunk_count(total_chars: usize, max_chars: u32) -> usize {
    if total_chars == 0 {
        return 1;
    }
    let max_chars = max_chars.max(1) as usize;
    total_chars.div_ceil(max_chars).max(1)
}

async fn request_chunk(
    provider: &dyn ChatProvider,
    model: &str,
    system_prompt: &str,
    chunk_text: &str,
    max_output_tokens: u32,
    stream: bool,
    cancel: &AtomicBool,
) -> Result<(String, u32), PipelineError> {
    let user_text = format!("Translate the following into English: \n{chunk_text}");
    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![
            Message { role: Role::System, content: system_prompt.to_string() },
            Message { role: Role::User, content: user_text },
        ],
        temperature: 1.0,
        top_p: 1.0,
        max_output_tokens,
        response_format: ResponseFormat::Json,
        stream,
    };

    let outcome = provider.chat(request).await.map_err(PipelineError::Provider)?;
    match outcome {
        ChatOutcome::Completed(response) => {
            if cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }
            Ok((response.content, response.usage.output_tokens))
        }
        ChatOutcome::Streaming(mut stream) => {
            let mut response_text = String::new();
            let mut output_tokens = 0u32;
            let mut accumulated_since_log = 0usize;
            while let Some(chunk) = stream.next().await {
                if cancel.load(Ordering::Relaxed) {
                    return Err(PipelineError::Cancelled);
                }
                let chunk = chunk.map_err(PipelineError::Provider)?;
                response_text.push_str(&chunk.delta);
                accumulated_since_log += chunk.delta.chars().count();
                if accumulated_since_log >= 10 {
                    tracing::debug!(chars_so_far = response_text.len(), "streaming translation chunk");
                    accumulated_since_log = 0;
                }
                if let Some(usage) = chunk.usage {
                    output_tokens = usage.output_tokens;
                }
            }
            Ok((response_text, output_tokens))
        }
    }
}

/// Translate one chapter's text, chunking it to the provider's
/// `max_chars` budget, merging chunk results, and persisting the
/// learned token ratio. `cancel` is polled at chunk boundaries and every
/// streamed delta so a caller can abort cooperatively mid-chapter.
#[allow(clippy::too_many_arguments)]
pub async fn translate_chapter(
    chapter_text: &[String],
    old_entities: EntityMap,
    book_template: Option<&str>,
    provider: &dyn ChatProvider,
    model: &str,
    max_chars: u32,
    max_output_tokens: u32,
    stream: bool,
    ratio_store: &RatioStore,
    cancel: &AtomicBool,
) -> Result<ChapterTranslationOutcome, PipelineError> {
    let total_char_count: usize = chapter_text.iter().map(|line| line.chars().count()).sum();

    if total_char_count == 0 {
        return Ok(ChapterTranslationOutcome {
            title: String::new(),
            chapter: 0,
            summary: String::new(),
            content: Vec::new(),
            entities: old_entities,
            new_entities: EntityMap::new(),
            total_char_count: 0,
            duplicates: Vec::new(),
        });
    }

    let real_old_entities = old_entities.clone();
    let mut running_entities = old_entities;

    let chunks_count = chunk_count(total_char_count, max_chars);
    let chunks = split_into_chunks(chapter_text, chunks_count);

    let average_ratio = ratio_store.average().map_err(PipelineError::Store)?;

    let mut merged: Option<ChapterChunk> = None;
    let mut current_chapter = 0i64;
    let mut all_duplicates = Vec::new();
    let mut total_output_tokens = 0usize;
    let mut do_count = true;

    for chunk_lines in &chunks {
        if cancel.load(Ordering::Relaxed) {
            return Err(PipelineError::Cancelled);
        }

        let system_prompt = prompt::compose_system_prompt(chunk_lines, &running_entities, do_count, book_template, provider).map_err(PipelineError::Config)?;
        do_count = false;

        let chunk_str = chunk_lines.join("\n");
        let expected_tokens = (chunk_str.chars().count() as f64 * average_ratio).ceil() as u32;
        let token_budget = max_output_tokens.max(expected_tokens.saturating_mul(2)).max(256);

        let (response_text, output_tokens) = request_chunk(provider, model, &system_prompt, &chunk_str, token_budget, stream, cancel).await?;

        let value = provider.validate_json_response(&response_text).map_err(PipelineError::Provider)?;
        let parsed: ChapterChunk = serde_json::from_value(value).map_err(|e| {
            PipelineError::Provider(ProviderError::MalformedJson { provider: provider.provider_name().to_string(), detail: e.to_string() })
        })?;

        current_chapter = parsed.chapter;
        total_output_tokens += output_tokens as usize;

        let (next_merged, duplicates) = reconcile::merge_chunks(merged, parsed.clone(), current_chapter);
        all_duplicates.extend(duplicates);
        merged = Some(next_merged);

        running_entities = entities::combine_entity_maps(running_entities, parsed.entities);
    }

    let _ratio_history = ratio_store.record(total_char_count, total_output_tokens).map_err(PipelineError::Store)?;

    let merged = merged.ok_or(PipelineError::ExhaustedRetries)?;
    let new_entities = entities::find_new_entities(&real_old_entities, &merged.entities);
    let final_entities = entities::combine_entity_maps(running_entities, merged.entities.clone());

    Ok(ChapterTranslationOutcome {
        title: merged.title,
        chapter: current_chapter,
        summary: merged.summary,
        content: merged.content,
        entities: final_entities,
        new_entities,
        total_char_count,
        duplicates: all_duplicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_into_chunks_distributes_remainder_to_leading_chunks() {
        let lines = strings(&["a", "b", "c", "d", "e"]);
        let chunks = split_into_chunks(&lines, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 2);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn split_into_chunks_clamps_n_to_sequence_length() {
        let lines = strings(&["a", "b"]);
        let chunks = split_into_chunks(&lines, 10);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| chunk.len() == 1));
    }

    #[test]
    fn split_into_chunks_on_empty_sequence_is_empty() {
        let chunks = split_into_chunks(&[], 4);
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_count_is_at_least_one() {
        assert_eq!(chunk_count(0, 5000), 1);
        assert_eq!(chunk_count(100, 5000), 1);
        assert_eq!(chunk_count(12000, 5000), 3);
    }

    use crate::provider::{
        CompletedResponse, Capabilities, FinishReason, Usage,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Returns one canned JSON response per call, recording the system
    /// prompt it was given so a test can assert on what the caller saw.
    struct StubProvider {
        responses: Vec<String>,
        calls: AtomicUsize,
        seen_prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ProviderError> {
            let index = self.calls.fetch_add(1, Ordering::Relaxed);
            self.seen_prompts.lock().unwrap().push(request.messages[0].content.clone());
            let content = self.responses[index].clone();
            Ok(ChatOutcome::Completed(CompletedResponse {
                content,
                finish_reason: FinishReason::Stop,
                usage: Usage { input_tokens: 10, output_tokens: 10 },
                model: request.model,
            }))
        }

        fn provider_name(&self) -> &str {
            "stub"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities { native_json_mode: true, streaming: false, max_chars: None }
        }
    }

    /// S1: a source token repeated across two chunks is learned from
    /// chunk 1 and fed back into chunk 2's prompt, then merged into a
    /// single glossary entry rather than duplicated.
    #[tokio::test]
    async fn chunk_boundary_entity_propagates_into_second_chunk_prompt_and_merges() {
        let chunk1_response = r#"{
            "title": "Arrival",
            "chapter": 5,
            "summary": "Zhang San arrives.",
            "content": ["Zhang San walked through the gate."],
            "entities": {
                "characters": {"张三": {"translation": "Zhang San", "gender": "male", "last_chapter": "THIS CHAPTER"}},
                "places": {}, "organizations": {}, "abilities": {}, "titles": {}, "equipment": {}
            }
        }"#;
        let chunk2_response = r#"{
            "title": "Arrival",
            "chapter": 5,
            "summary": "Zhang San meets the elder.",
            "content": ["Zhang San bowed to the elder."],
            "entities": {
                "characters": {"张三": {"translation": "Zhang San", "gender": "male", "last_chapter": "THIS CHAPTER"}},
                "places": {}, "organizations": {}, "abilities": {}, "titles": {}, "equipment": {}
            }
        }"#;
        let provider = StubProvider {
            responses: vec![chunk1_response.to_string(), chunk2_response.to_string()],
            calls: AtomicUsize::new(0),
            seen_prompts: Mutex::new(Vec::new()),
        };

        let dir = tempfile::tempdir().unwrap();
        let ratio_store = RatioStore::new(dir.path());
        let cancel = AtomicBool::new(false);

        let chapter_text = strings(&["张三 walked through the gate.", "张三 bowed to the elder."]);

        let outcome = translate_chapter(
            &chapter_text,
            EntityMap::new(),
            None,
            &provider,
            "stub-model",
            1, // max_chars=1 forces a two-chunk split across the two lines
            2048,
            false,
            &ratio_store,
            &cancel,
        )
        .await
        .unwrap();

        let seen_prompts = provider.seen_prompts.lock().unwrap();
        assert_eq!(seen_prompts.len(), 2);
        assert!(!seen_prompts[0].contains("张三"), "first chunk's prompt has no prior glossary to inject");
        assert!(
            seen_prompts[1].contains("张三") && seen_prompts[1].contains("Zhang San"),
            "second chunk's prompt should carry the entity learned from chunk one"
        );

        let characters = &outcome.entities["characters"];
        assert_eq!(characters.len(), 1);
        assert_eq!(characters["张三"].translation, "Zhang San");
        assert_eq!(characters["张三"].last_chapter.as_deref(), Some("5"), "the THIS CHAPTER sentinel must never reach the caller");
        assert_eq!(outcome.new_entities["characters"]["张三"].last_chapter.as_deref(), Some("5"), "nor the entities actually persisted via add_entity");
        assert_eq!(outcome.chapter, 5);
    }
}
