//! Background queue worker: dequeue → translate → remove-on-success,
//! leave-in-place-on-failure. Runs independent of the interactive
//! translation path (spec.md §5 "Background queue worker"), grounded on
//! the teacher's `tokio::spawn(async move { storage.run().await })`
//! pattern in `src/main.rs`.

use crate::orchestrator::{self, ChapterTranslationOutcome};
use crate::provider::ChatProvider;
use crate::ratio::RatioStore;
use crate::store::entities::AddOutcome;
use crate::store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Everything the worker loop needs to translate and archive one
/// dequeued chapter. Held for the lifetime of the loop and reused across
/// iterations, since it owns the sole `Store` handle the worker writes
/// through (spec.md §5's single-writer requirement).
pub struct WorkerContext {
    pub store: Store,
    pub provider: std::sync::Arc<dyn ChatProvider>,
    pub model: String,
    pub max_chars: u32,
    pub max_output_tokens: u32,
    pub stream: bool,
    pub ratio_store: RatioStore,
    /// How long to sleep when the queue is empty before polling again.
    pub poll_interval: Duration,
}

/// Run the worker loop until `shutdown` is set. Each iteration peeks the
/// lowest-position queue item, translates it, and on success writes the
/// chapter and removes the item; on failure the item is left in place so
/// a manual retry can pick it up later.
pub async fn run_worker_loop(ctx: WorkerContext, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("worker loop shutting down");
            return;
        }

        match ctx.store.dequeue_peek(None) {
            Ok(Some(item)) => {
                tracing::info!(queue_id = item.id, book_id = item.book_id, title = %item.title, "translating queued chapter");

                match translate_and_archive(&ctx, &item, shutdown).await {
                    Ok(()) => {
                        if let Err(e) = ctx.store.remove_from_queue(item.id) {
                            tracing::error!(queue_id = item.id, error = %e, "failed to remove completed item from queue");
                        }
                    }
                    Err(WorkerError::Cancelled) => {
                        tracing::info!(queue_id = item.id, "translation cancelled, leaving item queued");
                    }
                    Err(WorkerError::Pipeline(e)) => {
                        tracing::error!(queue_id = item.id, error = %e, "translation failed, leaving item queued for manual retry");
                        tokio::time::sleep(ctx.poll_interval).await;
                    }
                }
            }
            Ok(None) => {
                tokio::time::sleep(ctx.poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read queue, backing off");
                tokio::time::sleep(ctx.poll_interval).await;
            }
        }
    }
}

enum WorkerError {
    Cancelled,
    Pipeline(crate::error::PipelineError),
}

impl From<crate::error::PipelineError> for WorkerError {
    fn from(e: crate::error::PipelineError) -> Self {
        match e {
            crate::error::PipelineError::Cancelled => WorkerError::Cancelled,
            other => WorkerError::Pipeline(other),
        }
    }
}

impl From<crate::error::StoreError> for WorkerError {
    fn from(e: crate::error::StoreError) -> Self {
        WorkerError::Pipeline(crate::error::PipelineError::Store(e))
    }
}

async fn translate_and_archive(ctx: &WorkerContext, item: &crate::store::queue::QueueItem, shutdown: &AtomicBool) -> Result<(), WorkerError> {
    let old_entities = ctx.store.load_entities(Some(item.book_id))?;
    let book_template = ctx.store.get_book_prompt_template(item.book_id)?;

    let outcome: ChapterTranslationOutcome = orchestrator::translate_chapter(
        &item.content,
        old_entities,
        book_template.as_deref(),
        ctx.provider.as_ref(),
        &ctx.model,
        ctx.max_chars,
        ctx.max_output_tokens,
        ctx.stream,
        &ctx.ratio_store,
        shutdown,
    )
    .await?;

    for (category, entries) in &outcome.new_entities {
        for (untranslated, data) in entries {
            let result = ctx.store.add_entity(
                category,
                untranslated,
                &data.translation,
                Some(item.book_id),
                data.last_chapter.as_deref(),
                data.incorrect_translation.as_deref(),
                data.gender.as_deref(),
            )?;
            if let AddOutcome::ConflictCategory(existing_category) = result {
                tracing::warn!(
                    queue_id = item.id,
                    category,
                    existing_category,
                    untranslated,
                    translation = %data.translation,
                    "new entity conflicts with an existing entity in a different category, not persisted"
                );
            }
        }
    }

    let chapter_number = item.chapter_number.unwrap_or(outcome.chapter);
    ctx.store.save_chapter(item.book_id, chapter_number, &outcome.title, &item.content, &outcome.content, Some(&outcome.summary), &ctx.model)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Capabilities, ChatOutcome, ChatProvider, ChatRequest, CompletedResponse, FinishReason, Usage};
    use crate::store::queue::QueueItem;
    use async_trait::async_trait;

    #[test]
    fn shutdown_flag_stops_loop_before_any_dequeue() {
        let shutdown = AtomicBool::new(true);
        assert!(shutdown.load(Ordering::Relaxed));
    }

    struct StubProvider {
        response: String,
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, crate::error::ProviderError> {
            Ok(ChatOutcome::Completed(CompletedResponse {
                content: self.response.clone(),
                finish_reason: FinishReason::Stop,
                usage: Usage { input_tokens: 5, output_tokens: 5 },
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

    /// A new entity that collides with a pre-existing one in a different
    /// category must not be silently dropped: `add_entity`'s
    /// `AddOutcome::ConflictCategory` is a successful `Ok`, not an `Err`,
    /// so discarding it with a bare `?` would both skip persistence and
    /// skip reporting the conflict.
    #[tokio::test]
    async fn entity_conflicting_with_existing_category_is_logged_not_silently_dropped() {
        let store = crate::store::open_memory_store();
        let book_id = store.create_book("Test Book", None, "en", None, "zh", "en").unwrap();
        store.add_entity("characters", "李四", "Li Si", Some(book_id), None, None, None).unwrap();

        let response = r#"{
            "title": "Ch",
            "chapter": 1,
            "summary": "s",
            "content": ["line"],
            "entities": {
                "characters": {},
                "places": {"李四": {"translation": "Li Si Village", "last_chapter": "THIS CHAPTER"}},
                "organizations": {}, "abilities": {}, "titles": {}, "equipment": {}
            }
        }"#;

        let ratio_dir = tempfile::tempdir().unwrap();
        let ctx = WorkerContext {
            store: store.clone(),
            provider: std::sync::Arc::new(StubProvider { response: response.to_string() }),
            model: "stub-model".to_string(),
            max_chars: 5_000,
            max_output_tokens: 2048,
            stream: false,
            ratio_store: RatioStore::new(ratio_dir.path()),
            poll_interval: Duration::from_secs(1),
        };

        let item = QueueItem {
            id: 1,
            book_id,
            chapter_number: Some(1),
            title: "Ch".to_string(),
            source: None,
            content: vec!["李四 walked on.".to_string()],
            metadata: None,
            position: 0,
            created_at: String::new(),
            book_title: "Test Book".to_string(),
        };

        let shutdown = AtomicBool::new(false);
        translate_and_archive(&ctx, &item, &shutdown).await.unwrap();

        // The conflicting entity was not added under "places"...
        let entities = store.load_entities(None).unwrap();
        assert!(!entities.get("places").is_some_and(|m| m.contains_key("李四")));
        // ...and the pre-existing "characters" row is untouched.
        assert_eq!(entities["characters"]["李四"].translation, "Li Si");
    }
}
