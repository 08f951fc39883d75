//! Entity reconciliation (C7): chunk-merge conflict detection (Pass A),
//! caller-driven resolution (Pass B), a database-wide duplicate audit, and
//! LLM-assisted translation advice. Grounded on
//! `translation_engine.py::combine_json_chunks` (merge + Pass A),
//! `_check_for_translation_duplicates` (audit), and
//! `get_translation_options` (advice).

use crate::error::{PipelineError, ProviderError, StoreError};
use crate::provider::{ChatOutcome, ChatProvider, ChatRequest, Message, ResponseFormat, Role};
use crate::store::entities::{EntityData, EntityMap};
use crate::store::Store;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One chunk's (or the running merged result's) parsed JSON response,
/// the shape the default prompt (§6.1) requires of every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterChunk {
    pub title: String,
    pub chapter: i64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content: Vec<String>,
    #[serde(default)]
    pub entities: EntityMap,
}

/// How a conflict was detected during merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateKind {
    /// `untranslated` already exists in a different category.
    CrossCategory,
    /// `translation` already exists verbatim under a different key.
    TranslationCollision,
}

/// A conflict surfaced during chunk merge (Pass A), awaiting a caller
/// decision (Pass B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PotentialDuplicate {
    pub untranslated: String,
    pub translation: String,
    pub new_category: String,
    pub existing_category: String,
    pub existing_translation: String,
    pub kind: DuplicateKind,
}

/// Rewrite every entity still carrying the literal `"THIS CHAPTER"`
/// sentinel to the real chapter number. Entities untouched by a later
/// chunk's merge (including every entity in a single-chunk chapter)
/// would otherwise keep the sentinel forever, since the per-key update
/// below only fires when a later chunk re-reports the same key. Ported
/// from the unconditional boundary sweep `translate.py` runs before
/// persisting (mirrored in `ui.py`).
fn resolve_chapter_sentinel(entities: &mut EntityMap, current_chapter: i64) {
    let chapter = current_chapter.to_string();
    for category_map in entities.values_mut() {
        for data in category_map.values_mut() {
            if data.last_chapter.as_deref() == Some("THIS CHAPTER") {
                data.last_chapter = Some(chapter.clone());
            }
        }
    }
}

/// Merge `chunk` into `accumulated` (None on the first chunk), rewriting
/// every newly-touched entity's `last_chapter` to `current_chapter` and
/// collecting any cross-category / translation conflicts. Ported from
/// `combine_json_chunks`. The sentinel sweep runs on every call so a
/// single-chunk chapter (the first-chunk pass-through) and entities that
/// only ever appear in an earlier chunk both leave with a real chapter
/// number, never the literal placeholder.
pub fn merge_chunks(accumulated: Option<ChapterChunk>, chunk: ChapterChunk, current_chapter: i64) -> (ChapterChunk, Vec<PotentialDuplicate>) {
    let Some(mut acc) = accumulated else {
        let mut chunk = chunk;
        resolve_chapter_sentinel(&mut chunk.entities, current_chapter);
        return (chunk, Vec::new());
    };

    acc.content.extend(chunk.content);
    acc.summary = format!("{} {}", acc.summary, chunk.summary).trim().to_string();

    let mut duplicates = Vec::new();

    for (category, entries) in chunk.entities {
        for (key, data) in entries {
            let cross_conflict = acc
                .entities
                .iter()
                .find(|(other_category, map)| **other_category != category && map.contains_key(&key))
                .map(|(other_category, map)| (other_category.clone(), map[&key].translation.clone()));

            if let Some((existing_category, existing_translation)) = cross_conflict {
                tracing::warn!(key, category, existing_category, "duplicate entity found in both categories");
                duplicates.push(PotentialDuplicate {
                    untranslated: key.clone(),
                    translation: data.translation.clone(),
                    new_category: category.clone(),
                    existing_category,
                    existing_translation,
                    kind: DuplicateKind::CrossCategory,
                });
                continue;
            }

            let translation_conflict = acc.entities.iter().find_map(|(other_category, map)| {
                map.iter()
                    .find(|(other_key, other_data)| **other_key != key && other_data.translation == data.translation)
                    .map(|_| other_category.clone())
            });

            if let Some(existing_category) = translation_conflict {
                tracing::warn!(translation = %data.translation, "entity translation already exists under a different key");
                duplicates.push(PotentialDuplicate {
                    untranslated: key.clone(),
                    translation: data.translation.clone(),
                    new_category: category.clone(),
                    existing_category,
                    existing_translation: data.translation.clone(),
                    kind: DuplicateKind::TranslationCollision,
                });
                continue;
            }

            let category_map = acc.entities.entry(category.clone()).or_default();
            match category_map.get_mut(&key) {
                None => {
                    category_map.insert(
                        key,
                        EntityData {
                            translation: data.translation,
                            last_chapter: Some(current_chapter.to_string()),
                            incorrect_translation: data.incorrect_translation,
                            gender: data.gender,
                            book_id: None,
                        },
                    );
                }
                Some(existing) => {
                    existing.last_chapter = Some(current_chapter.to_string());
                }
            }
        }
    }

    resolve_chapter_sentinel(&mut acc.entities, current_chapter);
    (acc, duplicates)
}

/// Pass B: the four resolutions a caller may choose for a
/// `PotentialDuplicate`.
#[derive(Debug, Clone)]
pub enum ReconciliationDecision {
    KeepExisting,
    MoveToNewCategory,
    AllowDuplicateInBoth,
    EditManually { category: String, translation: String },
}

/// Apply a Pass B decision to both the entity store and the in-flight
/// merged chunk, so the two never diverge.
pub fn apply_decision(
    store: &Store,
    book_id: Option<i64>,
    duplicate: &PotentialDuplicate,
    decision: ReconciliationDecision,
    merged: &mut ChapterChunk,
) -> Result<(), StoreError> {
    match decision {
        ReconciliationDecision::KeepExisting => {
            if let Some(map) = merged.entities.get_mut(&duplicate.new_category) {
                map.remove(&duplicate.untranslated);
            }
        }
        ReconciliationDecision::MoveToNewCategory => {
            let _ = store.change_entity_category(&duplicate.existing_category, &duplicate.untranslated, &duplicate.new_category)?;
            if let Some(map) = merged.entities.get_mut(&duplicate.existing_category) {
                map.remove(&duplicate.untranslated);
            }
            insert_resolved(merged, &duplicate.new_category, &duplicate.untranslated, &duplicate.translation);
        }
        ReconciliationDecision::AllowDuplicateInBoth => {
            store.add_entity_allow_duplicate(&duplicate.new_category, &duplicate.untranslated, &duplicate.translation, book_id, None)?;
            insert_resolved(merged, &duplicate.new_category, &duplicate.untranslated, &duplicate.translation);
        }
        ReconciliationDecision::EditManually { category, translation } => {
            let _ = store.delete_entity(&duplicate.existing_category, &duplicate.untranslated)?;
            if duplicate.new_category != category {
                if let Some(map) = merged.entities.get_mut(&duplicate.new_category) {
                    map.remove(&duplicate.untranslated);
                }
            }
            store.add_entity_allow_duplicate(&category, &duplicate.untranslated, &translation, book_id, None)?;
            insert_resolved(merged, &category, &duplicate.untranslated, &translation);
        }
    }
    Ok(())
}

fn insert_resolved(merged: &mut ChapterChunk, category: &str, untranslated: &str, translation: &str) {
    merged.entities.entry(category.to_string()).or_default().insert(
        untranslated.to_string(),
        EntityData {
            translation: translation.to_string(),
            last_chapter: Some(merged.chapter.to_string()),
            incorrect_translation: None,
            gender: None,
            book_id: None,
        },
    );
}

/// One group of conflicting rows surfaced by `audit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub category: String,
    pub untranslated: String,
    pub translation: String,
    pub book_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditGroup {
    pub key: String,
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditReport {
    /// Same `untranslated` across more than one category within the same
    /// `book_id` scope: I2 violations that predate the invariant.
    pub cross_category_duplicates: Vec<AuditGroup>,
    /// Same `translation` shared by more than one distinct `untranslated`: I3 warnings.
    pub translation_collisions: Vec<AuditGroup>,
}

/// Scan the whole entity store for I2/I3 violations, grouped for
/// interactive resolution (delete-all-but-one, rename, ask-LLM, skip).
pub fn audit(store: &Store) -> Result<AuditReport, StoreError> {
    let conn = store.conn()?;
    let mut stmt = conn.prepare("SELECT category, untranslated, translation, book_id FROM entities")?;
    let rows: Vec<(String, String, String, Option<i64>)> =
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?.collect::<Result<_, _>>()?;
    drop(stmt);

    let mut by_scope: HashMap<(String, Option<i64>), Vec<AuditEntry>> = HashMap::new();
    for (category, untranslated, translation, book_id) in &rows {
        by_scope.entry((untranslated.clone(), *book_id)).or_default().push(AuditEntry {
            category: category.clone(),
            untranslated: untranslated.clone(),
            translation: translation.clone(),
            book_id: *book_id,
        });
    }
    let mut cross_category_duplicates = Vec::new();
    for ((untranslated, _book_id), entries) in by_scope {
        let mut categories: Vec<&str> = entries.iter().map(|e| e.category.as_str()).collect();
        categories.sort_unstable();
        categories.dedup();
        if categories.len() > 1 {
            cross_category_duplicates.push(AuditGroup { key: untranslated, entries });
        }
    }

    let mut by_translation: HashMap<String, Vec<AuditEntry>> = HashMap::new();
    for (category, untranslated, translation, book_id) in &rows {
        if translation.is_empty() {
            continue;
        }
        by_translation.entry(translation.clone()).or_default().push(AuditEntry {
            category: category.clone(),
            untranslated: untranslated.clone(),
            translation: translation.clone(),
            book_id: *book_id,
        });
    }
    let mut translation_collisions = Vec::new();
    for (translation, entries) in by_translation {
        let mut distinct: Vec<&str> = entries.iter().map(|e| e.untranslated.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() > 1 {
            translation_collisions.push(AuditGroup { key: translation, entries });
        }
    }

    Ok(AuditReport { cross_category_duplicates, translation_collisions })
}

/// An entity row nearby-translation lookup surfaces so the advice model
/// can avoid colliding with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingTranslation {
    pub translation: String,
    pub category: String,
    pub untranslated: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranslationAdvice {
    pub message: String,
    pub options: Vec<String>,
}

const ADVICE_SYSTEM_PROMPT: &str = "Your task is to offer translation options. The user text is a JSON node \
describing a translation you performed previously, which may include \"context\" (20-50 characters before \
and after the untranslated text). The user did not like the translation and wants to change it, so offer \
three alternatives, as well as a short message (fewer than 200 words) about the untranslated source \
characters and why you chose to translate them this way.

Include a very literal translation of each character in your message, but not necessarily in your \
alternatives, unless the translation is phonetic (a foreign word). Order the alternatives by your \
preference; use \"context\" to tune your advice if it is present.

One of the most common rejections is simply transliterating, so if you transliterated last time, do not \
do so again.

IMPORTANT: if \"existing_translations\" is present in the node, avoid suggesting translations identical or \
very similar to those, since that would cause confusion. Make your suggestions clearly distinct.

Respond with strict JSON: {\"message\": \"...\", \"options\": [\"option 1\", \"option 2\", \"option 3\"]}. \
Do not include the original translation among the three options.";

/// Return `padding` characters of context (by Unicode scalar, not byte
/// offset) before and after the first occurrence of `substring`. Ported
/// from `find_substring_with_context`.
pub fn find_substring_with_context(text_lines: &[String], substring: &str, padding: usize) -> Option<String> {
    if substring.is_empty() {
        return None;
    }
    let full_text: String = text_lines.join(" ");
    let chars: Vec<char> = full_text.chars().collect();
    let sub_chars: Vec<char> = substring.chars().collect();
    if sub_chars.is_empty() || sub_chars.len() > chars.len() {
        return None;
    }

    let match_start = chars.windows(sub_chars.len()).position(|window| window == sub_chars.as_slice())?;
    let start = match_start.saturating_sub(padding);
    let end = (match_start + sub_chars.len() + padding).min(chars.len());
    Some(chars[start..end].iter().collect())
}

/// Rows with the same leading character as `untranslated`, in a
/// different category with a different `untranslated`, used to warn the
/// advice model (and the caller) away from near-duplicate translations.
fn lookup_similar_rows(store: &Store, category: &str, untranslated: &str) -> Result<Vec<ExistingTranslation>, StoreError> {
    let conn = store.conn()?;
    let first_char = untranslated.chars().next().map(|c| c.to_string()).unwrap_or_default();
    let pattern = format!("{first_char}%");
    let mut stmt = conn.prepare(
        "SELECT translation, category, untranslated FROM entities
         WHERE untranslated != ?1 AND category != ?2 AND untranslated LIKE ?3",
    )?;
    let rows = stmt
        .query_map(params![untranslated, category, pattern], |row| {
            Ok(ExistingTranslation { translation: row.get(0)?, category: row.get(1)?, untranslated: row.get(2)? })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ask the advice model for translation alternatives for one entity,
/// grounded on `get_translation_options`. Non-streaming, strict JSON.
pub async fn get_translation_options(
    store: &Store,
    provider: &dyn ChatProvider,
    model: &str,
    category: &str,
    untranslated: &str,
    current_translation: &str,
    surrounding_text: &[String],
) -> Result<TranslationAdvice, PipelineError> {
    let context = find_substring_with_context(surrounding_text, untranslated, 35);
    let existing_translations = lookup_similar_rows(store, category, untranslated)?;
    let existing_duplicates: Vec<&ExistingTranslation> =
        existing_translations.iter().filter(|row| row.translation.eq_ignore_ascii_case(current_translation)).collect();

    let node = serde_json::json!({
        "category": category,
        "untranslated": untranslated,
        "translation": current_translation,
        "context": context,
        "existing_translations": existing_translations,
    });

    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![
            Message { role: Role::System, content: ADVICE_SYSTEM_PROMPT.to_string() },
            Message { role: Role::User, content: serde_json::to_string_pretty(&node).unwrap_or_default() },
        ],
        temperature: 1.0,
        top_p: 1.0,
        max_output_tokens: 1024,
        response_format: ResponseFormat::Json,
        stream: false,
    };

    let outcome = provider.chat(request).await.map_err(PipelineError::Provider)?;
    let content = match outcome {
        ChatOutcome::Completed(response) => response.content,
        ChatOutcome::Streaming(_) => {
            return Err(PipelineError::Provider(ProviderError::UnsupportedFeature(
                provider.provider_name().to_string(),
                "advice prompt is always requested non-streaming".to_string(),
            )))
        }
    };

    let value = provider.validate_json_response(&content).map_err(PipelineError::Provider)?;
    let mut advice: TranslationAdvice = serde_json::from_value(value).map_err(|e| {
        PipelineError::Provider(ProviderError::MalformedJson { provider: provider.provider_name().to_string(), detail: e.to_string() })
    })?;

    if !existing_duplicates.is_empty() {
        let mut warning = String::from("\n\nWARNING: The current translation conflicts with existing entities:");
        for duplicate in &existing_duplicates {
            warning.push_str(&format!(
                "\n- '{}' in '{}' (also translated as '{}')",
                duplicate.untranslated, duplicate.category, duplicate.translation
            ));
        }
        warning.push_str("\nConsider choosing a more distinctive translation to avoid confusion.");
        advice.message.push_str(&warning);
    }

    Ok(advice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_memory_store;

    fn chunk(chapter: i64, category: &str, key: &str, translation: &str) -> ChapterChunk {
        let mut entities = HashMap::new();
        let mut inner = HashMap::new();
        inner.insert(
            key.to_string(),
            EntityData { translation: translation.to_string(), last_chapter: Some("THIS CHAPTER".to_string()), incorrect_translation: None, gender: None, book_id: None },
        );
        entities.insert(category.to_string(), inner);
        ChapterChunk { title: "T".into(), chapter, summary: "s".into(), content: vec!["line".into()], entities }
    }

    #[test]
    fn first_chunk_resolves_this_chapter_sentinel_to_real_chapter_number() {
        let (merged, duplicates) = merge_chunks(None, chunk(1, "characters", "张三", "Zhang San"), 1);
        assert!(duplicates.is_empty());
        assert_eq!(merged.entities["characters"]["张三"].last_chapter.as_deref(), Some("1"));
    }

    #[test]
    fn entity_seen_only_in_first_chunk_still_loses_the_sentinel_after_a_later_chunk_merges() {
        let (first, _) = merge_chunks(None, chunk(3, "characters", "张三", "Zhang San"), 3);
        // Chunk 2 introduces an unrelated entity; 张三 is not repeated.
        let (merged, _) = merge_chunks(Some(first), chunk(3, "places", "长安", "Chang'an"), 3);
        assert_eq!(merged.entities["characters"]["张三"].last_chapter.as_deref(), Some("3"));
    }

    #[test]
    fn repeated_entity_in_same_category_updates_last_chapter_only() {
        let (first, _) = merge_chunks(None, chunk(1, "characters", "张三", "Zhang San"), 1);
        let (merged, duplicates) = merge_chunks(Some(first), chunk(2, "characters", "张三", "Zhang San"), 2);
        assert!(duplicates.is_empty());
        assert_eq!(merged.entities["characters"].len(), 1);
        assert_eq!(merged.entities["characters"]["张三"].last_chapter.as_deref(), Some("2"));
    }

    #[test]
    fn cross_category_duplicate_is_flagged_and_not_inserted() {
        let (first, _) = merge_chunks(None, chunk(1, "characters", "天海", "Tianhai"), 1);
        let (merged, duplicates) = merge_chunks(Some(first), chunk(1, "places", "天海", "Heavenly Sea"), 1);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].kind, DuplicateKind::CrossCategory);
        assert_eq!(duplicates[0].existing_category, "characters");
        assert!(!merged.entities.get("places").is_some_and(|m| m.contains_key("天海")));
    }

    #[test]
    fn translation_collision_under_different_key_is_flagged() {
        let (first, _) = merge_chunks(None, chunk(1, "characters", "张三", "Zhang San"), 1);
        let (merged, duplicates) = merge_chunks(Some(first), chunk(1, "characters", "李四", "Zhang San"), 1);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].kind, DuplicateKind::TranslationCollision);
        assert!(!merged.entities["characters"].contains_key("李四"));
    }

    #[test]
    fn apply_decision_move_to_new_category_updates_store_and_merged() {
        let store = open_memory_store();
        store.add_entity("characters", "天海", "Tianhai", None, None, None, None).unwrap();
        let mut merged = chunk(1, "places", "天海", "Heavenly Sea");
        let duplicate = PotentialDuplicate {
            untranslated: "天海".into(),
            translation: "Heavenly Sea".into(),
            new_category: "places".into(),
            existing_category: "characters".into(),
            existing_translation: "Tianhai".into(),
            kind: DuplicateKind::CrossCategory,
        };
        apply_decision(&store, None, &duplicate, ReconciliationDecision::MoveToNewCategory, &mut merged).unwrap();
        let entities = store.load_entities(None).unwrap();
        assert!(!entities["characters"].contains_key("天海"));
        assert!(entities["places"].contains_key("天海"));
    }

    #[test]
    fn audit_finds_cross_category_and_translation_duplicates() {
        let store = open_memory_store();
        store.add_entity_allow_duplicate("characters", "天海", "Tianhai", None, None).unwrap();
        store.add_entity_allow_duplicate("places", "天海", "Heavenly Sea", None, None).unwrap();
        store.add_entity_allow_duplicate("characters", "韩立", "Han Li", None, None).unwrap();
        store.add_entity_allow_duplicate("titles", "仙君", "Han Li", None, None).unwrap();

        let report = audit(&store).unwrap();
        assert_eq!(report.cross_category_duplicates.len(), 1);
        assert_eq!(report.cross_category_duplicates[0].key, "天海");
        assert_eq!(report.translation_collisions.len(), 1);
        assert_eq!(report.translation_collisions[0].key, "Han Li");
    }

    #[test]
    fn find_substring_with_context_is_char_boundary_safe() {
        let lines = vec!["他说道韩立是谁".to_string()];
        let context = find_substring_with_context(&lines, "韩立", 2).unwrap();
        assert!(context.contains("韩立"));
    }
}
