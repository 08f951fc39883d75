//! System prompt composition (C5), grounded on
//! `translate.py::generate_system_prompt` / `translation_engine.py`'s
//! copy of the same routine.

use crate::error::ConfigError;
use crate::provider::ChatProvider;
use crate::store::entities::{scan_text, EntityData, EntityMap};
use std::collections::HashMap;

/// Placeholder substituted with the filtered, indented glossary JSON.
const ENTITIES_PLACEHOLDER: &str = "{{ENTITIES_JSON}}";

/// Categories the default template asks the model to populate. `creatures`
/// is a fully valid entity category (see `store::Category`) but, matching
/// the original's six hard-coded categories, is never requested by the
/// default prompt — only via manual/API entity management.
const PROMPT_CATEGORIES: [&str; 6] = ["characters", "places", "organizations", "abilities", "titles", "equipment"];

const DEFAULT_TEMPLATE: &str = r#"You are a professional literary translator working on a xianxia/xuanhuan novel.
Translate the following chapter from the source language into fluent, natural English.

Style guidance:
- Prefer meaningful translation over transliteration. Translate place names,
  technique names, and titles into their sense, not their sound — e.g.
  "practicing martial arts" for 打拳, never "boxing" or a bare pinyin
  transliteration, unless the term has no good English sense (in which case
  transliterate and keep it consistent across chapters).
- Never summarize or abridge the chapter's content. Every line of source
  text must be translated in full and appear in "content".
- Keep character voice and register consistent with earlier chapters using
  the glossary below.

Known entities so far (use these exact translations; do not invent new
translations for entities already listed here):

{{ENTITIES_JSON}}

Your response MUST be a single JSON object with exactly these keys:

{
  "title": string,
  "chapter": integer,
  "summary": string (75 words or fewer, summarizing the chapter itself, not its translation),
  "content": [ string, ... ],
  "entities": {
    "characters": { "<source text>": { "translation": string, "gender": "male"|"female"|"neither", "last_chapter": "THIS CHAPTER" }, ... },
    "places": { "<source text>": { "translation": string, "last_chapter": "THIS CHAPTER" }, ... },
    "organizations": { ... },
    "abilities": { ... },
    "titles": { ... },
    "equipment": { ... }
  }
}

All six entity categories must appear in "entities" even when you found
nothing for them — use an empty object `{}`, never omit the key. Only
include entities that are newly introduced or mentioned in this chapter;
set "last_chapter" to the literal string "THIS CHAPTER" for every entity you
report, never a number — the caller substitutes the real chapter number.

++++ Response Template Example
{
  "title": "The Beast Tide Arrives",
  "chapter": 12,
  "summary": "Han Li senses a disturbance at Fallen Cloud Sect's outer peaks and rushes to investigate, discovering a beast tide gathering at the border.",
  "content": [
    "Han Li stood at the edge of the outer peaks, his gaze fixed on the horizon.",
    "A low rumble rolled across the valley, and the birds scattered in alarm."
  ],
  "entities": {
    "characters": {
      "韩立": { "translation": "Han Li", "gender": "male", "last_chapter": "THIS CHAPTER" }
    },
    "places": {
      "落云宗": { "translation": "Fallen Cloud Sect", "last_chapter": "THIS CHAPTER" }
    },
    "organizations": {},
    "abilities": {},
    "titles": {},
    "equipment": {}
  }
}
++++ Response Template End
"#;

/// Ensure every default category key exists in `entities`, matching the
/// original's `entities.setdefault(category, {})` loop.
fn with_default_categories(entities: &EntityMap) -> EntityMap {
    let mut entities = entities.clone();
    for category in PROMPT_CATEGORIES {
        entities.entry(category.to_string()).or_default();
    }
    entities
}

/// Compose the system prompt for a chunk of chapter text: filter the
/// glossary to entries mentioned in the text, inject the result as JSON,
/// and strip the Gemini-incompatible example block when talking to a
/// Gemini adapter. `do_count` mirrors the original's debug-only counting
/// toggle (first pass vs. regeneration after a chunk merge); it has no
/// effect on the filtered result since the running occurrence counter the
/// original tracked is not part of this crate's schema.
pub fn compose_system_prompt(
    chapter_text: &[String],
    entities: &EntityMap,
    do_count: bool,
    book_template: Option<&str>,
    provider: &dyn ChatProvider,
) -> Result<String, ConfigError> {
    tracing::debug!(do_count, lines = chapter_text.len(), "composing system prompt");

    let entities = with_default_categories(entities);
    let mut filtered: EntityMap = HashMap::new();
    for category in PROMPT_CATEGORIES {
        let mut known = entities.get(category).cloned().unwrap_or_default();
        let found: HashMap<String, EntityData> = scan_text(chapter_text, &mut known, "THIS CHAPTER");
        filtered.insert(category.to_string(), found);
    }

    let entities_json = serde_json::to_string_pretty(&filtered).map_err(|_| ConfigError::InvalidPromptTemplate)?;

    let template = match book_template {
        Some(custom) => {
            validate_template(custom)?;
            custom.to_string()
        }
        None => DEFAULT_TEMPLATE.to_string(),
    };

    let mut prompt = template.replace(ENTITIES_PLACEHOLDER, &entities_json);

    if provider.provider_name().to_lowercase().contains("gemini") {
        prompt = strip_response_template_example(&prompt);
        tracing::debug!("removed JSON schema example block for Gemini provider");
    }

    Ok(prompt)
}

/// A custom per-book template must still carry the substitution point.
pub fn validate_template(template: &str) -> Result<(), ConfigError> {
    if template.contains(ENTITIES_PLACEHOLDER) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPromptTemplate)
    }
}

const RESPONSE_TEMPLATE_START: &str = "++++ Response Template Example";
const RESPONSE_TEMPLATE_END: &str = "++++ Response Template End";

/// Remove the block delimited by the two markers (inclusive), used to
/// avoid dueling schemas when the provider already enforces a
/// `responseSchema` (Gemini).
fn strip_response_template_example(prompt: &str) -> String {
    let Some(start) = prompt.find(RESPONSE_TEMPLATE_START) else {
        return prompt.to_string();
    };
    let Some(end_rel) = prompt[start..].find(RESPONSE_TEMPLATE_END) else {
        return prompt.to_string();
    };
    let end = start + end_rel + RESPONSE_TEMPLATE_END.len();

    let mut result = String::with_capacity(prompt.len());
    result.push_str(&prompt[..start]);
    result.push_str(&prompt[end..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Capabilities, ChatOutcome, ChatRequest};
    use async_trait::async_trait;

    struct StubProvider {
        name: &'static str,
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatOutcome, crate::error::ProviderError> {
            unimplemented!()
        }
        fn provider_name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
    }

    #[test]
    fn default_template_requires_all_six_categories() {
        for category in PROMPT_CATEGORIES {
            assert!(DEFAULT_TEMPLATE.contains(category), "missing category {category}");
        }
    }

    #[test]
    fn openai_provider_keeps_response_template_block() {
        let provider = StubProvider { name: "openai" };
        let prompt = compose_system_prompt(&[], &EntityMap::new(), true, None, &provider).unwrap();
        assert!(prompt.contains(RESPONSE_TEMPLATE_START));
        assert!(prompt.contains(RESPONSE_TEMPLATE_END));
    }

    #[test]
    fn gemini_provider_strips_response_template_block() {
        let provider = StubProvider { name: "gemini-2.5-pro" };
        let prompt = compose_system_prompt(&[], &EntityMap::new(), true, None, &provider).unwrap();
        assert!(!prompt.contains(RESPONSE_TEMPLATE_START));
        assert!(!prompt.contains(RESPONSE_TEMPLATE_END));
    }

    #[test]
    fn custom_template_without_placeholder_is_rejected() {
        assert!(validate_template("no placeholder here").is_err());
        assert!(validate_template("has {{ENTITIES_JSON}} here").is_ok());
    }

    #[test]
    fn entities_mentioned_in_text_are_filtered_into_prompt() {
        let mut known = HashMap::new();
        known.insert(
            "characters".to_string(),
            HashMap::from([(
                "韩立".to_string(),
                EntityData { translation: "Han Li".into(), last_chapter: Some("4".into()), incorrect_translation: None, gender: None, book_id: None },
            )]),
        );
        let provider = StubProvider { name: "openai" };
        let text = vec!["韩立 walked through the gate.".to_string()];
        let prompt = compose_system_prompt(&text, &known, true, None, &provider).unwrap();
        assert!(prompt.contains("Han Li"));
    }
}
