//! Entity glossary persistence (C2), grounded on `database.py` lines
//! 1087–1872 (the book-scoped revision of the original `entities.py`).

use super::Store;
use crate::error::StoreError;
use itertools::Itertools as _;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;

/// Normalize text to Unicode NFC for consistent comparison, matching
/// `database.py::_normalize_text`.
pub fn normalize(text: &str) -> String {
    text.nfc().collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityData {
    pub translation: String,
    pub last_chapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incorrect_translation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book_id: Option<i64>,
}

/// Result of attempting `add_entity`: either the row was written, or it
/// collides with an existing row in a different category for the same
/// `book_id` scope (I2).
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Added,
    ConflictCategory(String),
}

/// `category -> untranslated -> data`, the shape `_load_entities` and
/// `get_all_entities_for_review` both return.
pub type EntityMap = HashMap<String, HashMap<String, EntityData>>;

/// Outcome of `change_entity_category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    NotFound,
    AlreadyInTarget,
}

fn empty_entity_map() -> EntityMap {
    super::Category::ALL
        .iter()
        .map(|c| (c.as_str().to_string(), HashMap::new()))
        .collect()
}

impl Store {
    /// Load the full glossary, optionally scoped to a book plus all
    /// global (book_id IS NULL) entities — matches `_load_entities`.
    pub fn load_entities(&self, book_id: Option<i64>) -> Result<EntityMap, StoreError> {
        let conn = self.conn()?;
        let mut entities = empty_entity_map();

        let mut stmt;
        let mut rows_iter;
        if let Some(book_id) = book_id {
            stmt = conn.prepare(
                "SELECT category, untranslated, translation, last_chapter, incorrect_translation, gender, book_id
                 FROM entities WHERE book_id = ?1 OR book_id IS NULL",
            )?;
            rows_iter = stmt.query(params![book_id])?;
        } else {
            stmt = conn.prepare(
                "SELECT category, untranslated, translation, last_chapter, incorrect_translation, gender, book_id
                 FROM entities",
            )?;
            rows_iter = stmt.query([])?;
        }

        while let Some(row) = rows_iter.next()? {
            let category: String = row.get(0)?;
            let untranslated: String = row.get(1)?;
            let data = EntityData {
                translation: row.get(2)?,
                last_chapter: row.get(3)?,
                incorrect_translation: row.get(4)?,
                gender: row.get(5)?,
                book_id: row.get(6)?,
            };
            entities.entry(category).or_default().insert(untranslated, data);
        }

        Ok(entities)
    }

    /// Same shape as `load_entities` but annotates each entity with its
    /// own category (review-UI convenience) and supports filtering by
    /// category too, matching `get_all_entities_for_review`.
    pub fn entities_for_review(&self, book_id: Option<i64>, category: Option<&str>) -> Result<EntityMap, StoreError> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT category, untranslated, translation, last_chapter, incorrect_translation, gender, book_id
             FROM entities WHERE 1=1",
        );
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(book_id) = book_id {
            sql.push_str(" AND (book_id = ? OR book_id IS NULL)");
            bound.push(Box::new(book_id));
        }
        if let Some(category) = category {
            sql.push_str(" AND category = ?");
            bound.push(Box::new(category.to_string()));
        }
        sql.push_str(" ORDER BY category, untranslated");

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|v| v.as_ref()).collect();
        let mut entities = empty_entity_map();
        let mut rows = stmt.query(param_refs.as_slice())?;
        while let Some(row) = rows.next()? {
            let category: String = row.get(0)?;
            let untranslated: String = row.get(1)?;
            let data = EntityData {
                translation: row.get(2)?,
                last_chapter: row.get(3)?,
                incorrect_translation: row.get(4)?,
                gender: row.get(5)?,
                book_id: row.get(6)?,
            };
            entities.entry(category).or_default().insert(untranslated, data);
        }
        Ok(entities)
    }

    /// Add or replace an entity. Enforces I2: a row is rejected if
    /// `untranslated` already exists under a different category within the
    /// same `book_id` scope.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entity(
        &self,
        category: &str,
        untranslated: &str,
        translation: &str,
        book_id: Option<i64>,
        last_chapter: Option<&str>,
        incorrect_translation: Option<&str>,
        gender: Option<&str>,
    ) -> Result<AddOutcome, StoreError> {
        let untranslated = normalize(untranslated);
        let conn = self.conn()?;

        let conflicting: Option<String> = if let Some(book_id) = book_id {
            conn.query_row(
                "SELECT category FROM entities WHERE untranslated = ?1 AND category != ?2 AND book_id = ?3",
                params![untranslated, category, book_id],
                |row| row.get(0),
            )
            .optional()?
        } else {
            conn.query_row(
                "SELECT category FROM entities WHERE untranslated = ?1 AND category != ?2 AND book_id IS NULL",
                params![untranslated, category],
                |row| row.get(0),
            )
            .optional()?
        };

        if let Some(existing_category) = conflicting {
            return Ok(AddOutcome::ConflictCategory(existing_category));
        }

        conn.execute(
            "INSERT OR REPLACE INTO entities (category, untranslated, translation, book_id, last_chapter, incorrect_translation, gender)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![category, untranslated, translation, book_id, last_chapter, incorrect_translation, gender],
        )?;
        Ok(AddOutcome::Added)
    }

    /// Allow-duplicate escape hatch for Pass B (§4.7): inserts bypassing
    /// the I2 category-conflict check, used only when the caller has
    /// explicitly decided to permit a cross-category duplicate.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entity_allow_duplicate(
        &self,
        category: &str,
        untranslated: &str,
        translation: &str,
        book_id: Option<i64>,
        last_chapter: Option<&str>,
    ) -> Result<(), StoreError> {
        let untranslated = normalize(untranslated);
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO entities (category, untranslated, translation, book_id, last_chapter)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![category, untranslated, translation, book_id, last_chapter],
        )?;
        tracing::warn!(category, untranslated, "allowed cross-category duplicate entity by explicit decision");
        Ok(())
    }

    /// Partial update. If `book_id` is the only field changed, it moves
    /// the row's scope; otherwise it narrows the WHERE clause, matching
    /// `update_entity`'s dual role for `book_id`.
    pub fn update_entity(
        &self,
        category: &str,
        untranslated: &str,
        translation: Option<&str>,
        last_chapter: Option<&str>,
        incorrect_translation: Option<&str>,
        gender: Option<&str>,
        move_to_book_id: Option<Option<i64>>,
        selector_book_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let untranslated = normalize(untranslated);
        let conn = self.conn()?;

        let mut set_clause = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(translation) = translation {
            set_clause.push("translation = ?");
            values.push(Box::new(translation.to_string()));
        }
        if let Some(last_chapter) = last_chapter {
            set_clause.push("last_chapter = ?");
            values.push(Box::new(last_chapter.to_string()));
        }
        if let Some(incorrect_translation) = incorrect_translation {
            set_clause.push("incorrect_translation = ?");
            values.push(Box::new(incorrect_translation.to_string()));
        }
        if let Some(gender) = gender {
            set_clause.push("gender = ?");
            values.push(Box::new(gender.to_string()));
        }
        if let Some(new_book_id) = move_to_book_id {
            set_clause.push("book_id = ?");
            values.push(Box::new(new_book_id));
        }

        if set_clause.is_empty() {
            return Ok(false);
        }

        let mut where_clause = String::from("WHERE category = ? AND untranslated = ?");
        values.push(Box::new(category.to_string()));
        values.push(Box::new(untranslated.clone()));

        if move_to_book_id.is_none() {
            match selector_book_id {
                Some(book_id) => {
                    where_clause.push_str(" AND book_id = ?");
                    values.push(Box::new(book_id));
                }
                None => where_clause.push_str(" AND book_id IS NULL"),
            }
        }

        let sql = format!("UPDATE entities SET {} {}", set_clause.join(", "), where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let updated = conn.execute(&sql, param_refs.as_slice())?;
        Ok(updated > 0)
    }

    /// Idempotent delete; returns whether a row was removed.
    pub fn delete_entity(&self, category: &str, untranslated: &str) -> Result<bool, StoreError> {
        let untranslated = normalize(untranslated);
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM entities WHERE category = ?1 AND untranslated = ?2",
            params![category, untranslated],
        )?;
        Ok(deleted > 0)
    }

    pub fn change_entity_category(&self, old_category: &str, untranslated: &str, new_category: &str) -> Result<MoveOutcome, StoreError> {
        let untranslated = normalize(untranslated);
        let conn = self.conn()?;

        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM entities WHERE category = ?1 AND untranslated = ?2",
                params![old_category, untranslated],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Ok(MoveOutcome::NotFound);
        }

        let target_exists: bool = conn
            .query_row(
                "SELECT 1 FROM entities WHERE category = ?1 AND untranslated = ?2",
                params![new_category, untranslated],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if target_exists {
            return Ok(MoveOutcome::AlreadyInTarget);
        }

        conn.execute(
            "UPDATE entities SET category = ?1 WHERE category = ?2 AND untranslated = ?3",
            params![new_category, old_category, untranslated],
        )?;
        Ok(MoveOutcome::Moved)
    }

    /// Find an entity by its translation, used by collision detection.
    pub fn get_entity_by_translation(&self, translation: &str) -> Result<Option<(String, String, EntityData)>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT category, untranslated, last_chapter, incorrect_translation, gender
             FROM entities WHERE translation = ?1 LIMIT 1",
            params![translation],
            |row| {
                let category: String = row.get(0)?;
                let untranslated: String = row.get(1)?;
                Ok((
                    category,
                    untranslated,
                    EntityData {
                        translation: translation.to_string(),
                        last_chapter: row.get(2)?,
                        incorrect_translation: row.get(3)?,
                        gender: row.get(4)?,
                        book_id: None,
                    },
                ))
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn export_entities_json(&self, path: &std::path::Path) -> Result<(), StoreError> {
        let entities = self.load_entities(None)?;
        let json = serde_json::to_string_pretty(&entities)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn import_entities_json(&self, path: &std::path::Path) -> Result<usize, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        let data: EntityMap = serde_json::from_str(&raw)?;
        let conn = self.conn()?;
        let mut count = 0;
        for (category, items) in &data {
            for (untranslated, entity_data) in items {
                conn.execute(
                    "INSERT OR REPLACE INTO entities (category, untranslated, translation, last_chapter, incorrect_translation, gender)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        category,
                        untranslated,
                        entity_data.translation,
                        entity_data.last_chapter,
                        entity_data.incorrect_translation,
                        entity_data.gender
                    ],
                )?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Find chapters whose untranslated or translated content mentions
    /// `untranslated_text`, the reverse lookup `find_chapters_using_entity`
    /// provides for audit-report drill-down.
    pub fn find_chapters_using_entity(
        &self,
        untranslated_text: &str,
        book_id: Option<i64>,
    ) -> Result<Vec<super::books::ChapterUsage>, StoreError> {
        let conn = self.conn()?;
        let pattern = format!("%{untranslated_text}%");

        let mut stmt;
        let mut rows;
        if let Some(book_id) = book_id {
            stmt = conn.prepare(
                "SELECT c.id, c.book_id, c.chapter_number, c.title, b.title
                 FROM chapters c JOIN books b ON c.book_id = b.id
                 WHERE c.book_id = ?1 AND (c.untranslated_content LIKE ?2 OR c.translated_content LIKE ?2)
                 ORDER BY c.chapter_number",
            )?;
            rows = stmt.query(params![book_id, pattern])?;
        } else {
            stmt = conn.prepare(
                "SELECT c.id, c.book_id, c.chapter_number, c.title, b.title
                 FROM chapters c JOIN books b ON c.book_id = b.id
                 WHERE c.untranslated_content LIKE ?1 OR c.translated_content LIKE ?1
                 ORDER BY b.title, c.chapter_number",
            )?;
            rows = stmt.query(params![pattern])?;
        }

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(super::books::ChapterUsage {
                chapter_id: row.get(0)?,
                book_id: row.get(1)?,
                chapter_number: row.get(2)?,
                chapter_title: row.get(3)?,
                book_title: row.get(4)?,
            });
        }
        Ok(results)
    }
}

/// Given a block of text and a candidate entity map, return the submap
/// whose keys occur as substrings of the NFC-normalized text, refreshing
/// `last_chapter` on the supplied map as a side effect. Ported from
/// `entities_inside_text`.
pub fn scan_text(text_lines: &[String], known: &mut HashMap<String, EntityData>, current_chapter: &str) -> HashMap<String, EntityData> {
    let combined = normalize(&text_lines.join(" "));
    let mut found = HashMap::new();

    for (key, value) in known.iter_mut() {
        let key_normalized = normalize(key);
        if key_normalized.is_empty() {
            continue;
        }
        let occurrences = combined.matches(key_normalized.as_str()).count();
        if occurrences > 0 {
            found.insert(
                key.clone(),
                EntityData {
                    translation: value.translation.clone(),
                    last_chapter: Some(current_chapter.to_string()),
                    incorrect_translation: value.incorrect_translation.clone(),
                    gender: value.gender.clone(),
                    book_id: value.book_id,
                },
            );
            value.last_chapter = Some(current_chapter.to_string());
        }
    }

    found
}

/// Entities present in `new_data` absent entirely from `old_data`,
/// ported from `find_new_entities`.
pub fn find_new_entities(old_data: &EntityMap, new_data: &EntityMap) -> EntityMap {
    let mut newly_added: EntityMap = HashMap::new();
    for (category, new_items) in new_data {
        match old_data.get(category) {
            None => {
                newly_added.insert(category.clone(), new_items.clone());
            }
            Some(old_items) => {
                for (name, info) in new_items {
                    if !old_items.contains_key(name) {
                        newly_added.entry(category.clone()).or_default().insert(name.clone(), info.clone());
                    }
                }
            }
        }
    }
    newly_added
}

/// Merge `new_entities` into `old_entities`, category by category, with
/// `new_entities` winning on key collisions. Ported from
/// `combine_json_entities`.
pub fn combine_entity_maps(old_entities: EntityMap, new_entities: EntityMap) -> EntityMap {
    let mut result = old_entities;
    for category in super::Category::ALL {
        let merged = result.entry(category.as_str().to_string()).or_default();
        if let Some(new_category_map) = new_entities.get(category.as_str()) {
            for (key, data) in new_category_map {
                merged.insert(key.clone(), data.clone());
            }
        }
    }
    result
}

/// Case-preserving substitution: for every case-insensitive occurrence of
/// `incorrect` in each line, substitute `correct` word-by-word matching
/// the case class (ALL-CAPS / Title / lowercase / mixed) of the
/// corresponding old word. Word-count mismatches pad with empty strings.
/// Ported from `update_translated_text`.
pub fn rewrite_with_case_preservation(lines: &mut [String], incorrect: &str, correct: &str) {
    if incorrect.is_empty() {
        return;
    }
    let pattern = match regex::RegexBuilder::new(&regex::escape(incorrect)).case_insensitive(true).build() {
        Ok(p) => p,
        Err(_) => return,
    };

    for line in lines.iter_mut() {
        *line = pattern
            .replace_all(line, |caps: &regex::Captures| {
                let matched = &caps[0];
                let old_words: Vec<&str> = matched.split_whitespace().collect();
                let new_words: Vec<&str> = correct.split_whitespace().collect();

                old_words
                    .iter()
                    .zip_longest(new_words.iter())
                    .map(|pair| match pair {
                        itertools::EitherOrBoth::Both(old_w, new_w) => transform_word(old_w, new_w),
                        itertools::EitherOrBoth::Left(_old_w) => String::new(),
                        itertools::EitherOrBoth::Right(new_w) => new_w.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .to_string();
    }
}

fn transform_word(old_word: &str, new_word: &str) -> String {
    if old_word.chars().all(|c| !c.is_alphabetic() || c.is_uppercase()) && old_word.chars().any(|c| c.is_alphabetic()) {
        new_word.to_uppercase()
    } else if old_word.chars().next().is_some_and(char::is_uppercase)
        && old_word.chars().skip(1).all(|c| !c.is_alphabetic() || c.is_lowercase())
    {
        capitalize(new_word)
    } else if old_word.chars().all(|c| !c.is_alphabetic() || c.is_lowercase()) {
        new_word.to_lowercase()
    } else {
        new_word.to_string()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str().to_lowercase().as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_memory_store;

    #[test]
    fn add_entity_rejects_cross_category_duplicate() {
        let store = open_memory_store();
        store.add_entity("characters", "韩立", "Han Li", None, None, None, None).unwrap();
        let outcome = store.add_entity("places", "韩立", "Han Li Peak", None, None, None, None).unwrap();
        assert_eq!(outcome, AddOutcome::ConflictCategory("characters".to_string()));
    }

    #[test]
    fn delete_entity_is_idempotent() {
        let store = open_memory_store();
        store.add_entity("characters", "韩立", "Han Li", None, None, None, None).unwrap();
        assert!(store.delete_entity("characters", "韩立").unwrap());
        assert!(!store.delete_entity("characters", "韩立").unwrap());
    }

    #[test]
    fn scan_text_finds_occurrences_and_updates_last_chapter() {
        let mut known = HashMap::new();
        known.insert(
            "Han Li".to_string(),
            EntityData { translation: "Han Li".into(), last_chapter: Some("1".into()), incorrect_translation: None, gender: None, book_id: None },
        );
        let lines = vec!["Han Li walked on.".to_string()];
        let found = scan_text(&lines, &mut known, "2");
        assert!(found.contains_key("Han Li"));
        assert_eq!(known["Han Li"].last_chapter.as_deref(), Some("2"));
    }

    #[test]
    fn rewrite_preserves_case_class_word_by_word() {
        let mut lines = vec!["HAN LI fought. Han Li won.".to_string()];
        rewrite_with_case_preservation(&mut lines, "Han Li", "Song Qiu");
        assert_eq!(lines[0], "SONG QIU fought. Song Qiu won.");
    }

    #[test]
    fn change_entity_category_moves_row() {
        let store = open_memory_store();
        store.add_entity("characters", "韩立", "Han Li", None, None, None, None).unwrap();
        let outcome = store.change_entity_category("characters", "韩立", "titles").unwrap();
        assert_eq!(outcome, MoveOutcome::Moved);
        let entities = store.load_entities(None).unwrap();
        assert!(entities["titles"].contains_key("韩立"));
    }
}
