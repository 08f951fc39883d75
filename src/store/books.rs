//! Book and chapter persistence (C3), grounded on `database.py` lines
//! 116–714.

use super::Store;
use crate::error::StoreError;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub language: String,
    pub description: Option<String>,
    pub created_at: String,
    pub modified_at: String,
    pub source_language: String,
    pub target_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BookUpdate {
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub description: Option<String>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSummary {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub language: String,
    pub created_at: String,
    pub chapter_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub book_id: i64,
    pub chapter_number: i64,
    pub title: String,
    pub untranslated: Vec<String>,
    pub content: Vec<String>,
    pub summary: Option<String>,
    pub translation_date: Option<String>,
    pub model: Option<String>,
}

/// A chapter that mentions a given entity, returned by
/// `Store::find_chapters_using_entity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterUsage {
    pub chapter_id: i64,
    pub book_id: i64,
    pub chapter_number: i64,
    pub chapter_title: String,
    pub book_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub id: i64,
    pub chapter_number: i64,
    pub title: String,
    pub translation_date: Option<String>,
    pub model: Option<String>,
}

/// Serialize a line sequence as JSON, the same `json.dumps(..., ensure_ascii=False)`
/// convention `database.py` uses for `untranslated_content`/`translated_content`.
fn lines_to_json(lines: &[String]) -> String {
    serde_json::to_string(lines).expect("Vec<String> always serializes")
}

/// Deserialize a line sequence, recovering by splitting on `\n` if the
/// stored payload predates JSON serialization (mirrors the `except
/// json.JSONDecodeError: content.split('\n')` fallback in `get_chapter`).
fn lines_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|_| raw.split('\n').map(str::to_string).collect())
}

impl Store {
    /// Create a book, returning the existing id if the title already
    /// exists rather than erroring (matches `create_book`'s idempotent
    /// existing-title check).
    pub fn create_book(
        &self,
        title: &str,
        author: Option<&str>,
        language: &str,
        description: Option<&str>,
        source_language: &str,
        target_language: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;

        if let Some(id) = conn
            .query_row("SELECT id FROM books WHERE title = ?1", params![title], |row| row.get(0))
            .optional()?
        {
            return Ok(id);
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO books (title, author, language, description, created_date, modified_date, source_language, target_language)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)",
            params![title, author, language, description, now, source_language, target_language],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_book(&self, book_id: i64) -> Result<Option<Book>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, title, author, language, description, created_date, modified_date, source_language, target_language
             FROM books WHERE id = ?1",
            params![book_id],
            |row| {
                Ok(Book {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    author: row.get(2)?,
                    language: row.get(3)?,
                    description: row.get(4)?,
                    created_at: row.get(5)?,
                    modified_at: row.get(6)?,
                    source_language: row.get(7)?,
                    target_language: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn get_book_by_title(&self, title: &str) -> Result<Option<Book>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, title, author, language, description, created_date, modified_date, source_language, target_language
             FROM books WHERE title = ?1",
            params![title],
            |row| {
                Ok(Book {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    author: row.get(2)?,
                    language: row.get(3)?,
                    description: row.get(4)?,
                    created_at: row.get(5)?,
                    modified_at: row.get(6)?,
                    source_language: row.get(7)?,
                    target_language: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn update_book(&self, book_id: i64, update: &BookUpdate) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if conn
            .query_row("SELECT 1 FROM books WHERE id = ?1", params![book_id], |_| Ok(()))
            .optional()?
            .is_none()
        {
            return Err(StoreError::BookNotFound(book_id));
        }

        let mut set_clause = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        macro_rules! push_field {
            ($field:expr, $name:literal) => {
                if let Some(value) = $field.clone() {
                    set_clause.push(concat!($name, " = ?"));
                    values.push(Box::new(value));
                }
            };
        }
        push_field!(update.title, "title");
        push_field!(update.author, "author");
        push_field!(update.language, "language");
        push_field!(update.description, "description");
        push_field!(update.source_language, "source_language");
        push_field!(update.target_language, "target_language");

        set_clause.push("modified_date = ?");
        values.push(Box::new(Utc::now().to_rfc3339()));
        values.push(Box::new(book_id));

        let sql = format!("UPDATE books SET {} WHERE id = ?", set_clause.join(", "));
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, param_refs.as_slice())?;
        Ok(())
    }

    pub fn list_books(&self) -> Result<Vec<BookSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, author, language, created_date,
                    (SELECT COUNT(*) FROM chapters WHERE book_id = books.id)
             FROM books ORDER BY title",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BookSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    author: row.get(2)?,
                    language: row.get(3)?,
                    created_at: row.get(4)?,
                    chapter_count: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a book and cascade to its chapters (FK `ON DELETE CASCADE`)
    /// and its book-scoped entities (not covered by the FK, deleted
    /// explicitly as in `delete_book`).
    pub fn delete_book(&self, book_id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM books WHERE id = ?1", params![book_id])?;
        if deleted == 0 {
            return Err(StoreError::BookNotFound(book_id));
        }
        conn.execute("DELETE FROM entities WHERE book_id = ?1", params![book_id])?;
        Ok(())
    }

    pub fn get_book_prompt_template(&self, book_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let template: Option<String> = conn
            .query_row("SELECT prompt_template FROM books WHERE id = ?1", params![book_id], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(template)
    }

    /// Set a book's custom prompt template. The caller (prompt composer)
    /// validates that `{{ENTITIES_JSON}}` is present before calling this;
    /// the store itself only persists.
    pub fn set_book_prompt_template(&self, book_id: i64, prompt_template: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE books SET prompt_template = ?1 WHERE id = ?2",
            params![prompt_template, book_id],
        )?;
        if updated == 0 {
            return Err(StoreError::BookNotFound(book_id));
        }
        Ok(())
    }

    /// Upsert a chapter by `(book_id, chapter_number)`, bumping the book's
    /// `modified_date` either way.
    pub fn save_chapter(
        &self,
        book_id: i64,
        chapter_number: i64,
        title: &str,
        untranslated_content: &[String],
        translated_content: &[String],
        summary: Option<&str>,
        translation_model: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        if conn
            .query_row("SELECT 1 FROM books WHERE id = ?1", params![book_id], |_| Ok(()))
            .optional()?
            .is_none()
        {
            return Err(StoreError::BookNotFound(book_id));
        }

        let untranslated_json = lines_to_json(untranslated_content);
        let translated_json = lines_to_json(translated_content);
        let now = Utc::now().to_rfc3339();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM chapters WHERE book_id = ?1 AND chapter_number = ?2",
                params![book_id, chapter_number],
                |row| row.get(0),
            )
            .optional()?;

        let chapter_id = if let Some(chapter_id) = existing {
            conn.execute(
                "UPDATE chapters SET title = ?1, untranslated_content = ?2, translated_content = ?3,
                 summary = ?4, translation_date = ?5, translation_model = ?6 WHERE id = ?7",
                params![title, untranslated_json, translated_json, summary, now, translation_model, chapter_id],
            )?;
            chapter_id
        } else {
            conn.execute(
                "INSERT INTO chapters (book_id, chapter_number, title, untranslated_content,
                 translated_content, summary, translation_date, translation_model)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![book_id, chapter_number, title, untranslated_json, translated_json, summary, now, translation_model],
            )?;
            conn.last_insert_rowid()
        };

        conn.execute("UPDATE books SET modified_date = ?1 WHERE id = ?2", params![now, book_id])?;
        Ok(chapter_id)
    }

    pub fn get_chapter_by_id(&self, chapter_id: i64) -> Result<Option<Chapter>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, book_id, chapter_number, title, untranslated_content, translated_content,
                    summary, translation_date, translation_model
             FROM chapters WHERE id = ?1",
            params![chapter_id],
            row_to_chapter,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn get_chapter(&self, book_id: i64, chapter_number: i64) -> Result<Option<Chapter>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, book_id, chapter_number, title, untranslated_content, translated_content,
                    summary, translation_date, translation_model
             FROM chapters WHERE book_id = ?1 AND chapter_number = ?2",
            params![book_id, chapter_number],
            row_to_chapter,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_chapters(&self, book_id: i64) -> Result<Vec<ChapterSummary>, StoreError> {
        if self.get_book(book_id)?.is_none() {
            return Err(StoreError::BookNotFound(book_id));
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chapter_number, title, translation_date, translation_model
             FROM chapters WHERE book_id = ?1 ORDER BY chapter_number",
        )?;
        let rows = stmt
            .query_map(params![book_id], |row| {
                Ok(ChapterSummary {
                    id: row.get(0)?,
                    chapter_number: row.get(1)?,
                    title: row.get(2)?,
                    translation_date: row.get(3)?,
                    model: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_chapter(&self, book_id: i64, chapter_number: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM chapters WHERE book_id = ?1 AND chapter_number = ?2",
            params![book_id, chapter_number],
        )?;
        if deleted == 0 {
            return Err(StoreError::ChapterNotFound { book_id, chapter_number });
        }
        conn.execute(
            "UPDATE books SET modified_date = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), book_id],
        )?;
        Ok(())
    }
}

fn row_to_chapter(row: &rusqlite::Row) -> rusqlite::Result<Chapter> {
    let untranslated_raw: String = row.get(4)?;
    let translated_raw: String = row.get(5)?;
    Ok(Chapter {
        id: row.get(0)?,
        book_id: row.get(1)?,
        chapter_number: row.get(2)?,
        title: row.get(3)?,
        untranslated: lines_from_json(&untranslated_raw),
        content: lines_from_json(&translated_raw),
        summary: row.get(6)?,
        translation_date: row.get(7)?,
        model: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::open_memory_store;

    fn lines(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn create_book_is_idempotent_on_title() {
        let store = open_memory_store();
        let id1 = store.create_book("Reverend Insanity", None, "en", None, "zh", "en").unwrap();
        let id2 = store.create_book("Reverend Insanity", None, "en", None, "zh", "en").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn save_chapter_upserts_by_book_and_number() {
        let store = open_memory_store();
        let book_id = store.create_book("Book", None, "en", None, "zh", "en").unwrap();

        let id1 = store
            .save_chapter(book_id, 1, "Ch 1", &lines(&["a", "b"]), &lines(&["A", "B"]), None, "oai:gpt-4.1")
            .unwrap();
        let id2 = store
            .save_chapter(book_id, 1, "Ch 1 revised", &lines(&["a", "b", "c"]), &lines(&["A", "B", "C"]), None, "oai:gpt-4.1")
            .unwrap();
        assert_eq!(id1, id2);

        let chapter = store.get_chapter(book_id, 1).unwrap().unwrap();
        assert_eq!(chapter.title, "Ch 1 revised");
        assert_eq!(chapter.content, lines(&["A", "B", "C"]));
    }

    #[test]
    fn delete_book_cascades_chapters_and_entities() {
        let store = open_memory_store();
        let book_id = store.create_book("Book", None, "en", None, "zh", "en").unwrap();
        store
            .save_chapter(book_id, 1, "Ch 1", &lines(&["a"]), &lines(&["A"]), None, "oai:gpt-4.1")
            .unwrap();
        store.add_entity("characters", "韩立", "Han Li", Some(book_id), None, None, None).unwrap();

        store.delete_book(book_id).unwrap();

        assert!(store.get_book(book_id).unwrap().is_none());
        assert!(store.list_chapters(book_id).is_err());
    }
}
