//! Persistent FIFO job queue (C4), grounded on `database.py` lines
//! 715–1085. Position assignment via `SELECT MAX(position)+1`,
//! decrement-on-remove, full recompaction on `clear`.

use super::Store;
use crate::error::StoreError;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub book_id: i64,
    pub chapter_number: Option<i64>,
    pub title: String,
    pub source: Option<String>,
    pub content: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub position: i64,
    pub created_at: String,
    pub book_title: String,
}

fn row_to_queue_item(row: &rusqlite::Row) -> rusqlite::Result<QueueItem> {
    let content_raw: String = row.get(5)?;
    let content: Vec<String> = serde_json::from_str(&content_raw).unwrap_or_else(|_| vec![content_raw]);
    let metadata_raw: Option<String> = row.get(6)?;
    let metadata = metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(QueueItem {
        id: row.get(0)?,
        book_id: row.get(1)?,
        chapter_number: row.get(2)?,
        title: row.get(3)?,
        source: row.get(4)?,
        content,
        metadata,
        position: row.get(7)?,
        created_at: row.get(8)?,
        book_title: row.get(9)?,
    })
}

const QUEUE_SELECT: &str = "SELECT q.id, q.book_id, q.chapter_number, q.title, q.source, q.content,
           q.metadata, q.position, q.created_date, b.title
    FROM queue q JOIN books b ON q.book_id = b.id";

impl Store {
    /// Append a job to the tail of the queue, atomically reading
    /// `MAX(position)+1` within the same connection.
    pub fn enqueue(
        &self,
        book_id: i64,
        title: &str,
        chapter_number: Option<i64>,
        content: &[String],
        source: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        if self.get_book(book_id)?.is_none() {
            return Err(StoreError::BookNotFound(book_id));
        }

        let max_position: Option<i64> = conn.query_row("SELECT MAX(position) FROM queue", [], |row| row.get(0))?;
        let next_position = max_position.map(|p| p + 1).unwrap_or(0);

        let content_json = serde_json::to_string(content)?;
        let metadata_json = metadata.map(|m| serde_json::to_string(m)).transpose()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO queue (book_id, chapter_number, title, source, content, metadata, position, created_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![book_id, chapter_number, title, source, content_json, metadata_json, next_position, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Return the item with the lowest position without removing it.
    pub fn dequeue_peek(&self, book_id: Option<i64>) -> Result<Option<QueueItem>, StoreError> {
        let conn = self.conn()?;
        let sql;
        let result = if let Some(book_id) = book_id {
            sql = format!("{QUEUE_SELECT} WHERE q.book_id = ?1 ORDER BY q.position ASC LIMIT 1");
            conn.query_row(&sql, params![book_id], row_to_queue_item).optional()?
        } else {
            sql = format!("{QUEUE_SELECT} ORDER BY q.position ASC LIMIT 1");
            conn.query_row(&sql, [], row_to_queue_item).optional()?
        };
        Ok(result)
    }

    /// Remove a queued item and decrement every higher position, keeping
    /// ordering contiguous.
    pub fn remove_from_queue(&self, queue_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed_position: Option<i64> = conn
            .query_row("SELECT position FROM queue WHERE id = ?1", params![queue_id], |row| row.get(0))
            .optional()?;

        let Some(removed_position) = removed_position else {
            return Ok(false);
        };

        conn.execute("DELETE FROM queue WHERE id = ?1", params![queue_id])?;
        conn.execute("UPDATE queue SET position = position - 1 WHERE position > ?1", params![removed_position])?;
        Ok(true)
    }

    pub fn list_queue(&self, book_id: Option<i64>) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.conn()?;
        let sql;
        let mut stmt;
        let rows = if let Some(book_id) = book_id {
            sql = format!("{QUEUE_SELECT} WHERE q.book_id = ?1 ORDER BY q.position ASC");
            stmt = conn.prepare(&sql)?;
            stmt.query_map(params![book_id], row_to_queue_item)?.collect::<Result<Vec<_>, _>>()?
        } else {
            sql = format!("{QUEUE_SELECT} ORDER BY q.position ASC");
            stmt = conn.prepare(&sql)?;
            stmt.query_map([], row_to_queue_item)?.collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    /// Delete all items (or all for a book) and recompact remaining
    /// positions to contiguous 0-based ordering.
    pub fn clear_queue(&self, book_id: Option<i64>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = if let Some(book_id) = book_id {
            let removed = conn.execute("DELETE FROM queue WHERE book_id = ?1", params![book_id])?;

            let mut stmt = conn.prepare("SELECT id FROM queue ORDER BY position ASC")?;
            let ids: Vec<i64> = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?;
            for (position, id) in ids.into_iter().enumerate() {
                conn.execute("UPDATE queue SET position = ?1 WHERE id = ?2", params![position as i64, id])?;
            }
            removed
        } else {
            conn.execute("DELETE FROM queue", [])?
        };
        Ok(removed)
    }

    pub fn queue_count(&self, book_id: Option<i64>) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count = if let Some(book_id) = book_id {
            conn.query_row("SELECT COUNT(*) FROM queue WHERE book_id = ?1", params![book_id], |row| row.get(0))?
        } else {
            conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?
        };
        Ok(count)
    }

    /// Used for idempotent ingestion: has this chapter already been
    /// queued for this book?
    pub fn has_duplicate_in_queue(&self, book_id: i64, chapter_number: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM queue WHERE book_id = ?1 AND chapter_number = ?2",
                params![book_id, chapter_number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::super::open_memory_store;

    #[test]
    fn fifo_order_and_position_compaction_on_remove() {
        let store = open_memory_store();
        let book_id = store.create_book("Book", None, "en", None, "zh", "en").unwrap();

        let id_a = store.enqueue(book_id, "Ch 1", Some(1), &["line".to_string()], None, None).unwrap();
        let id_b = store.enqueue(book_id, "Ch 2", Some(2), &["line".to_string()], None, None).unwrap();
        let id_c = store.enqueue(book_id, "Ch 3", Some(3), &["line".to_string()], None, None).unwrap();

        let peeked = store.dequeue_peek(None).unwrap().unwrap();
        assert_eq!(peeked.id, id_a);

        assert!(store.remove_from_queue(id_a).unwrap());

        let remaining = store.list_queue(None).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, id_b);
        assert_eq!(remaining[0].position, 0);
        assert_eq!(remaining[1].id, id_c);
        assert_eq!(remaining[1].position, 1);
    }

    #[test]
    fn clear_queue_recompacts_remaining_book_positions() {
        let store = open_memory_store();
        let book_a = store.create_book("A", None, "en", None, "zh", "en").unwrap();
        let book_b = store.create_book("B", None, "en", None, "zh", "en").unwrap();

        store.enqueue(book_a, "A1", Some(1), &["x".to_string()], None, None).unwrap();
        store.enqueue(book_b, "B1", Some(1), &["x".to_string()], None, None).unwrap();
        store.enqueue(book_b, "B2", Some(2), &["x".to_string()], None, None).unwrap();

        let removed = store.clear_queue(Some(book_b)).unwrap();
        assert_eq!(removed, 2);

        let remaining = store.list_queue(None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].book_id, book_a);
    }

    #[test]
    fn has_duplicate_in_queue_detects_existing_chapter() {
        let store = open_memory_store();
        let book_id = store.create_book("Book", None, "en", None, "zh", "en").unwrap();
        store.enqueue(book_id, "Ch 1", Some(1), &["x".to_string()], None, None).unwrap();
        assert!(store.has_duplicate_in_queue(book_id, 1).unwrap());
        assert!(!store.has_duplicate_in_queue(book_id, 2).unwrap());
    }
}
