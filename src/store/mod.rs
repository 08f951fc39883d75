//! Persistent state: entities, books, chapters, and the translation queue.
//!
//! All four live in one SQLite database (`{data_dir}/lingualoom.db`), opened
//! through a pooled connection the way `pipeline/lifestats_query.rs` pools
//! read connections — except here the pool serves both reads and writes,
//! since this crate has no high-throughput event stream to justify a
//! dedicated writer thread. WAL mode plus a busy timeout let SQLite itself
//! serialize the rare concurrent write.

pub mod books;
pub mod entities;
pub mod queue;

use crate::error::StoreError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

/// One of the seven fixed entity categories (spec.md §3). `Creatures` is
/// accepted and enforced identically to the other six but is absent from
/// the default prompt template's JSON example and Gemini response schema,
/// matching the original's six hard-coded categories (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Characters,
    Places,
    Organizations,
    Abilities,
    Titles,
    Equipment,
    Creatures,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Characters,
        Category::Places,
        Category::Organizations,
        Category::Abilities,
        Category::Titles,
        Category::Equipment,
        Category::Creatures,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Characters => "characters",
            Category::Places => "places",
            Category::Organizations => "organizations",
            Category::Abilities => "abilities",
            Category::Titles => "titles",
            Category::Equipment => "equipment",
            Category::Creatures => "creatures",
        }
    }

    pub fn parse(s: &str) -> Option<Category> {
        Some(match s {
            "characters" => Category::Characters,
            "places" => Category::Places,
            "organizations" => Category::Organizations,
            "abilities" => Category::Abilities,
            "titles" => Category::Titles,
            "equipment" => Category::Equipment,
            "creatures" => Category::Creatures,
            _ => return None,
        })
    }
}

/// Shared pooled handle to the SQLite database backing entities, books,
/// chapters, and the queue.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (creating if absent) the database at `db_path`, apply schema
    /// migrations, and return a pooled handle.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;",
            )
        });
        let pool = Pool::builder().max_size(4).build(manager)?;

        {
            let conn = pool.get()?;
            init_schema(&conn)?;
        }

        if let Some(parent) = db_path.parent() {
            warn_on_legacy_queue_file(parent);
        }

        Ok(Self { pool })
    }

    /// Build a `Store` around an existing pool. Used by tests to share an
    /// in-memory database across multiple pooled connections.
    #[cfg(test)]
    pub(crate) fn from_pool(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }

    pub(crate) fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }
}

/// Check for a `queue.json` left behind by a pre-SQLite version of the
/// tool and log a warning without attempting to import it, matching
/// `database.py::_check_legacy_queue`.
fn warn_on_legacy_queue_file(data_dir: &Path) {
    let legacy_path = data_dir.join("queue.json");
    if legacy_path.exists() {
        tracing::warn!(
            path = %legacy_path.display(),
            "found a legacy queue.json from a pre-database version of this tool; \
             it will not be imported automatically"
        );
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE((SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'), 0)",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_schema_v1(conn)?;
    }

    Ok(())
}

/// Initial schema, grounded on `database.py::_initialize_database`'s four
/// CREATE TABLE statements.
fn apply_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS books (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            author TEXT,
            language TEXT DEFAULT 'en',
            description TEXT,
            created_date TEXT,
            modified_date TEXT,
            prompt_template TEXT,
            source_language TEXT DEFAULT 'zh',
            target_language TEXT DEFAULT 'en',
            UNIQUE(title)
        );

        CREATE TABLE IF NOT EXISTS chapters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL,
            chapter_number INTEGER NOT NULL,
            title TEXT NOT NULL,
            untranslated_content TEXT NOT NULL,
            translated_content TEXT NOT NULL,
            summary TEXT,
            translation_date TEXT,
            translation_model TEXT,
            UNIQUE(book_id, chapter_number),
            FOREIGN KEY(book_id) REFERENCES books(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_chapters_book_id ON chapters(book_id);
        CREATE INDEX IF NOT EXISTS idx_chapter_number ON chapters(chapter_number);

        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            untranslated TEXT NOT NULL,
            translation TEXT NOT NULL,
            last_chapter TEXT,
            incorrect_translation TEXT,
            gender TEXT,
            book_id INTEGER,
            UNIQUE(category, untranslated, book_id)
        );
        CREATE INDEX IF NOT EXISTS idx_category ON entities(category);
        CREATE INDEX IF NOT EXISTS idx_untranslated ON entities(untranslated);
        CREATE INDEX IF NOT EXISTS idx_entities_book_id ON entities(book_id);

        CREATE TABLE IF NOT EXISTS queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL,
            chapter_number INTEGER,
            title TEXT NOT NULL,
            source TEXT,
            content TEXT NOT NULL,
            metadata TEXT,
            position INTEGER NOT NULL,
            created_date TEXT NOT NULL,
            FOREIGN KEY(book_id) REFERENCES books(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_queue_book_id ON queue(book_id);
        CREATE INDEX IF NOT EXISTS idx_queue_position ON queue(position);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_position_unique ON queue(position);

        INSERT OR IGNORE INTO metadata (key, value) VALUES ('schema_version', '1');
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn open_memory_store() -> Store {
    let manager = SqliteConnectionManager::memory().with_init(|conn| {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
    });
    let pool = Pool::builder().max_size(1).build(manager).unwrap();
    {
        let conn = pool.get().unwrap();
        init_schema(&conn).unwrap();
    }
    Store::from_pool(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_str() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), Some(category));
        }
    }

    #[test]
    fn open_memory_store_applies_schema() {
        let store = open_memory_store();
        let conn = store.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='entities'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
