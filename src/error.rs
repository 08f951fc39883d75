//! Typed error taxonomy for the translation pipeline.
//!
//! Each module boundary returns one of these enums via `thiserror`; the CLI
//! binary collapses everything into `anyhow::Result` at the top.

use thiserror::Error;

/// Configuration loading/validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid provider spec '{0}': expected 'provider:model' or a registered alias")]
    InvalidProviderSpec(String),

    #[error("prompt template is missing the {{{{ENTITIES_JSON}}}} placeholder")]
    InvalidPromptTemplate,

    #[error("unknown provider '{0}' in registry")]
    UnknownProvider(String),

    #[error("environment variable '{0}' is not set (required for provider '{1}')")]
    MissingApiKey(String, String),
}

/// Persistence-layer failures (SQLite-backed stores and ratio/queue files).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entity already exists: category={category}, untranslated={untranslated:?}, book_id={book_id:?}")]
    DuplicateEntity {
        category: String,
        untranslated: String,
        book_id: Option<i64>,
    },

    #[error("chapter {chapter_number} not found for book {book_id}")]
    ChapterNotFound { book_id: i64, chapter_number: i64 },

    #[error("book {0} not found")]
    BookNotFound(i64),

    #[error("queue item {0} not found")]
    QueueItemNotFound(i64),
}

/// Errors raised by a `ChatProvider` while talking to a vendor API.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error talking to {provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("authentication failed for provider {0}")]
    Auth(String),

    #[error("rate limited by provider {provider}, retry after {retry_after_secs:?}s")]
    RateLimit {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    #[error("provider {provider} blocked the response for safety reasons: {reason}")]
    SafetyBlocked { provider: String, reason: String },

    #[error("provider {provider} truncated its output (finish_reason={finish_reason})")]
    TruncatedOutput {
        provider: String,
        finish_reason: String,
    },

    #[error("provider {provider} returned malformed JSON: {detail}")]
    MalformedJson { provider: String, detail: String },

    #[error("provider {0} returned an unexpected response shape: {1}")]
    UnexpectedShape(String, String),

    #[error("provider {0} does not support the requested feature: {1}")]
    UnsupportedFeature(String, String),
}

/// Top-level error for orchestration/reconciliation operations, unifying the
/// lower-level taxonomies behind a single type library callers can match on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("chapter text exceeded every retry budget without valid JSON")]
    ExhaustedRetries,

    #[error("translation cancelled")]
    Cancelled,
}
