// Configuration for the translation pipeline
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config file (~/.config/lingualoom/config.toml)
// 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Application configuration (spec.md §6.3).
#[derive(Debug, Clone)]
pub struct Config {
    /// Default provider:model spec used for chapter translation, e.g. "oai:gpt-4.1".
    pub translation_model: String,

    /// Default provider:model spec used for translation-advice prompts.
    pub advice_model: String,

    /// Maximum source characters per chunk before splitting a chapter.
    pub max_chars: u32,

    /// Maximum output tokens requested per chat call.
    pub max_output_tokens: u32,

    /// Directory holding `lingualoom.db`, `token_ratios.json`, and an
    /// optional `providers.json` registry override.
    pub data_dir: PathBuf,

    /// Whether chapter translation requests a streamed response.
    pub stream: bool,

    /// Verbose debug logging (entity scan traces, prompt dumps).
    pub debug_mode: bool,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Logging settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileLogging {
    level: Option<String>,
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    translation_model: Option<String>,
    advice_model: Option<String>,
    max_chars: Option<u32>,
    max_output_tokens: Option<u32>,
    data_dir: Option<String>,
    stream: Option<bool>,
    debug_mode: Option<bool>,

    /// Optional [logging] section
    logging: Option<FileLogging>,
}

impl Config {
    /// Get the config file path: ~/.config/lingualoom/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("lingualoom").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        // Create parent directory
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        // Use Config::default().to_toml() as single source of truth
        let template = Self::default().to_toml();

        // Write config (ignore errors - config is optional)
        let _ = std::fs::write(&path, template);
    }

    /// Load file config if it exists
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                FileConfig::default()
            }),
            Err(_) => FileConfig::default(), // File doesn't exist, use defaults
        }
    }

    /// Serialize config to TOML string (single source of truth for format)
    pub fn to_toml(&self) -> String {
        format!(
            r#"# lingualoom configuration

# Default provider:model spec for chapter translation, e.g. "oai:gpt-4.1",
# "ds:deepseek-chat", "claude:claude-sonnet-4-20250514", "gem:gemini-2.5-pro".
translation_model = "{translation_model}"

# Default provider:model spec for translation-advice prompts.
advice_model = "{advice_model}"

# Maximum source characters per chunk before a chapter is split.
max_chars = {max_chars}

# Maximum output tokens requested per chat call.
max_output_tokens = {max_output_tokens}

# Directory holding lingualoom.db, token_ratios.json, and an optional
# providers.json registry override.
data_dir = "{data_dir}"

# Request a streamed response for chapter translation.
stream = {stream}

# Verbose debug logging (entity scan traces, prompt dumps).
debug_mode = {debug_mode}

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = "{log_level}"
"#,
            translation_model = self.translation_model,
            advice_model = self.advice_model,
            max_chars = self.max_chars,
            max_output_tokens = self.max_output_tokens,
            data_dir = self.data_dir.display(),
            stream = self.stream,
            debug_mode = self.debug_mode,
            log_level = self.logging.level,
        )
    }

    /// Save current configuration to file
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(path) = Self::config_path() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "Could not determine config path"));
        };

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, self.to_toml())
    }

    /// Load configuration: env vars > file > defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        let translation_model =
            std::env::var("LINGUALOOM_TRANSLATION_MODEL").ok().or(file.translation_model).unwrap_or_else(|| "oai:gpt-4.1".to_string());

        let advice_model = std::env::var("LINGUALOOM_ADVICE_MODEL").ok().or(file.advice_model).unwrap_or_else(|| translation_model.clone());

        let max_chars =
            std::env::var("LINGUALOOM_MAX_CHARS").ok().and_then(|v| v.parse().ok()).or(file.max_chars).unwrap_or(5_000);

        let max_output_tokens = std::env::var("LINGUALOOM_MAX_OUTPUT_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.max_output_tokens)
            .unwrap_or(8_192);

        let data_dir = std::env::var("LINGUALOOM_DATA_DIR")
            .ok()
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let stream = std::env::var("LINGUALOOM_STREAM")
            .ok()
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .or(file.stream)
            .unwrap_or(true);

        let debug_mode = std::env::var("LINGUALOOM_DEBUG")
            .ok()
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .or(file.debug_mode)
            .unwrap_or(false);

        let file_logging = file.logging.unwrap_or_default();
        let logging = LoggingConfig { level: file_logging.level.unwrap_or_else(|| "info".to_string()) };

        Self { translation_model, advice_model, max_chars, max_output_tokens, data_dir, stream, debug_mode, logging }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().map(|p| p.join(".local").join("share").join("lingualoom")).unwrap_or_else(|| PathBuf::from("./data"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            translation_model: "oai:gpt-4.1".to_string(),
            advice_model: "oai:gpt-4.1".to_string(),
            max_chars: 5_000,
            max_output_tokens: 8_192,
            data_dir: default_data_dir(),
            stream: true,
            debug_mode: false,
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_advice_model_falls_back_to_translation_model() {
        let config = Config::default();
        assert_eq!(config.advice_model, config.translation_model);
    }

    #[test]
    fn to_toml_round_trips_through_file_config() {
        let config = Config { max_chars: 4_200, ..Config::default() };
        let toml_str = config.to_toml();
        let parsed: FileConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.max_chars, Some(4_200));
    }
}
