//! Learned char→token ratio persistence, grounded on
//! `translation_engine.py`'s `token_ratios.json` read/write (lines
//! 420–563). Kept as a plain JSON file rather than a table in the
//! SQLite store, matching the original's choice to keep this out of the
//! database.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const RATIO_FILE: &str = "token_ratios.json";
const DEFAULT_AVERAGE: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatioHistory {
    pub ratios: Vec<f64>,
    pub average: f64,
    pub samples: usize,
}

impl Default for RatioHistory {
    fn default() -> Self {
        RatioHistory { ratios: Vec::new(), average: DEFAULT_AVERAGE, samples: 0 }
    }
}

/// Handle over `{data_dir}/token_ratios.json`.
pub struct RatioStore {
    path: PathBuf,
}

impl RatioStore {
    pub fn new(data_dir: &Path) -> Self {
        RatioStore { path: data_dir.join(RATIO_FILE) }
    }

    /// Current learned average, `1.0` if no history has been recorded
    /// yet (not `0.9` — spec default overrides the original's fallback).
    pub fn average(&self) -> Result<f64, StoreError> {
        Ok(self.load()?.average)
    }

    pub fn load(&self) -> Result<RatioHistory, StoreError> {
        if !self.path.exists() {
            return Ok(RatioHistory::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let history: RatioHistory = serde_json::from_str(&raw)?;
        Ok(history)
    }

    /// Append a new `output_tokens / input_chars` sample and recompute
    /// the mean, persisting the updated history.
    pub fn record(&self, total_input_chars: usize, total_output_tokens: usize) -> Result<RatioHistory, StoreError> {
        if total_input_chars == 0 {
            return self.load();
        }
        let mut history = self.load()?;
        let ratio = total_output_tokens as f64 / total_input_chars as f64;
        history.ratios.push(ratio);
        history.average = history.ratios.iter().sum::<f64>() / history.ratios.len() as f64;
        history.samples = history.ratios.len();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&history)?;
        std::fs::write(&self.path, json)?;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn average_defaults_to_one_when_missing() {
        let dir = tempdir().unwrap();
        let store = RatioStore::new(dir.path());
        assert_eq!(store.average().unwrap(), 1.0);
    }

    #[test]
    fn record_accumulates_mean_across_chapters() {
        let dir = tempdir().unwrap();
        let store = RatioStore::new(dir.path());

        let first = store.record(100, 50).unwrap();
        assert_eq!(first.samples, 1);
        assert!((first.average - 0.5).abs() < 1e-9);

        let second = store.record(200, 150).unwrap();
        assert_eq!(second.samples, 2);
        let expected = (0.5 + 0.75) / 2.0;
        assert!((second.average - expected).abs() < 1e-9);
    }

    #[test]
    fn record_is_noop_on_zero_input_chars() {
        let dir = tempdir().unwrap();
        let store = RatioStore::new(dir.path());
        let history = store.record(0, 10).unwrap();
        assert_eq!(history.samples, 0);
    }
}
