//! Pipeline Configuration
//!
//! Declarative feed registry plus global knobs. Loaded from JSON at startup;
//! the scheduler accepts a replacement config at runtime via `apply_config`.

use crate::Severity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// A registered feed source. Immutable once registered except for the
/// interval and enabled flag, which a config reload may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
    /// Polling cadence, independent per source
    pub interval_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub feeds: Vec<FeedSource>,

    /// Maximum concurrently in-flight feed fetches
    pub fetch_pool_size: usize,
    /// Maximum concurrently in-flight LLM analyses
    pub analysis_pool_size: usize,

    pub fetch_timeout_secs: u64,
    pub analysis_timeout_secs: u64,

    pub max_fetch_retries: u32,
    pub max_analysis_retries: u32,
    /// Base delay for exponential fetch backoff
    pub backoff_base_ms: u64,

    /// Document body is truncated to this many characters before analysis
    pub max_input_chars: usize,
    pub max_tokens: u32,

    pub ollama_url: String,
    pub ollama_model: String,

    /// Records at or above this tier raise alerts
    pub alert_min_severity: Severity,

    /// Cadence of the re-analysis pass over fallback records; 0 disables it
    pub reanalyze_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feeds: vec![
                FeedSource {
                    name: "Krebs on Security".to_string(),
                    url: "https://krebsonsecurity.com/feed/".to_string(),
                    category: "news".to_string(),
                    interval_secs: 600,
                    enabled: true,
                },
                FeedSource {
                    name: "SANS ISC".to_string(),
                    url: "https://isc.sans.edu/rssfeed.xml".to_string(),
                    category: "advisories".to_string(),
                    interval_secs: 900,
                    enabled: true,
                },
                FeedSource {
                    name: "Schneier on Security".to_string(),
                    url: "https://www.schneier.com/feed/".to_string(),
                    category: "news".to_string(),
                    interval_secs: 1200,
                    enabled: true,
                },
            ],
            fetch_pool_size: 4,
            analysis_pool_size: 2,
            fetch_timeout_secs: 30,
            analysis_timeout_secs: 60,
            max_fetch_retries: 3,
            max_analysis_retries: 2,
            backoff_base_ms: 500,
            max_input_chars: 1000,
            max_tokens: 1000,
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "tinyllama".to_string(),
            alert_min_severity: Severity::High,
            reanalyze_interval_secs: 300,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PipelineConfig {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// defaults; a missing or unreadable file is an error the caller decides
    /// how to handle (the binary treats it as fatal at startup).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_seed_feeds() {
        let config = PipelineConfig::default();
        assert_eq!(config.feeds.len(), 3);
        assert!(config.feeds.iter().all(|f| f.enabled));
        assert_eq!(config.alert_min_severity, Severity::High);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "fetch_pool_size": 8,
            "feeds": [
                {"name": "Test", "url": "https://example.org/feed", "interval_secs": 60}
            ]
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.fetch_pool_size, 8);
        assert_eq!(config.feeds.len(), 1);
        assert!(config.feeds[0].enabled);
        assert_eq!(config.analysis_pool_size, 2);
        assert_eq!(config.ollama_model, "tinyllama");
    }
}
