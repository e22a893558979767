use std::time::Duration;

use anyhow::{bail, Context};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_ASPECT_RATIO: &str = "16:9";
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Configuration from environment
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub gemini: GeminiConfig,
    /// Maximum history entries kept per session, `None` for unbounded.
    pub history_limit: Option<usize>,
}

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub aspect_ratio: String,
    pub timeout: Duration,
}

// Keeps the key out of logs.
impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("aspect_ratio", &self.aspect_ratio)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_IMAGE_MODEL.to_string(),
            aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!("GEMINI_API_KEY must be set");
        }

        let timeout_secs: u64 = match std::env::var("GEMINI_TIMEOUT_SECS") {
            Ok(v) => v.parse().context("GEMINI_TIMEOUT_SECS must be a number of seconds")?,
            Err(_) => 120,
        };

        let history_limit = match std::env::var("HISTORY_LIMIT") {
            Ok(v) => v.parse::<usize>().context("HISTORY_LIMIT must be a non-negative integer")?,
            Err(_) => DEFAULT_HISTORY_LIMIT,
        };

        let mut gemini = GeminiConfig::new(api_key);
        if let Ok(base_url) = std::env::var("GEMINI_API_BASE") {
            gemini.base_url = base_url;
        }
        if let Ok(model) = std::env::var("GEMINI_IMAGE_MODEL") {
            gemini.model = model;
        }
        if let Ok(aspect_ratio) = std::env::var("IMAGE_ASPECT_RATIO") {
            gemini.aspect_ratio = aspect_ratio;
        }
        gemini.timeout = Duration::from_secs(timeout_secs);

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            gemini,
            history_limit: (history_limit > 0).then_some(history_limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_api_key() {
        let cfg = GeminiConfig::new("super-secret-key");
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("super-secret-key"));
        assert!(rendered.contains(DEFAULT_IMAGE_MODEL));
    }
}
