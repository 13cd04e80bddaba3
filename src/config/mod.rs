//! Configuration for filing-harvest

mod analysis;
mod fetch;
mod logging;
mod run;

pub use analysis::{ClassifierConfig, IncrementalConfig, ValidationConfig};
pub use fetch::{FetchSettings, RateLimitConfig, RetryConfig};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use run::{FeedConfig, RunConfig};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::content::KeywordClassifier;

/// Default user agent for all HTTP requests (feed and artifact fetches)
pub const DEFAULT_USER_AGENT: &str = "filing-harvest/0.1 (+https://github.com/filing-harvest)";

/// Main configuration for a harvest run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Output layout and run flags
    #[serde(default)]
    pub run: RunConfig,
    /// Feed source and record layout
    #[serde(default)]
    pub feed: FeedConfig,
    /// HTTP client
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Artifact validation
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Incremental runs
    #[serde(default)]
    pub incremental: IncrementalConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse without validating, so CLI overrides can be applied
    /// before [`Config::validate`] runs
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))
    }

    /// Serialize for `init`
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate all configuration fields.
    ///
    /// Collects every problem and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Run layout
        if self.run.output_dir.as_os_str().is_empty() {
            errors.push("output_dir must not be empty".to_string());
        }
        if self.run.artifact_dir.as_os_str().is_empty() {
            errors.push("artifact_dir must not be empty".to_string());
        }
        if self.run.base_name.trim().is_empty() {
            errors.push("base_name must not be empty".to_string());
        }
        if self.run.index_limit == Some(0) {
            errors.push("index_limit must be positive when set".to_string());
        }
        if let Some(token) = &self.run.date_token {
            if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                errors.push(format!("date_token '{}' must be alphanumeric", token));
            }
        }

        // Feed
        if self.feed.url.is_none() && self.feed.local_path.is_none() {
            errors.push("feed needs either url or local_path".to_string());
        }
        if let Some(u) = &self.feed.url {
            if url::Url::parse(u).is_err() {
                errors.push(format!("feed url '{}' is not a valid URL", u));
            }
        }
        for (name, value) in [
            ("record_element", &self.feed.record_element),
            ("id_attribute", &self.feed.id_attribute),
            ("name_attribute", &self.feed.name_attribute),
            ("date_attribute", &self.feed.date_attribute),
            ("reference_attribute", &self.feed.reference_attribute),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("feed {} must not be empty", name));
            }
        }
        if !self.feed.artifact_url_template.contains("{reference}") {
            errors.push("artifact_url_template must contain {reference}".to_string());
        }

        // Fetch
        if self.fetch.timeout_secs == 0 {
            errors.push("fetch timeout_secs must be positive".to_string());
        }
        if self.fetch.max_content_size == 0 {
            errors.push("max_content_size must be positive".to_string());
        }
        if self.fetch.connections_per_host == 0 {
            errors.push("connections_per_host must be positive".to_string());
        }

        // Rate limit
        if self.rate_limit.requests_per_window == 0 {
            errors.push("requests_per_window must be positive".to_string());
        }
        if self.rate_limit.window_ms == 0 {
            errors.push("window_ms must be positive".to_string());
        }

        // Validation
        if self.validation.min_size < 4 {
            errors.push("validation min_size must be at least 4 bytes".to_string());
        }

        // Classifier
        if let Err(e) = KeywordClassifier::new(&self.classifier.pattern_sets) {
            errors.push(format!("invalid classifier pattern: {}", e));
        }

        // Incremental
        if self.incremental.enabled && self.incremental.baseline_path.is_none() {
            errors.push("incremental runs need a baseline_path".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}
