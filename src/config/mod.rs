use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration loaded from a TOML file
///
/// Every section and field is optional; anything left out takes its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub analysis: AnalysisConfig,
    pub ingest: IngestConfig,
}

/// Aggregate store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Upper bound for any single store call
    pub timeout_ms: u64,
    /// Samples retained per (version, fingerprint)
    pub sample_limit: usize,
    /// Counters and samples older than this are pruned
    pub retention_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("error-monitor.db"),
            timeout_ms: 2000,
            sample_limit: 20,
            retention_hours: 24 * 7,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(i64::MAX as u64) as i64)
    }
}

/// Deviation analysis thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Rate ratio above which a known error counts as elevated
    pub rate_ratio_threshold: f64,
    /// Fewest candidate occurrences needed to flag an elevated rate
    pub min_occurrences: u64,
    /// Floor for the baseline rate, in occurrences per hour
    pub epsilon: f64,
    /// Report normal fingerprints as well as new and elevated ones
    pub include_normal: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            rate_ratio_threshold: 3.0,
            min_occurrences: 5,
            epsilon: 0.01,
            include_normal: false,
        }
    }
}

/// Ingestion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// How long a delivered record is remembered for duplicate detection
    pub dedup_ttl_seconds: u64,
    /// Most dedup keys remembered at once
    pub dedup_capacity: usize,
    /// Resource prefixes whose errors are ignored
    pub uri_blocklist: Vec<String>,
    /// Batch rows whose version does not match are skipped
    pub batch_version_pattern: Option<String>,
    /// Timestamps further in the future than this are clamped to now
    pub max_clock_skew_seconds: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_seconds: 900,
            dedup_capacity: 100_000,
            uri_blocklist: Vec::new(),
            batch_version_pattern: None,
            max_clock_skew_seconds: 300,
        }
    }
}

impl IngestConfig {
    pub fn dedup_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_ttl_seconds.min(i64::MAX as u64) as i64)
    }

    pub fn max_clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_clock_skew_seconds.min(i64::MAX as u64) as i64)
    }

    /// Compile the batch version pattern, if one is configured
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the pattern is not a valid regex.
    pub fn version_regex(&self) -> Result<Option<Regex>, ConfigError> {
        self.batch_version_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "batch_version_pattern '{}' is invalid: {}",
                        pattern, e
                    ))
                })
            })
            .transpose()
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML for this schema, and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.sample_limit == 0 {
            return Err(ConfigError::ValidationError(
                "store.sample_limit must be at least 1".to_string(),
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.path must not be empty".to_string(),
            ));
        }
        if !(self.analysis.rate_ratio_threshold > 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "analysis.rate_ratio_threshold must be greater than 1.0, got {}",
                self.analysis.rate_ratio_threshold
            )));
        }
        if !(self.analysis.epsilon > 0.0) || !self.analysis.epsilon.is_finite() {
            return Err(ConfigError::ValidationError(format!(
                "analysis.epsilon must be a positive number, got {}",
                self.analysis.epsilon
            )));
        }
        if self.ingest.dedup_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "ingest.dedup_capacity must be at least 1".to_string(),
            ));
        }
        self.ingest.version_regex()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.analysis.rate_ratio_threshold, 3.0);
        assert_eq!(config.analysis.min_occurrences, 5);
        assert_eq!(config.store.retention_hours, 168);
        assert_eq!(config.store.timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [analysis]
            rate_ratio_threshold = 4.5

            [ingest]
            uri_blocklist = ["/_ah/", "/favicon.ico"]
            batch_version_pattern = '\d{4}-\d{4}-[0-9a-f]{12}'
            "#,
        )
        .unwrap();

        assert_eq!(config.analysis.rate_ratio_threshold, 4.5);
        assert_eq!(config.analysis.min_occurrences, 5);
        assert_eq!(config.ingest.uri_blocklist.len(), 2);
        assert_eq!(config.store, StoreConfig::default());
        assert!(config.ingest.version_regex().unwrap().is_some());
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            "[analysis]\nrate_ratio_threshold = 1.0",
            "[analysis]\nepsilon = 0.0",
            "[store]\nsample_limit = 0",
            "[store]\ntimeout_ms = 0",
            "[ingest]\nbatch_version_pattern = '('",
        ];
        for case in cases {
            assert!(
                matches!(
                    Config::from_toml_str(case),
                    Err(ConfigError::ValidationError(_))
                ),
                "accepted: {}",
                case
            );
        }
    }

    #[test]
    fn test_invalid_toml_is_toml_error() {
        assert!(matches!(
            Config::from_toml_str("[store\npath = 3"),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[store]\npath = \"/tmp/monitor.db\"\nsample_limit = 7").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/monitor.db"));
        assert_eq!(config.store.sample_limit, 7);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = Config::from_file(Path::new("/nonexistent/error-monitor.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
