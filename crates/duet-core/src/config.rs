use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application configuration directory (tokens, cache database)
    pub config_dir: PathBuf,

    /// Remote calendar API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Two-tier cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Range loading and presentation settings
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the calendar API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for transient failures (timeouts, 429, 5xx)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    2
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of an in-memory entry, in seconds
    #[serde(default = "default_memory_ttl_secs")]
    pub memory_ttl_secs: u64,

    /// Lifetime of a persisted entry, in seconds (survives restarts)
    #[serde(default = "default_persisted_ttl_secs")]
    pub persisted_ttl_secs: u64,

    /// Maximum number of in-memory entries before LRU eviction.
    /// Six covers roughly three months for two accounts.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// SQLite file name under `config_dir`
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

fn default_memory_ttl_secs() -> u64 {
    300
}

fn default_persisted_ttl_secs() -> u64 {
    86_400
}

fn default_max_entries() -> usize {
    6
}

fn default_db_file() -> String {
    "calendar_cache.db".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl_secs: default_memory_ttl_secs(),
            persisted_ttl_secs: default_persisted_ttl_secs(),
            max_entries: default_max_entries(),
            db_file: default_db_file(),
        }
    }
}

impl CacheConfig {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    pub fn persisted_ttl(&self) -> Duration {
        Duration::from_secs(self.persisted_ttl_secs)
    }
}

/// First day of a week range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeekStart {
    #[default]
    Monday,
    Sunday,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// IANA timezone used to split events into calendar days
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// First day of week ranges
    #[serde(default)]
    pub week_start: WeekStart,

    /// Delay before a load error becomes visible, in milliseconds
    #[serde(default = "default_error_debounce_ms")]
    pub error_debounce_ms: u64,

    /// Warm adjacent ranges in the background after each load
    #[serde(default = "default_prefetch")]
    pub prefetch: bool,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_error_debounce_ms() -> u64 {
    2500
}

fn default_prefetch() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
            week_start: WeekStart::default(),
            error_debounce_ms: default_error_debounce_ms(),
            prefetch: default_prefetch(),
        }
    }
}

impl SyncConfig {
    pub fn error_debounce(&self) -> Duration {
        Duration::from_millis(self.error_debounce_ms)
    }

    /// Parsed reference timezone.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` when `time_zone` is not a known IANA name.
    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.time_zone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown time zone: {}", self.time_zone)))
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duet");

        Self {
            config_dir,
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file, writing defaults if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(config_path)
            .map_err(ConfigError::from)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents)
            .map_err(ConfigError::from)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()).into());
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.api.base_url, "api.base_url", &mut result);

        if self.api.timeout_secs == 0 {
            result.add_error("api.timeout_secs", "Request timeout must be greater than 0");
        } else if self.api.timeout_secs > 300 {
            result.add_warning("api.timeout_secs", "Request timeout is unusually long (>5 min)");
        }

        if self.cache.memory_ttl_secs == 0 {
            result.add_warning("cache.memory_ttl_secs", "Memory cache disabled (0 seconds)");
        }

        if self.cache.persisted_ttl_secs < self.cache.memory_ttl_secs {
            result.add_warning(
                "cache.persisted_ttl_secs",
                "Persisted TTL is shorter than memory TTL; persisted entries will rarely be used",
            );
        }

        if self.cache.max_entries == 0 {
            result.add_error("cache.max_entries", "Cache must hold at least one entry");
        }

        if self.cache.db_file.trim().is_empty() {
            result.add_error("cache.db_file", "Cache database file name is empty");
        }

        if let Err(e) = self.sync.tz() {
            result.add_error("sync.time_zone", e.to_string());
        }

        if self.sync.error_debounce_ms > 30_000 {
            result.add_warning(
                "sync.error_debounce_ms",
                "Errors will be hidden for more than 30 seconds",
            );
        }

        result
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }

                if let Some(port) = url.port() {
                    if port == 0 {
                        result.add_error(field_name, "Port cannot be 0");
                    }
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Path of the SQLite cache database
    pub fn cache_db_path(&self) -> PathBuf {
        self.config_dir.join(&self.cache.db_file)
    }

    /// Directory holding per-account token files
    pub fn tokens_dir(&self) -> PathBuf {
        self.config_dir.join("tokens")
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("duet");

        Ok(config_dir.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.is_valid(), "Default config should be valid: {:?}", result.errors);
    }

    #[test]
    fn test_invalid_url() {
        let mut config = Config::default();
        config.api.base_url = "not-a-url".to_string();
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "api.base_url"));
    }

    #[test]
    fn test_invalid_url_scheme() {
        let mut config = Config::default();
        config.api.base_url = "ftp://localhost:8080".to_string();
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.message.contains("http or https")));
    }

    #[test]
    fn test_unknown_time_zone() {
        let mut config = Config::default();
        config.sync.time_zone = "Mars/Olympus_Mons".to_string();
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "sync.time_zone"));
    }

    #[test]
    fn test_zero_max_entries() {
        let mut config = Config::default();
        config.cache.max_entries = 0;
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "cache.max_entries"));
    }

    #[test]
    fn test_short_persisted_ttl_is_warning() {
        let mut config = Config::default();
        config.cache.persisted_ttl_secs = 10;
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.field == "cache.persisted_ttl_secs"));
    }

    #[test]
    fn test_load_from_missing_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duet").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.cache.max_entries, 6);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.sync.time_zone, "UTC");
        assert_eq!(reloaded.sync.week_start, WeekStart::Monday);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
config_dir = "/tmp/duet"

[sync]
time_zone = "America/New_York"
week_start = "sunday"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.sync.week_start, WeekStart::Sunday);
        assert_eq!(config.sync.error_debounce_ms, 2500);
        assert_eq!(config.cache.memory_ttl_secs, 300);
        assert!(config.sync.tz().is_ok());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "config_dir = [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_validation_result_error_summary() {
        let mut result = ValidationResult::default();
        result.add_error("field1", "error1");
        result.add_error("field2", "error2");
        let summary = result.error_summary();
        assert!(summary.contains("field1"));
        assert!(summary.contains("field2"));
    }
}
