//! Configuration module for localsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::AuthMode;

// ---------------------------------------------------------------------------
// T099: Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for a localsync engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub mutations: MutationsConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Base/delta sync scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between full (base) syncs of a model.
    pub full_sync_interval_secs: u64,
    /// Lower bound on the sleep between sync passes, in milliseconds.
    pub min_resync_sleep_ms: u64,
    /// Records requested per sync page.
    pub page_limit: u32,
}

/// Outbox draining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationsConfig {
    /// First network retry delay, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Cap for the network retry delay, in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Conflict responses tolerated for one mutation before it is discarded.
    pub max_conflict_attempts: u32,
    /// Auth modes tried in order; the next one is used only on authorization failure.
    pub auth_modes: Vec<AuthMode>,
}

/// Local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Maximum `or` branches answered by index union before falling back to a scan.
    pub union_breakpoint: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// T100: Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/localsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("localsync")
            .join("config.yaml")
    }
}

impl SyncConfig {
    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_secs)
    }

    pub fn min_resync_sleep(&self) -> Duration {
        Duration::from_millis(self.min_resync_sleep_ms)
    }
}

impl MutationsConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// T101: Config::default()
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_sync_interval_secs: 24 * 60 * 60,
            min_resync_sleep_ms: 1_000,
            page_limit: 1_000,
        }
    }
}

impl Default for MutationsConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5 * 60 * 1_000,
            max_conflict_attempts: 10,
            auth_modes: vec![AuthMode::ApiKey],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("localsync")
                .join("localsync.db"),
            union_breakpoint: 7,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// T102: Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.page_limit"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut positive = |field: &str, value: u64| {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        };

        // --- sync ---
        positive("sync.full_sync_interval_secs", self.sync.full_sync_interval_secs);
        positive("sync.min_resync_sleep_ms", self.sync.min_resync_sleep_ms);
        positive("sync.page_limit", u64::from(self.sync.page_limit));

        // --- mutations ---
        positive("mutations.retry_base_delay_ms", self.mutations.retry_base_delay_ms);
        positive(
            "mutations.max_conflict_attempts",
            u64::from(self.mutations.max_conflict_attempts),
        );

        // --- storage ---
        positive("storage.union_breakpoint", self.storage.union_breakpoint as u64);

        if self.mutations.retry_max_delay_ms < self.mutations.retry_base_delay_ms {
            errors.push(ValidationError {
                field: "mutations.retry_max_delay_ms".into(),
                message: format!(
                    "retry_max_delay_ms ({}) must not be below retry_base_delay_ms ({})",
                    self.mutations.retry_max_delay_ms, self.mutations.retry_base_delay_ms
                ),
            });
        }
        if self.mutations.auth_modes.is_empty() {
            errors.push(ValidationError {
                field: "mutations.auth_modes".into(),
                message: "at least one auth mode is required".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// T103: ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use localsync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .storage_path(PathBuf::from("/var/lib/app/local.db"))
///     .full_sync_interval_secs(3600)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn full_sync_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.full_sync_interval_secs = seconds;
        self
    }

    pub fn min_resync_sleep_ms(mut self, ms: u64) -> Self {
        self.config.sync.min_resync_sleep_ms = ms;
        self
    }

    pub fn page_limit(mut self, limit: u32) -> Self {
        self.config.sync.page_limit = limit;
        self
    }

    // --- mutations ---

    pub fn retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.mutations.retry_base_delay_ms = base;
        self.config.mutations.retry_max_delay_ms = max;
        self
    }

    pub fn max_conflict_attempts(mut self, attempts: u32) -> Self {
        self.config.mutations.max_conflict_attempts = attempts;
        self
    }

    pub fn auth_modes(mut self, modes: Vec<AuthMode>) -> Self {
        self.config.mutations.auth_modes = modes;
        self
    }

    // --- storage ---

    pub fn storage_path(mut self, path: PathBuf) -> Self {
        self.config.storage.path = path;
        self
    }

    pub fn union_breakpoint(mut self, branches: usize) -> Self {
        self.config.storage.union_breakpoint = branches;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// T104: Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.full_sync_interval_secs, 86_400);
        assert_eq!(cfg.sync.min_resync_sleep_ms, 1_000);
        assert_eq!(cfg.mutations.retry_base_delay_ms, 100);
        assert_eq!(cfg.mutations.retry_max_delay_ms, 300_000);
        assert_eq!(cfg.mutations.max_conflict_attempts, 10);
        assert_eq!(cfg.mutations.auth_modes, vec![AuthMode::ApiKey]);
        assert_eq!(cfg.storage.union_breakpoint, 7);
        assert!(cfg.storage.path.ends_with("localsync/localsync.db"));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
sync:
  full_sync_interval_secs: 3600
  min_resync_sleep_ms: 250
mutations:
  retry_base_delay_ms: 50
  retry_max_delay_ms: 1000
  auth_modes: [user_pool, api_key]
storage:
  path: /tmp/localsync-test.db
  union_breakpoint: 3
logging:
  level: debug
  json: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.full_sync_interval_secs, 3600);
        assert_eq!(cfg.sync.min_resync_sleep_ms, 250);
        // omitted keys keep their defaults
        assert_eq!(cfg.sync.page_limit, 1_000);
        assert_eq!(cfg.mutations.max_conflict_attempts, 10);
        assert_eq!(
            cfg.mutations.auth_modes,
            vec![AuthMode::UserPool, AuthMode::ApiKey]
        );
        assert_eq!(cfg.storage.path, PathBuf::from("/tmp/localsync-test.db"));
        assert_eq!(cfg.storage.union_breakpoint, 3);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_values() {
        let mut cfg = Config::default();
        cfg.sync.full_sync_interval_secs = 0;
        cfg.sync.page_limit = 0;
        cfg.mutations.max_conflict_attempts = 0;
        cfg.storage.union_breakpoint = 0;
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"sync.full_sync_interval_secs".to_string()));
        assert!(fields.contains(&"sync.page_limit".to_string()));
        assert!(fields.contains(&"mutations.max_conflict_attempts".to_string()));
        assert!(fields.contains(&"storage.union_breakpoint".to_string()));
    }

    #[test]
    fn validate_catches_inverted_retry_delays() {
        let result = ConfigBuilder::new().retry_delays_ms(500, 100).build_validated();
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| e.field == "mutations.retry_max_delay_ms"));
    }

    #[test]
    fn validate_catches_bad_log_level_and_empty_auth_modes() {
        let errors = ConfigBuilder::new()
            .logging_level("verbose")
            .auth_modes(vec![])
            .build()
            .validate();
        assert!(errors.iter().any(|e| e.field == "logging.level"));
        assert!(errors.iter().any(|e| e.field == "mutations.auth_modes"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "sync.page_limit".into(),
            message: "must be greater than 0".into(),
        };
        assert_eq!(err.to_string(), "sync.page_limit: must be greater than 0");
    }
}
