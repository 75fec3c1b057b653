//! Configuration management for sigscan services.
//!
//! All services share one configuration file at `~/.sigscan/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (SIGSCAN_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `SIGSCAN_LOG_LEVEL` → observability.log_level
//! - `SIGSCAN_LOG_FORMAT` → observability.log_format
//! - `SIGSCAN_DB_PATH` → storage.db_path
//! - `SIGSCAN_CONCURRENCY` → scan.concurrency

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".sigscan"),
        |dirs| dirs.home_dir().join(".sigscan"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to hold at `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Persistence configuration for resume slots and run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Run-history retention in days (older rows are pruned)
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            history_retention_days: default_history_retention_days(),
        }
    }
}

// ============================================================================
// Scan
// ============================================================================

/// Schedule for one job family.
///
/// Cron expressions carry a seconds field, e.g. `"0 30 18 * * MON-FRI"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobScheduleConfig {
    /// Whether the recurring timer is armed
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cron expression for the firing boundary
    pub cron: String,

    /// Only fire on trading days
    #[serde(default = "default_true")]
    pub trading_days_only: bool,
}

impl JobScheduleConfig {
    fn new(cron: &str, trading_days_only: bool) -> Self {
        Self {
            enabled: true,
            cron: cron.to_string(),
            trading_days_only,
        }
    }
}

/// Schedules for every job family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulesConfig {
    #[serde(default = "default_daily_fetch_schedule")]
    pub daily_fetch: JobScheduleConfig,

    #[serde(default = "default_weekly_fetch_schedule")]
    pub weekly_fetch: JobScheduleConfig,

    #[serde(default = "default_detector_scan_schedule")]
    pub detector_scan: JobScheduleConfig,

    #[serde(default = "default_table_rebuild_schedule")]
    pub table_rebuild: JobScheduleConfig,
}

impl Default for SchedulesConfig {
    fn default() -> Self {
        Self {
            daily_fetch: default_daily_fetch_schedule(),
            weekly_fetch: default_weekly_fetch_schedule(),
            detector_scan: default_detector_scan_schedule(),
            table_rebuild: default_table_rebuild_schedule(),
        }
    }
}

/// Batch-scan driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Maximum number of per-ticker calls in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-item timeout in seconds (0 disables the timeout)
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Run one retry pass over failed tickers after the first pass
    #[serde(default = "default_true")]
    pub retry_failed: bool,

    /// Recurring schedules per job family
    #[serde(default)]
    pub schedules: SchedulesConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            item_timeout_secs: default_item_timeout_secs(),
            retry_failed: true,
            schedules: SchedulesConfig::default(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Scan driver configuration
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SIGSCAN_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("SIGSCAN_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(path) = std::env::var("SIGSCAN_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Ok(concurrency) = std::env::var("SIGSCAN_CONCURRENCY") {
            match concurrency.parse() {
                Ok(n) => self.scan.concurrency = n,
                Err(_) => tracing::warn!(value = %concurrency, "Ignoring invalid SIGSCAN_CONCURRENCY"),
            }
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let path = config_path();
        let dir = config_dir();

        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_true() -> bool {
    true
}
fn default_db_path() -> PathBuf {
    config_dir().join("scans.db")
}
fn default_history_retention_days() -> u32 {
    90
}
fn default_concurrency() -> usize {
    8
}
fn default_item_timeout_secs() -> u64 {
    120
}
fn default_daily_fetch_schedule() -> JobScheduleConfig {
    JobScheduleConfig::new("0 30 18 * * MON-FRI", true)
}
fn default_weekly_fetch_schedule() -> JobScheduleConfig {
    JobScheduleConfig::new("0 0 10 * * SAT", false)
}
fn default_detector_scan_schedule() -> JobScheduleConfig {
    JobScheduleConfig::new("0 15 19 * * MON-FRI", true)
}
fn default_table_rebuild_schedule() -> JobScheduleConfig {
    JobScheduleConfig::new("0 0 3 * * SUN", false)
}
