//! Configuration validation for sigscan services.

use std::str::FromStr;
use thiserror::Error;

use crate::config::{Config, JobScheduleConfig, ObservabilityConfig, ScanConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid cron expression for {field}: {expression}")]
    InvalidCron { field: String, expression: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        if let Err(e) = self.scan.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load and validate configuration.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        if self.log_format != "json" && self.log_format != "pretty" {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: "must be 'json' or 'pretty'".into(),
            });
        }

        Ok(())
    }
}

impl Validate for ScanConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.concurrency == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "scan.concurrency".into(),
                reason: "must be at least 1".into(),
            });
        }

        let schedules = [
            ("scan.schedules.daily_fetch", &self.schedules.daily_fetch),
            ("scan.schedules.weekly_fetch", &self.schedules.weekly_fetch),
            ("scan.schedules.detector_scan", &self.schedules.detector_scan),
            ("scan.schedules.table_rebuild", &self.schedules.table_rebuild),
        ];
        for (field, schedule) in schedules {
            if let Err(e) = validate_schedule(field, schedule) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

fn validate_schedule(field: &str, schedule: &JobScheduleConfig) -> ValidationResult<()> {
    // Disabled schedules are never parsed
    if !schedule.enabled {
        return Ok(());
    }

    cron::Schedule::from_str(&schedule.cron)
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidCron {
            field: field.into(),
            expression: schedule.cron.clone(),
        })
}
