//! Configuration validation for the tender services.
//!
//! Checks that pacing, retry and schedule values are usable before the
//! pipeline starts.

use thiserror::Error;

use crate::config::{
    AnalysisConfig, BatchConfig, Config, ObservabilityConfig, ProviderConfig, RetryConfig,
    ScheduleConfig, SourceConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

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

        let sections: [&dyn Validate; 6] = [
            &self.observability,
            &self.provider,
            &self.analysis,
            &self.batch,
            &self.retry,
            &self.schedule,
        ];
        for section in sections {
            if let Err(e) = section.validate() {
                errors.push(e);
            }
        }

        for source in &self.sources {
            if let Err(e) = source.validate() {
                errors.push(e);
            }
        }

        if self.notification.enabled && self.notification.endpoint.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "notification.endpoint".into(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load and validate configuration, applying environment overrides.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
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

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}

impl Validate for ProviderConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "provider.base_url".into(),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "provider.model".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ValidationError::InvalidValue {
                field: "provider.temperature".into(),
                reason: "must be between 0.0 and 2.0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for AnalysisConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.min_text_chars > self.ai_threshold_chars {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "analysis.min_text_chars ({}) exceeds analysis.ai_threshold_chars ({})",
                    self.min_text_chars, self.ai_threshold_chars
                ),
            });
        }
        if self.max_prompt_chars == 0 {
            return Err(ValidationError::InvalidValue {
                field: "analysis.max_prompt_chars".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.default_sector.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "analysis.default_sector".into(),
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

impl Validate for BatchConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidValue {
                field: "batch.batch_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidValue {
                field: "retry.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.min_delay_secs > self.max_delay_secs {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "retry.min_delay_secs ({}) exceeds retry.max_delay_secs ({})",
                    self.min_delay_secs, self.max_delay_secs
                ),
            });
        }
        Ok(())
    }
}

impl Validate for ScheduleConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.hour >= 24 {
            return Err(ValidationError::InvalidValue {
                field: "schedule.hour".into(),
                reason: format!("{} is not an hour of the day", self.hour),
            });
        }
        if self.minute >= 60 {
            return Err(ValidationError::InvalidValue {
                field: "schedule.minute".into(),
                reason: format!("{} is not a minute of the hour", self.minute),
            });
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(ValidationError::InvalidValue {
                field: "schedule.utc_offset_minutes".into(),
                reason: "must be within +/-14 hours".into(),
            });
        }
        if self.check_interval_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "schedule.check_interval_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for SourceConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "sources[].name".into(),
            });
        }
        if self.enabled && self.url.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: format!("sources[{}].url", self.name),
            });
        }
        Ok(())
    }
}
