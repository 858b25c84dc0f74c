//! Configuration management for the tender matching services.
//!
//! All services share one configuration file at `~/.tender-matcher/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (TENDER_* prefix, plus `GROQ_API_KEY`)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `GROQ_API_KEY` / `TENDER_PROVIDER_API_KEY` → provider.api_key
//! - `TENDER_PROVIDER_BASE_URL` → provider.base_url
//! - `TENDER_PROVIDER_MODEL` → provider.model
//! - `TENDER_DATABASE_PATH` → database.path
//! - `TENDER_LOG_LEVEL` → observability.log_level
//! - `TENDER_LOG_FORMAT` → observability.log_format
//! - `TENDER_SCHEDULE_HOUR` → schedule.hour
//! - `TENDER_NOTIFY_ENDPOINT` → notification.endpoint

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".tender-matcher"),
        |dirs| dirs.home_dir().join(".tender-matcher"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration shared by every tender service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Chat-completion provider used for AI-assisted analysis
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Pacing of analysis calls
    #[serde(default)]
    pub batch: BatchConfig,

    /// Retry policy for provider calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Daily cycle trigger
    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub notification: NotificationConfig,

    /// Tender feeds fetched during the scrape stage
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
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
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) =
            std::env::var("TENDER_PROVIDER_API_KEY").or_else(|_| std::env::var("GROQ_API_KEY"))
        {
            if !key.is_empty() {
                self.provider.api_key = Some(key);
            }
        }

        if let Ok(url) = std::env::var("TENDER_PROVIDER_BASE_URL") {
            self.provider.base_url = url;
        }

        if let Ok(model) = std::env::var("TENDER_PROVIDER_MODEL") {
            self.provider.model = model;
        }

        if let Ok(path) = std::env::var("TENDER_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }

        if let Ok(level) = std::env::var("TENDER_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(format) = std::env::var("TENDER_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Ok(hour) = std::env::var("TENDER_SCHEDULE_HOUR") {
            match hour.parse() {
                Ok(h) => self.schedule.hour = h,
                Err(_) => tracing::warn!(value = %hour, "Ignoring invalid TENDER_SCHEDULE_HOUR"),
            }
        }

        if let Ok(endpoint) = std::env::var("TENDER_NOTIFY_ENDPOINT") {
            self.notification.endpoint = endpoint;
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
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

    /// Additional module targets to set to `warn`.
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

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Database
// ============================================================================

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    config_dir().join("tenders.db")
}

// ============================================================================
// Provider
// ============================================================================

/// OpenAI-compatible chat-completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL without the `/v1/chat/completions` suffix
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_provider_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_provider_base_url(),
            api_key: None,
            model: default_provider_model(),
            temperature: default_temperature(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl ProviderConfig {
    /// Whether an API key is available.
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

fn default_provider_name() -> String {
    "groq".into()
}

fn default_provider_base_url() -> String {
    "https://api.groq.com/openai".into()
}

fn default_provider_model() -> String {
    "llama-3.3-70b-versatile".into()
}

fn default_temperature() -> f64 {
    0.3
}

fn default_provider_timeout() -> u64 {
    120
}

// ============================================================================
// Analysis
// ============================================================================

/// Thresholds and limits for tender analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Below this many characters a tender is skipped
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,

    /// At or above this many characters the AI path is used
    #[serde(default = "default_ai_threshold_chars")]
    pub ai_threshold_chars: usize,

    /// Maximum characters of tender text sent in a prompt
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: i64,

    #[serde(default = "default_extraction_max_tokens")]
    pub extraction_max_tokens: i64,

    /// Token budget of the recommendations appended to digests
    #[serde(default = "default_recommendation_max_tokens")]
    pub recommendation_max_tokens: i64,

    /// Upper bound for locally synthesized summaries
    #[serde(default = "default_local_summary_chars")]
    pub local_summary_chars: usize,

    /// Sector used by the local path when nothing better is known
    #[serde(default = "default_sector")]
    pub default_sector: String,

    /// Location used by the local path when the tender carries none
    #[serde(default = "default_location")]
    pub default_location: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_text_chars: default_min_text_chars(),
            ai_threshold_chars: default_ai_threshold_chars(),
            max_prompt_chars: default_max_prompt_chars(),
            summary_max_tokens: default_summary_max_tokens(),
            extraction_max_tokens: default_extraction_max_tokens(),
            recommendation_max_tokens: default_recommendation_max_tokens(),
            local_summary_chars: default_local_summary_chars(),
            default_sector: default_sector(),
            default_location: default_location(),
        }
    }
}

fn default_min_text_chars() -> usize {
    20
}

fn default_ai_threshold_chars() -> usize {
    300
}

fn default_max_prompt_chars() -> usize {
    8000
}

fn default_summary_max_tokens() -> i64 {
    500
}

fn default_extraction_max_tokens() -> i64 {
    300
}

fn default_recommendation_max_tokens() -> i64 {
    600
}

fn default_local_summary_chars() -> usize {
    500
}

fn default_sector() -> String {
    "Services Généraux & Prestations diverses".into()
}

fn default_location() -> String {
    "Guinée".into()
}

// ============================================================================
// Batch pacing
// ============================================================================

/// Pacing policy for analysis batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between two tenders of the same batch
    #[serde(default = "default_item_delay")]
    pub item_delay_secs: u64,

    /// Pause between two batches
    #[serde(default = "default_batch_delay")]
    pub batch_delay_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            item_delay_secs: default_item_delay(),
            batch_delay_secs: default_batch_delay(),
        }
    }
}

impl BatchConfig {
    pub fn item_delay(&self) -> Duration {
        Duration::from_secs(self.item_delay_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay_secs)
    }
}

fn default_batch_size() -> usize {
    5
}

fn default_item_delay() -> u64 {
    4
}

fn default_batch_delay() -> u64 {
    20
}

// ============================================================================
// Retry
// ============================================================================

/// Exponential backoff settings for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff multiplier in seconds (delay = multiplier * 2^(n-1))
    #[serde(default = "default_multiplier")]
    pub multiplier_secs: u64,

    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Extra pause applied when the provider reports a rate limit
    #[serde(default = "default_rate_limit_pause")]
    pub rate_limit_pause_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            multiplier_secs: default_multiplier(),
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            rate_limit_pause_secs: default_rate_limit_pause(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_multiplier() -> u64 {
    3
}

fn default_min_delay() -> u64 {
    15
}

fn default_max_delay() -> u64 {
    120
}

fn default_rate_limit_pause() -> u64 {
    30
}

// ============================================================================
// Schedule
// ============================================================================

/// Daily cycle trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_schedule_hour")]
    pub hour: u32,

    #[serde(default)]
    pub minute: u32,

    /// Offset of the local wall clock the hour refers to (0 = Conakry / UTC)
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Missed fire times older than this are dropped instead of run
    #[serde(default = "default_misfire_grace")]
    pub misfire_grace_secs: u64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: default_schedule_hour(),
            minute: 0,
            utc_offset_minutes: 0,
            misfire_grace_secs: default_misfire_grace(),
            check_interval_secs: default_check_interval(),
        }
    }
}

impl ScheduleConfig {
    /// Cron expression (sec min hour dom month dow) for the daily trigger.
    pub fn cron_expression(&self) -> String {
        format!("0 {} {} * * *", self.minute, self.hour)
    }
}

fn default_schedule_hour() -> u32 {
    7
}

fn default_misfire_grace() -> u64 {
    3600
}

fn default_check_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Notification
// ============================================================================

/// Delivery of daily match digests through a channels HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the channels service (POST {endpoint}/api/v1/send)
    #[serde(default = "default_notify_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_channel_type")]
    pub channel_type: String,

    /// Number of matches listed in a digest
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    /// Matches below this score are left out of the digest
    #[serde(default)]
    pub min_score: f64,

    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,

    /// Ask the provider for recommendations to append to each digest
    #[serde(default = "default_true")]
    pub recommendations: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_notify_endpoint(),
            channel_type: default_channel_type(),
            max_items: default_max_items(),
            min_score: 0.0,
            timeout_secs: default_notify_timeout(),
            recommendations: true,
        }
    }
}

fn default_notify_endpoint() -> String {
    "http://127.0.0.1:4431".into()
}

fn default_channel_type() -> String {
    "email".into()
}

fn default_max_items() -> usize {
    10
}

fn default_notify_timeout() -> u64 {
    30
}

// ============================================================================
// Sources
// ============================================================================

/// A tender feed returning a JSON array of announcements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default)]
    pub url: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

fn default_source_timeout() -> u64 {
    30
}
