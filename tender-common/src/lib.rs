//! Tender Common - Shared types, utilities, and configuration for the tender matching services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - Clock and cancellable wait abstractions
//! - Utility functions used across services

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod time;
pub mod util;
pub mod validation;

pub use config::{
    AnalysisConfig, BatchConfig, Config, DatabaseConfig, NotificationConfig, ObservabilityConfig,
    ProviderConfig, RetryConfig, ScheduleConfig, SourceConfig,
};
pub use error::{Error, Result};
pub use time::{Cancelled, Clock, ShutdownHandle, SystemClock, TokioWaiter, Waiter};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::time::{Clock, Waiter};
    pub use crate::validation::{Validate, ValidationError};
}
