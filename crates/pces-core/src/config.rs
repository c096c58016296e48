//! Node-level configuration for the intake pipeline and the event log.
//!
//! Loaded from a TOML file with two sections:
//!
//! ```toml
//! [log]
//! preferred_file_size_megabytes = 10
//! minimum_span = 5
//!
//! [intake]
//! replay_time_budget_ms = 300000
//! ```
//!
//! Every field has a default, so a missing file or a partial file is valid.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PcesConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
}

/// Settings for the preconsensus event log writer and reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// A file is closed once it grows past this size.
    #[serde(default = "default_preferred_file_size_megabytes")]
    pub preferred_file_size_megabytes: u64,
    /// Span of the first file, before any utilization is known.
    #[serde(default = "default_bootstrap_span")]
    pub bootstrap_span: u64,
    /// Overlap factor applied while still bootstrapping.
    #[serde(default = "default_bootstrap_span_overlap_factor")]
    pub bootstrap_span_overlap_factor: f64,
    /// Overlap factor applied to the running average of utilized spans.
    #[serde(default = "default_span_overlap_factor")]
    pub span_overlap_factor: f64,
    /// A new file always covers at least this many rounds past the next event.
    #[serde(default = "default_minimum_span")]
    pub minimum_span: u64,
    #[serde(default = "default_span_utilization_running_average_length")]
    pub span_utilization_running_average_length: usize,
    /// Accept sequence-number gaps that cannot be explained by the recycle bin.
    #[serde(default)]
    pub permit_gaps: bool,
    /// fsync after every event instead of once per released batch.
    #[serde(default)]
    pub sync_every_append: bool,
    /// Upper bound on one serialized event.
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
    #[serde(default = "default_recycle_dir_name")]
    pub recycle_dir_name: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            preferred_file_size_megabytes: default_preferred_file_size_megabytes(),
            bootstrap_span: default_bootstrap_span(),
            bootstrap_span_overlap_factor: default_bootstrap_span_overlap_factor(),
            span_overlap_factor: default_span_overlap_factor(),
            minimum_span: default_minimum_span(),
            span_utilization_running_average_length:
                default_span_utilization_running_average_length(),
            permit_gaps: false,
            sync_every_append: false,
            max_event_bytes: default_max_event_bytes(),
            recycle_dir_name: default_recycle_dir_name(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl LogConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Settings for live intake and startup replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_max_transaction_bytes_per_event")]
    pub max_transaction_bytes_per_event: usize,
    /// Capacity of the queue between intake and the log thread.
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,
    #[serde(default = "default_replay_time_budget_ms")]
    pub replay_time_budget_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_transaction_bytes_per_event: default_max_transaction_bytes_per_event(),
            log_queue_capacity: default_log_queue_capacity(),
            replay_time_budget_ms: default_replay_time_budget_ms(),
        }
    }
}

impl IntakeConfig {
    #[must_use]
    pub const fn replay_time_budget(&self) -> Duration {
        Duration::from_millis(self.replay_time_budget_ms)
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be at least 1.0, got {value}")]
    OverlapBelowOne { field: &'static str, value: f64 },

    #[error("recycle_dir_name must be a plain directory name, got {0:?}")]
    BadRecycleDir(String),
}

impl ConfigError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidConfig
    }
}

impl PcesConfig {
    /// Reject values that would make the writer or the queue misbehave.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let log = &self.log;
        let nonzero = [
            ("log.preferred_file_size_megabytes", log.preferred_file_size_megabytes),
            ("log.bootstrap_span", log.bootstrap_span),
            ("log.minimum_span", log.minimum_span),
            (
                "log.span_utilization_running_average_length",
                log.span_utilization_running_average_length as u64,
            ),
            ("log.max_event_bytes", log.max_event_bytes as u64),
            ("intake.log_queue_capacity", self.intake.log_queue_capacity as u64),
            ("intake.replay_time_budget_ms", self.intake.replay_time_budget_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        for (field, value) in [
            ("log.bootstrap_span_overlap_factor", log.bootstrap_span_overlap_factor),
            ("log.span_overlap_factor", log.span_overlap_factor),
        ] {
            if !(value >= 1.0) {
                return Err(ConfigError::OverlapBelowOne { field, value });
            }
        }

        let name = log.recycle_dir_name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ConfigError::BadRecycleDir(log.recycle_dir_name.clone()));
        }

        Ok(())
    }
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> Result<PcesConfig> {
    if !path.exists() {
        return Ok(PcesConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<PcesConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(config)
}

const fn default_preferred_file_size_megabytes() -> u64 {
    10
}

const fn default_bootstrap_span() -> u64 {
    20
}

const fn default_bootstrap_span_overlap_factor() -> f64 {
    10.0
}

const fn default_span_overlap_factor() -> f64 {
    1.2
}

const fn default_minimum_span() -> u64 {
    5
}

const fn default_span_utilization_running_average_length() -> usize {
    5
}

const fn default_max_event_bytes() -> usize {
    1024 * 1024
}

fn default_recycle_dir_name() -> String {
    "recycle".to_string()
}

const fn default_lock_timeout_ms() -> u64 {
    1_000
}

const fn default_max_transaction_bytes_per_event() -> usize {
    245_760
}

const fn default_log_queue_capacity() -> usize {
    1_024
}

const fn default_replay_time_budget_ms() -> u64 {
    300_000
}
