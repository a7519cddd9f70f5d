//! Run configuration.
//!
//! A run is described by a YAML document:
//!
//! ```yaml
//! start_period: 2001
//! periods: 10
//! storage:
//!   sync_on_write: false
//!   max_block_rows: 65536
//! schedule:
//!   - { entity: person, process: ageing }
//!   - { entity: household, process: update }
//! ```
//!
//! An empty schedule runs every top-level process of every entity, in
//! declaration order.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::period::Period;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml { source: serde_yml::Error },

    /// The values parsed but do not describe a runnable simulation.
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

impl ConfigError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Period store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Whether to fsync after every appended period (slower but safer).
    pub sync_on_write: bool,
    /// Largest number of rows written in one block of a table file.
    pub max_block_rows: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_on_write: false,
            max_block_rows: 64 * 1024,
        }
    }
}

impl StorageConfig {
    /// Rejects settings the store cannot run with.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_block_rows == 0 {
            return Err(ConfigError::invalid("max_block_rows must be at least 1"));
        }
        Ok(self)
    }
}

/// One process run of the period schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Entity owning the process.
    pub entity: String,
    /// Top-level process name.
    pub process: String,
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// First simulated period. Input periods before it are history.
    pub start_period: Period,
    /// Number of periods to simulate.
    pub periods: u32,
    /// Output store settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Processes run each period, in order. Empty runs every process.
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

impl SimulationConfig {
    /// A configuration with default storage and no schedule.
    #[must_use]
    pub fn new(start_period: Period, periods: u32) -> Self {
        Self {
            start_period,
            periods,
            storage: StorageConfig::default(),
            schedule: Vec::new(),
        }
    }

    /// Appends `(entity, process)` to the schedule.
    #[must_use]
    pub fn with_step(mut self, entity: impl Into<String>, process: impl Into<String>) -> Self {
        self.schedule.push(ScheduleEntry {
            entity: entity.into(),
            process: process.into(),
        });
        self
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if the values are out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if the values are out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()
    }

    /// Checks the storage settings and that no schedule entry is blank.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if let Some(entry) = self
            .schedule
            .iter()
            .find(|e| e.entity.is_empty() || e.process.is_empty())
        {
            return Err(ConfigError::invalid(format!(
                "schedule entry '{}.{}' must name both an entity and a process",
                entry.entity, entry.process
            )));
        }
        let storage = self.storage.validate()?;
        Ok(Self { storage, ..self })
    }

    /// The simulated periods, in order.
    pub fn simulated_periods(&self) -> impl Iterator<Item = Period> {
        Period::range(self.start_period, self.periods)
    }
}
