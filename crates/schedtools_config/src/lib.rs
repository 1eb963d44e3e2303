//! Scheduler and timer configuration
//!
//! Plain serde-derived settings shared by the scheduler runtime and the
//! `schedtools` binary. Files are read as YAML or JSON depending on extension.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported config format for {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),
}

/// What a scheduler does with already-accepted tasks on orderly termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Finish the running task, drop everything still queued
    #[default]
    Discard,
    /// Run every queued task before the worker exits
    Drain,
}

impl std::str::FromStr for ShutdownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discard" | "clear" => Ok(ShutdownPolicy::Discard),
            "drain" => Ok(ShutdownPolicy::Drain),
            _ => Err(format!("Unknown shutdown policy: {}", s)),
        }
    }
}

/// Settings for a single worker-thread scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker thread name
    pub name: String,
    pub shutdown: ShutdownPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "schedtools-worker".to_string(),
            shutdown: ShutdownPolicy::Discard,
        }
    }
}

impl SchedulerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownPolicy) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Whether a timer's period is fixed or tuned from measured execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntervalMode {
    #[default]
    Manual,
    Auto,
}

impl std::str::FromStr for IntervalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" | "fixed" => Ok(IntervalMode::Manual),
            "auto" | "adaptive" => Ok(IntervalMode::Auto),
            _ => Err(format!("Unknown interval mode: {}", s)),
        }
    }
}

/// Tuning knobs for the adaptive (AIMD) interval controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Multiplier applied to the interval after an overrun
    pub backoff_factor: f64,
    /// Multiplier used to approach the target once the penalty has decayed
    pub decay_factor: f64,
    /// Penalty added to the wait multiplier on each overrun
    pub overrun_penalty: u32,
    /// Linear step (ms) taken while the wait multiplier is positive
    pub step_ms: u64,
    /// Ceiling for backoff; `None` leaves backoff unbounded
    pub max_interval_ms: Option<u64>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            backoff_factor: 1.05,
            decay_factor: 0.95,
            overrun_penalty: 10,
            step_ms: 1,
            max_interval_ms: None,
        }
    }
}

/// Timer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Time before the first fire, in milliseconds
    pub delay_ms: u64,
    /// Initial period, in milliseconds
    pub interval_ms: u64,
    /// Steady-state period for `Auto` mode; defaults to `interval_ms`
    pub target_interval_ms: Option<u64>,
    pub mode: IntervalMode,
    pub adaptive: AdaptiveConfig,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            interval_ms: 1000,
            target_interval_ms: None,
            mode: IntervalMode::Manual,
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl TimerConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        load(path)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn target_interval(&self) -> Duration {
        Duration::from_millis(self.target_interval_ms.unwrap_or(self.interval_ms))
    }
}

/// Reads any config type from a `.yaml`/`.yml`/`.json` file.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let read = || {
        fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    };

    match extension.as_deref() {
        Some("yaml" | "yml") => serde_yaml::from_str(&read()?).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        }),
        Some("json") => serde_json::from_str(&read()?).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        }),
        _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "interval_ms: 40\nmode: auto\nadaptive:\n  max_interval_ms: 500").unwrap();

        let config = TimerConfig::from_path(file.path()).unwrap();
        assert_eq!(config.interval_ms, 40);
        assert_eq!(config.delay_ms, 1000);
        assert_eq!(config.mode, IntervalMode::Auto);
        assert_eq!(config.adaptive.max_interval_ms, Some(500));
        assert_eq!(config.adaptive.overrun_penalty, 10);
        assert_eq!(config.target_interval(), Duration::from_millis(40));
    }

    #[test]
    fn json_scheduler_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"name": "io", "shutdown": "drain"}}"#).unwrap();

        let config: SchedulerConfig = load(file.path()).unwrap();
        assert_eq!(config, SchedulerConfig::named("io").with_shutdown(ShutdownPolicy::Drain));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = TimerConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn enums_parse_from_cli_strings() {
        assert_eq!("Adaptive".parse::<IntervalMode>(), Ok(IntervalMode::Auto));
        assert_eq!("drain".parse::<ShutdownPolicy>(), Ok(ShutdownPolicy::Drain));
        assert!("sometimes".parse::<IntervalMode>().is_err());
    }
}
