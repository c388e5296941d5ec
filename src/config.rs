//! Tracker configuration
//!
//! Defaults reproduce the production reading page: a 100ms sampling tick, one
//! record per second of active time, a 3s scroll decay window and a flush every
//! 10 records.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::TrackerError;

/// Default sampling tick (ms)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

/// Default emission threshold (ms of active time per record)
pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 1000;

/// Default scroll decay window (ms)
pub const DEFAULT_SCROLL_DECAY_MS: u64 = 3000;

/// Default buffer length that triggers a flush
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;

/// Default collector endpoint path
pub const DEFAULT_COLLECTOR_PATH: &str = "/log/behavior";

const ENV_PREFIX: &str = "NPTI_TRACKER_";

/// Tunable knobs of the tracking pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Sampling timer period
    pub tick_interval_ms: u64,
    /// Active time accumulated per emitted record
    pub emit_interval_ms: u64,
    /// How long a scroll keeps the page active
    pub scroll_decay_ms: u64,
    /// Buffer length that triggers an immediate flush
    pub flush_threshold: usize,
    /// Path of the behavior collector endpoint
    pub collector_path: String,
    /// Optional cap on buffered records; `None` keeps the buffer unbounded
    pub max_buffered_records: Option<usize>,
    /// Zero pointer/scroll totals after each emitted record
    pub reset_accumulators_on_emit: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            emit_interval_ms: DEFAULT_EMIT_INTERVAL_MS,
            scroll_decay_ms: DEFAULT_SCROLL_DECAY_MS,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            collector_path: DEFAULT_COLLECTOR_PATH.to_string(),
            max_buffered_records: None,
            reset_accumulators_on_emit: false,
        }
    }
}

impl TrackerConfig {
    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, TrackerError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn from_file(path: &Path) -> Result<Self, TrackerError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Apply `NPTI_TRACKER_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self, TrackerError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (keys carry the `NPTI_TRACKER_` prefix)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, TrackerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("TICK_INTERVAL_MS") {
            self.tick_interval_ms = parse_number("TICK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("EMIT_INTERVAL_MS") {
            self.emit_interval_ms = parse_number("EMIT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("SCROLL_DECAY_MS") {
            self.scroll_decay_ms = parse_number("SCROLL_DECAY_MS", &v)?;
        }
        if let Some(v) = get("FLUSH_THRESHOLD") {
            self.flush_threshold = parse_number("FLUSH_THRESHOLD", &v)?;
        }
        if let Some(v) = get("COLLECTOR_PATH") {
            self.collector_path = v;
        }
        if let Some(v) = get("MAX_BUFFERED_RECORDS") {
            self.max_buffered_records = match v.trim() {
                "" | "none" => None,
                n => Some(parse_number("MAX_BUFFERED_RECORDS", n)?),
            };
        }
        if let Some(v) = get("RESET_ACCUMULATORS") {
            self.reset_accumulators_on_emit = v == "1" || v.eq_ignore_ascii_case("true");
        }

        self.validate()?;
        Ok(self)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.tick_interval_ms == 0 {
            return Err(TrackerError::InvalidConfig(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.emit_interval_ms < self.tick_interval_ms {
            return Err(TrackerError::InvalidConfig(format!(
                "emit_interval_ms ({}) must be at least tick_interval_ms ({})",
                self.emit_interval_ms, self.tick_interval_ms
            )));
        }
        if self.flush_threshold == 0 {
            return Err(TrackerError::InvalidConfig(
                "flush_threshold must be at least 1".to_string(),
            ));
        }
        if !self.collector_path.starts_with('/') {
            return Err(TrackerError::InvalidConfig(format!(
                "collector_path must start with '/': {}",
                self.collector_path
            )));
        }
        if let Some(cap) = self.max_buffered_records {
            if cap < self.flush_threshold {
                return Err(TrackerError::InvalidConfig(format!(
                    "max_buffered_records ({cap}) is below flush_threshold ({})",
                    self.flush_threshold
                )));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, TrackerError> {
    value.trim().parse().map_err(|_| {
        TrackerError::InvalidConfig(format!("{ENV_PREFIX}{name} is not a number: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(config.emit_interval_ms, 1000);
        assert_eq!(config.scroll_decay_ms, 3000);
        assert_eq!(config.flush_threshold, 10);
        assert_eq!(config.collector_path, "/log/behavior");
        assert!(config.max_buffered_records.is_none());
        assert!(!config.reset_accumulators_on_emit);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrackerConfig::from_json(r#"{"flush_threshold": 5}"#).unwrap();
        assert_eq!(config.flush_threshold, 5);
        assert_eq!(config.tick_interval_ms, 100);
    }

    #[test]
    fn test_rejects_inconsistent_intervals() {
        let result = TrackerConfig::from_json(r#"{"tick_interval_ms": 500, "emit_interval_ms": 100}"#);
        assert!(matches!(result, Err(TrackerError::InvalidConfig(_))));

        let result = TrackerConfig::from_json(r#"{"collector_path": "log/behavior"}"#);
        assert!(matches!(result, Err(TrackerError::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NPTI_TRACKER_FLUSH_THRESHOLD", "20"),
            ("NPTI_TRACKER_MAX_BUFFERED_RECORDS", "500"),
            ("NPTI_TRACKER_RESET_ACCUMULATORS", "true"),
        ]
        .into_iter()
        .collect();

        let config = TrackerConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.flush_threshold, 20);
        assert_eq!(config.max_buffered_records, Some(500));
        assert!(config.reset_accumulators_on_emit);
    }

    #[test]
    fn test_override_parse_error() {
        let result = TrackerConfig::default().with_overrides(|k| {
            (k == "NPTI_TRACKER_TICK_INTERVAL_MS").then(|| "fast".to_string())
        });
        assert!(matches!(result, Err(TrackerError::InvalidConfig(_))));
    }
}
