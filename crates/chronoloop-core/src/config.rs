//! Runtime configuration.
//!
//! Configuration is read from TOML. Every key is optional:
//!
//! ```toml
//! [looper]
//! name = "worker"
//! # Upper bound on a single wait; only needed with non-realtime clocks.
//! poll_interval = "5ms"
//!
//! [clock]
//! looper_name = "MediaClock"
//! anchor_jitter_tolerance_us = 10000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Anchor changes smaller than this (in microseconds) are treated as noise.
pub const DEFAULT_ANCHOR_JITTER_TOLERANCE_US: i64 = 10_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub looper: LooperConfig,
    pub clock: ClockConfig,
}

/// Settings for a single looper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooperConfig {
    /// Worker thread name.
    pub name: String,
    /// Longest single wait before the worker re-reads the clock.
    #[serde(
        with = "duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval: Option<Duration>,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            name: "looper".to_string(),
            poll_interval: None,
        }
    }
}

impl LooperConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Settings for a media clock and its private looper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub looper_name: String,
    #[serde(
        with = "duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval: Option<Duration>,
    pub anchor_jitter_tolerance_us: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            looper_name: "MediaClock".to_string(),
            poll_interval: None,
            anchor_jitter_tolerance_us: DEFAULT_ANCHOR_JITTER_TOLERANCE_US,
        }
    }
}

impl ClockConfig {
    /// Configuration for the clock's private looper.
    pub fn looper_config(&self) -> LooperConfig {
        LooperConfig {
            name: self.looper_name.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found at {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clock.anchor_jitter_tolerance_us < 0 {
            return Err(Error::Config(format!(
                "clock.anchor_jitter_tolerance_us must not be negative (got {})",
                self.clock.anchor_jitter_tolerance_us
            )));
        }
        for (key, interval) in [
            ("looper.poll_interval", self.looper.poll_interval),
            ("clock.poll_interval", self.clock.poll_interval),
        ] {
            if interval == Some(Duration::ZERO) {
                return Err(Error::Config(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// `Option<Duration>` as a humantime string ("250ms", "1s").
mod duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
