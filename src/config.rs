//! Configuration System using Figment
//!
//! Strongly-typed settings for the orchestrator and the CLI. Configuration is
//! loaded from:
//! 1. `config/flyscan.toml` (base configuration, every key optional)
//! 2. Environment variables prefixed with `FLYSCAN_`, nested keys separated by `__`
//!    (e.g. `FLYSCAN_MOTION__MIN_DELTA=0.005`)
//!
//! Durations are plain millisecond integers.
//!
//! # Example
//! ```no_run
//! use flyscan::config::FlyScanConfig;
//!
//! let config = FlyScanConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::hardware::axis::ConvergencePolicy;
use crate::hardware::registry::DeviceConfig;

/// Default settings file
pub const DEFAULT_CONFIG_PATH: &str = "config/flyscan.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlyScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Row motion parameters
    #[serde(default)]
    pub motion: MotionConfig,
    /// Pre-roll convergence bounds
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    /// Hardware acknowledgment bounds
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Simulated beamline used by the CLI
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Row motion parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Smallest pre-roll distance
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
    /// Time the fast axis needs to reach fly velocity, in seconds
    #[serde(default = "default_accel_time")]
    pub accel_time_s: f64,
    /// Per-row overhead used in time-remaining estimates, in seconds
    #[serde(default = "default_row_overhead")]
    pub row_overhead_s: f64,
    /// Settle between triggering the detectors and starting the fly move
    #[serde(default = "default_pre_fly_settle")]
    pub pre_fly_settle_ms: u64,
}

/// Pre-roll convergence bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Maximum re-issued moves
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sleep between re-issued move and readback
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Wall-clock bound on the whole loop
    #[serde(default = "default_convergence_timeout")]
    pub timeout_ms: u64,
}

/// Hardware acknowledgment bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Trigger buffer kickoff acknowledgment
    #[serde(default = "default_ack_timeout")]
    pub kickoff_ms: u64,
    /// Trigger buffer complete acknowledgment
    #[serde(default = "default_ack_timeout")]
    pub complete_ms: u64,
    /// Added to twice the expected fly duration to bound the fly wait group
    #[serde(default = "default_fly_margin")]
    pub fly_margin_ms: u64,
}

/// Simulated beamline used by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Preset used when the CLI is not given one
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Detectors added to the preset's default detector
    #[serde(default)]
    pub extra_detectors: Vec<String>,
    /// Devices registered on top of the simulated beamline
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

// Default value functions
fn default_name() -> String {
    "flyscan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_min_delta() -> f64 {
    0.002
}

fn default_accel_time() -> f64 {
    1.0
}

fn default_row_overhead() -> f64 {
    3.8
}

fn default_pre_fly_settle() -> u64 {
    1500
}

fn default_max_attempts() -> u32 {
    50
}

fn default_poll_interval() -> u64 {
    100
}

fn default_convergence_timeout() -> u64 {
    30_000
}

fn default_ack_timeout() -> u64 {
    10_000
}

fn default_fly_margin() -> u64 {
    30_000
}

fn default_preset() -> String {
    "scan_and_fly".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            min_delta: default_min_delta(),
            accel_time_s: default_accel_time(),
            row_overhead_s: default_row_overhead(),
            pre_fly_settle_ms: default_pre_fly_settle(),
        }
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval(),
            timeout_ms: default_convergence_timeout(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            kickoff_ms: default_ack_timeout(),
            complete_ms: default_ack_timeout(),
            fly_margin_ms: default_fly_margin(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            extra_detectors: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl MotionConfig {
    /// Pre-fly settle as a duration
    pub fn pre_fly_settle(&self) -> Duration {
        Duration::from_millis(self.pre_fly_settle_ms)
    }
}

impl ConvergenceConfig {
    /// Convergence bounds for the axis controller
    pub fn policy(&self) -> ConvergencePolicy {
        ConvergencePolicy {
            max_attempts: self.max_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl TimeoutConfig {
    /// Kickoff acknowledgment bound
    pub fn kickoff(&self) -> Duration {
        Duration::from_millis(self.kickoff_ms)
    }

    /// Complete acknowledgment bound
    pub fn complete(&self) -> Duration {
        Duration::from_millis(self.complete_ms)
    }

    /// Fixed part of the fly wait-group bound
    pub fn fly_margin(&self) -> Duration {
        Duration::from_millis(self.fly_margin_ms)
    }
}

impl FlyScanConfig {
    /// Load configuration from `config/flyscan.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix FLYSCAN_
    /// Example: FLYSCAN_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: every key has a default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(FlyScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLYSCAN_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if !(self.motion.min_delta.is_finite() && self.motion.min_delta > 0.0) {
            return Err(format!(
                "Invalid min_delta {}. Must be positive",
                self.motion.min_delta
            ));
        }
        if !(self.motion.accel_time_s.is_finite() && self.motion.accel_time_s >= 0.0) {
            return Err(format!(
                "Invalid accel_time_s {}. Must be non-negative",
                self.motion.accel_time_s
            ));
        }
        if !(self.motion.row_overhead_s.is_finite() && self.motion.row_overhead_s >= 0.0) {
            return Err(format!(
                "Invalid row_overhead_s {}. Must be non-negative",
                self.motion.row_overhead_s
            ));
        }

        if self.convergence.max_attempts == 0 {
            return Err("Invalid max_attempts 0. Must be at least 1".to_string());
        }
        if self.convergence.timeout_ms == 0 {
            return Err("Invalid convergence timeout_ms 0".to_string());
        }
        if self.timeouts.kickoff_ms == 0 || self.timeouts.complete_ms == 0 {
            return Err("Trigger buffer acknowledgment timeouts must be non-zero".to_string());
        }

        let mut ids = std::collections::HashSet::new();
        for device in &self.simulation.devices {
            if !ids.insert(&device.id) {
                return Err(format!("Duplicate device ID: {}", device.id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = FlyScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.motion.min_delta, 0.002);
        assert_eq!(config.motion.pre_fly_settle(), Duration::from_millis(1500));
        assert_eq!(config.convergence.policy(), ConvergencePolicy::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlyScanConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.name, "flyscan");
        assert_eq!(config.timeouts.kickoff_ms, 10_000);
    }

    #[test]
    fn test_partial_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[convergence]
max_attempts = 5

[simulation]
preset = "nano_scan_and_fly"
extra_detectors = ["merlin"]
"#
        )
        .unwrap();

        let config = FlyScanConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.convergence.max_attempts, 5);
        assert_eq!(config.convergence.poll_interval_ms, 100);
        assert_eq!(config.simulation.preset, "nano_scan_and_fly");
        assert_eq!(config.simulation.extra_detectors, ["merlin"]);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = FlyScanConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_motion() {
        let mut config = FlyScanConfig::default();
        config.motion.min_delta = 0.0;
        assert!(config.validate().is_err());

        let mut config = FlyScanConfig::default();
        config.convergence.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
