//! Configuration loading using Figment.
//!
//! Settings are read from:
//! 1. `config/echem.toml` (or an explicit file; a missing file yields defaults)
//! 2. Environment variables prefixed with `ECHEM_`, sections split on `__`
//!
//! ```text
//! ECHEM_APPLICATION__LOG_LEVEL=debug
//! ECHEM_SAFETY__TIMEOUT_MS=30000
//! ECHEM_STORAGE__RESULTS_DIR=/data/results
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{AppResult, EchemError};
use crate::error_recovery::RetryPolicy;
use crate::parameters::ParameterLimits;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/echem.toml";

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where results are persisted
    #[serde(default)]
    pub storage: StorageConfig,
    /// Parameter range table
    #[serde(default)]
    pub limits: ParameterLimits,
    /// Device endpoints
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Digital-twin handshake
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Simulated measurement behaviour
    #[serde(default)]
    pub simulation: SimulationConfig,
}

// =============================================================================
// Sections
// =============================================================================

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Result storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// `results_dir/{id}/results.json` on the local filesystem
    #[default]
    Local,
    /// `prefix/{id}/results.json` in an object store bucket
    ObjectStore,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which uploader the dispatcher uses
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for local results
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Bucket for the object store backend
    #[serde(default)]
    pub bucket: Option<String>,
    /// Key prefix for the object store backend
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            results_dir: default_results_dir(),
            bucket: None,
            prefix: default_prefix(),
        }
    }
}

/// Device endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Liquid-handling robot address
    #[serde(default = "default_robot_ip")]
    pub robot_ip: String,
    /// Robot HTTP port
    #[serde(default = "default_robot_port")]
    pub robot_port: u16,
    /// Arm controller address
    #[serde(default = "default_arm_ip")]
    pub arm_ip: String,
    /// Peripheral board serial port
    #[serde(default = "default_board_port")]
    pub board_port: String,
    /// Peripheral board baud rate
    #[serde(default = "default_board_baud")]
    pub board_baud: u32,
    /// Directory holding custom labware definitions (`{type}.json`)
    #[serde(default = "default_labware_dir")]
    pub labware_dir: PathBuf,
    /// Connection attempts before a backend gives up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay between connection attempts in milliseconds
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            robot_ip: default_robot_ip(),
            robot_port: default_robot_port(),
            arm_ip: default_arm_ip(),
            board_port: default_board_port(),
            board_baud: default_board_baud(),
            labware_dir: default_labware_dir(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
        }
    }
}

impl HardwareConfig {
    /// Retry policy for backend device connections.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts,
            backoff_delay: Duration::from_millis(self.connect_backoff_ms),
        }
    }
}

/// What a confirmed twin move means for the real device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwinPolicy {
    /// The confirmed simulated move stands in for the real one.
    #[default]
    SimulationOnly,
    /// The real move is issued once the twin confirms it.
    CommitAfterConfirm,
}

/// Digital-twin handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Upper bound between checks of the safety channel
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up waiting for a verdict after this long; unset waits forever
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Effect of a CONTINUE verdict
    #[serde(default)]
    pub twin_policy: TwinPolicy,
    /// Node whose actions bypass the twin; unset disables the bypass
    #[serde(default = "default_bootstrap_node")]
    pub bootstrap_node: Option<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: None,
            twin_policy: TwinPolicy::default(),
            bootstrap_node: default_bootstrap_node(),
        }
    }
}

impl SafetyConfig {
    #[allow(missing_docs)]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[allow(missing_docs)]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Simulated measurement behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Sleep for the experiment's nominal duration
    #[serde(default)]
    pub realtime: bool,
    /// Multiplier on nominal durations when `realtime` is set
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    /// Cap on points per scan or recording
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            realtime: false,
            time_scale: default_time_scale(),
            max_points: default_max_points(),
        }
    }
}

// =============================================================================
// Loading and validation
// =============================================================================

impl Settings {
    /// Loads `config/echem.toml` plus environment overrides.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads an explicit file plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ECHEM_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values that parse but make no sense.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(EchemError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.backend == StorageBackend::ObjectStore
            && self.storage.bucket.as_deref().map_or(true, str::is_empty)
        {
            return Err(EchemError::Configuration(
                "storage.bucket is required for the object_store backend".to_string(),
            ));
        }

        self.limits.check().map_err(EchemError::Configuration)?;

        if !(10..=1000).contains(&self.safety.poll_interval_ms) {
            return Err(EchemError::Configuration(format!(
                "safety.poll_interval_ms must be between 10 and 1000, got {}",
                self.safety.poll_interval_ms
            )));
        }
        if self.safety.timeout_ms == Some(0) {
            return Err(EchemError::Configuration(
                "safety.timeout_ms must be positive when set".to_string(),
            ));
        }

        if self.hardware.connect_attempts == 0 {
            return Err(EchemError::Configuration(
                "hardware.connect_attempts must be at least 1".to_string(),
            ));
        }

        if self.simulation.max_points < 2 {
            return Err(EchemError::Configuration(format!(
                "simulation.max_points must be at least 2, got {}",
                self.simulation.max_points
            )));
        }
        if !(self.simulation.time_scale.is_finite() && self.simulation.time_scale >= 0.0) {
            return Err(EchemError::Configuration(
                "simulation.time_scale must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_app_name() -> String {
    "rust_echem".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_prefix() -> String {
    "experiments".to_string()
}

fn default_robot_ip() -> String {
    "100.67.89.154".to_string()
}

fn default_robot_port() -> u16 {
    31950
}

fn default_arm_ip() -> String {
    "192.168.1.233".to_string()
}

fn default_board_port() -> String {
    "COM3".to_string()
}

fn default_board_baud() -> u32 {
    9600
}

fn default_labware_dir() -> PathBuf {
    PathBuf::from("labware")
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_bootstrap_node() -> Option<String> {
    Some("0".to_string())
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_max_points() -> usize {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.safety.bootstrap_node.as_deref(), Some("0"));
        assert_eq!(settings.safety.timeout(), None);
        assert_eq!(settings.storage.results_dir, PathBuf::from("results"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.limits, ParameterLimits::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[limits]
cycles_max = 20

[safety]
timeout_ms = 1500
twin_policy = "commit_after_confirm"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.limits.cycles_max, 20);
        assert_eq!(settings.limits.voltage_max, 2.0);
        assert_eq!(settings.safety.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(settings.safety.twin_policy, TwinPolicy::CommitAfterConfirm);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_object_store_requires_bucket() {
        let mut settings = Settings::default();
        settings.storage.backend = StorageBackend::ObjectStore;
        assert!(settings.validate().is_err());
        settings.storage.bucket = Some("lab-results".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_poll_interval_bounds() {
        let mut settings = Settings::default();
        settings.safety.poll_interval_ms = 5;
        assert!(settings.validate().is_err());
    }
}
