//! Recorder configuration using Figment.
//!
//! Configuration is loaded from a TOML file and then overridden by
//! environment variables prefixed with `RECORDER_`. Nested keys are separated
//! by a double underscore:
//!
//! ```text
//! RECORDER_APPLICATION__LOG_LEVEL=debug
//! RECORDER_STORAGE__OUTPUT_DIR=/srv/daq
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_recorder::config::RecorderConfig;
//!
//! let config = RecorderConfig::load_from("config/recorder.toml")?;
//! for task in config.tasks()? {
//!     println!("{} -> {} every {:?}", task.id, task.table, task.interval);
//! }
//! # Ok::<(), daq_recorder::error::RecorderError>(())
//! ```

use crate::command::{fs740, Arg, ReplyShape};
use crate::error::{AppResult, RecorderError};
use crate::recorder::{IdentityCheck, MeasurementPlan, RecorderTask};
use crate::sink::StorageBackend;
use crate::transport::TransportConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/recorder.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RECORDER_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Directory for file-based backends.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            output_dir: default_output_dir(),
        }
    }
}

/// One polled instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier
    pub id: String,
    /// Human-readable name; defaults to the id
    #[serde(default)]
    pub label: Option<String>,
    /// Time-series table that receives this device's records
    pub table: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Value the identity query must return
    pub expected_identity: String,
    /// Field of the comma-separated identity reply to compare; whole reply if unset
    #[serde(default)]
    pub identity_field: Option<usize>,
    pub transport: TransportConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
}

/// The command polled every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Catalog command name
    #[serde(default = "default_measurement_command")]
    pub command: String,
    /// Arguments by parameter name; omitted parameters take their defaults
    #[serde(default)]
    pub args: BTreeMap<String, Arg>,
    /// Field names for the reply values, in reply order
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            command: default_measurement_command(),
            args: BTreeMap::new(),
            fields: default_fields(),
        }
    }
}

fn default_name() -> String {
    "daq_recorder".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend() -> StorageBackend {
    StorageBackend::Csv
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_enabled() -> bool {
    true
}

fn default_measurement_command() -> String {
    "measure_frequency".to_string()
}

fn default_fields() -> Vec<String> {
    vec!["frequency".to_string()]
}

impl RecorderConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file, apply `RECORDER_` overrides and validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    ///
    /// Every measurement command is built once here, so argument errors are
    /// reported before anything is sent to an instrument.
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(RecorderError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(RecorderError::Configuration(
                    "Device id cannot be empty".to_string(),
                ));
            }
            if !ids.insert(&device.id) {
                return Err(RecorderError::Configuration(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }
            self.validate_device(device)?;
        }

        Ok(())
    }

    fn validate_device(&self, device: &DeviceConfig) -> AppResult<()> {
        let invalid = |reason: String| {
            RecorderError::Configuration(format!("Device '{}': {}", device.id, reason))
        };

        if device.table.trim().is_empty() {
            return Err(invalid("'table' cannot be empty".to_string()));
        }
        if device.interval.is_zero() {
            return Err(invalid("'interval' must be greater than zero".to_string()));
        }
        if device.expected_identity.trim().is_empty() {
            return Err(invalid("'expected_identity' cannot be empty".to_string()));
        }
        if device.transport.timeout().is_zero() {
            return Err(invalid("transport 'timeout' must be greater than zero".to_string()));
        }
        match &device.transport {
            TransportConfig::Serial { path, baud_rate, .. } => {
                if path.is_empty() {
                    return Err(invalid("serial 'path' cannot be empty".to_string()));
                }
                if *baud_rate == 0 {
                    return Err(invalid("serial 'baud_rate' must be > 0".to_string()));
                }
            }
            TransportConfig::Tcp { host, port, .. } => {
                if host.is_empty() {
                    return Err(invalid("tcp 'host' cannot be empty".to_string()));
                }
                if *port == 0 {
                    return Err(invalid("tcp 'port' must be > 0".to_string()));
                }
            }
        }

        let measurement = &device.measurement;
        let command = fs740::catalog().get(&measurement.command).ok_or_else(|| {
            invalid(format!("unknown measurement command '{}'", measurement.command))
        })?;
        if !command.is_query() || command.reply_shape() == ReplyShape::Text {
            return Err(invalid(format!(
                "'{}' does not return numeric values",
                measurement.command
            )));
        }

        if measurement.fields.is_empty() {
            return Err(invalid("measurement 'fields' cannot be empty".to_string()));
        }
        let mut names = HashSet::new();
        for field in &measurement.fields {
            if field.trim().is_empty() || !names.insert(field) {
                return Err(invalid(format!("invalid or duplicate field name '{}'", field)));
            }
        }
        let expected = match command.reply_shape() {
            ReplyShape::List(count) => count,
            _ => 1,
        };
        if measurement.fields.len() != expected {
            return Err(invalid(format!(
                "'{}' returns {} value(s) but {} field name(s) are configured",
                measurement.command,
                expected,
                measurement.fields.len()
            )));
        }

        command.build_named(&measurement.args)?;
        Ok(())
    }

    /// Resolve every device, enabled or not, into a recorder task. Order
    /// follows the configuration file.
    pub fn tasks(&self) -> AppResult<Vec<RecorderTask>> {
        self.devices.iter().map(DeviceConfig::task).collect()
    }

    pub fn enabled_devices(&self) -> Vec<&DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }
}

impl DeviceConfig {
    /// Resolve the catalog command and build the recorder task.
    pub fn task(&self) -> AppResult<RecorderTask> {
        let command = fs740::catalog()
            .get(&self.measurement.command)
            .cloned()
            .ok_or_else(|| {
                RecorderError::Configuration(format!(
                    "Device '{}': unknown measurement command '{}'",
                    self.id, self.measurement.command
                ))
            })?;

        Ok(RecorderTask {
            id: self.id.clone(),
            label: self.label.clone().unwrap_or_else(|| self.id.clone()),
            table: self.table.clone(),
            interval: self.interval,
            enabled: self.enabled,
            identity: IdentityCheck::new(self.expected_identity.clone(), self.identity_field),
            measurement: MeasurementPlan::new(
                command,
                self.measurement.args.clone(),
                self.measurement.fields.clone(),
            ),
        })
    }
}
