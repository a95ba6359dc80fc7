//! HAL configuration using Figment.
//!
//! Configuration is loaded once at startup and passed by reference into the components
//! that need it. Sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. a TOML file (`config/hal.toml` unless another path is given)
//! 3. environment variables prefixed with `MEASUREMENT_HAL_`, nested with `__`
//!
//! ```text
//! MEASUREMENT_HAL_WAIT__POLL_QUANTUM_MS=50
//! MEASUREMENT_HAL_KEYSIGHT_DMM__SIMULATE=true
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/hal.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MEASUREMENT_HAL_";

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or parsed.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parsed but are not usable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level HAL configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HalConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Event-wait settings
    #[serde(default)]
    pub wait: WaitConfig,
    /// Reservation collaborator settings
    #[serde(default)]
    pub reservation: ReservationConfig,
    /// Keysight DMM driver settings
    #[serde(default)]
    pub keysight_dmm: KeysightDmmConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Event-wait configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Poll quantum for the event-wait arbiter in milliseconds
    #[serde(default = "default_poll_quantum")]
    pub poll_quantum_ms: u64,
    /// Margin added to a source's settle time to bound its completion wait
    #[serde(default = "default_source_timeout_margin")]
    pub source_timeout_margin_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_quantum_ms: default_poll_quantum(),
            source_timeout_margin_ms: default_source_timeout_margin(),
        }
    }
}

impl WaitConfig {
    /// Poll quantum as a [`Duration`].
    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }

    /// Source completion margin as a [`Duration`].
    pub fn source_timeout_margin(&self) -> Duration {
        Duration::from_millis(self.source_timeout_margin_ms)
    }
}

/// Reservation configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// How long to wait for pins held by other clients (`None` waits indefinitely)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Pin map file describing available sessions
    #[serde(default)]
    pub pin_map: Option<PathBuf>,
}

impl ReservationConfig {
    /// Reservation timeout; `None` waits indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Keysight DMM driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeysightDmmConfig {
    /// Use the simulated instrument instead of real hardware
    #[serde(default)]
    pub simulate: bool,
    /// Address of a remote session server (`host:port`)
    #[serde(default)]
    pub grpc_address: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_quantum() -> u64 {
    100
}

fn default_source_timeout_margin() -> u64 {
    10_000
}

impl HalConfig {
    /// Load configuration from `config/hal.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Layered provider backing [`Self::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(HalConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.wait.poll_quantum_ms == 0 {
            return Err(ConfigError::Invalid(
                "wait.poll_quantum_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(address) = &self.keysight_dmm.grpc_address {
            if address.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "keysight_dmm.grpc_address must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HalConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, HalConfig::default());
        assert_eq!(config.wait.poll_quantum(), Duration::from_millis(100));
        assert_eq!(config.wait.source_timeout_margin(), Duration::from_secs(10));
        assert!(!config.keysight_dmm.simulate);
    }

    #[test]
    #[serial]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[wait]
poll_quantum_ms = 25

[reservation]
timeout_ms = 5000
pin_map = "config/pin_map.toml"

[keysight_dmm]
simulate = true
"#
        )
        .unwrap();

        let config = HalConfig::load_from(file.path()).unwrap();
        assert_eq!(config.wait.poll_quantum_ms, 25);
        assert_eq!(config.wait.source_timeout_margin_ms, 10_000);
        assert_eq!(config.reservation.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(
            config.reservation.pin_map,
            Some(PathBuf::from("config/pin_map.toml"))
        );
        assert!(config.keysight_dmm.simulate);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[keysight_dmm]\nsimulate = false").unwrap();

        std::env::set_var("MEASUREMENT_HAL_KEYSIGHT_DMM__SIMULATE", "true");
        let result = HalConfig::load_from(file.path());
        std::env::remove_var("MEASUREMENT_HAL_KEYSIGHT_DMM__SIMULATE");

        assert!(result.unwrap().keysight_dmm.simulate);
    }

    #[test]
    #[serial]
    fn shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/hal.toml");
        let config = HalConfig::load_from(path).unwrap();
        assert!(config.keysight_dmm.simulate);
        assert_eq!(config.reservation.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(
            config.reservation.pin_map,
            Some(PathBuf::from("config/pin_map.toml"))
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = HalConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = HalConfig::default();
        config.wait.poll_quantum_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HalConfig::default();
        config.keysight_dmm.grpc_address = Some(" ".to_string());
        assert!(config.validate().is_err());
    }
}
