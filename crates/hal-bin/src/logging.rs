//! Tracing subscriber setup.
//!
//! The level and format come from `[logging]` in the HAL configuration. `RUST_LOG`, when
//! set, replaces the configured level filter.

use hal_core::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level emitted
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Colorize output
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Build from the `[logging]` section.
    pub fn from_logging_config(config: &LoggingConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: parse_format(&config.format)?,
            ..Default::default()
        })
    }

    /// Raise the level to DEBUG (or TRACE for two or more).
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        self.level = match verbose {
            0 => self.level,
            1 => self.level.max(Level::DEBUG),
            _ => Level::TRACE,
        };
        self
    }
}

/// Install the global subscriber.
///
/// Calling this when a subscriber is already installed is not an error.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_ascii_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_ansi(config.with_ansi)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn parse_format(format: &str) -> Result<OutputFormat, String> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn from_logging_config() {
        let config = TracingConfig::from_logging_config(&LoggingConfig {
            level: "warn".into(),
            format: "json".into(),
        })
        .unwrap();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);

        assert!(TracingConfig::from_logging_config(&LoggingConfig {
            level: "info".into(),
            format: "xml".into(),
        })
        .is_err());
    }

    #[test]
    fn verbosity_only_raises_the_level() {
        let base = TracingConfig::new_for_test(Level::WARN);
        assert_eq!(base.clone().with_verbosity(0).level, Level::WARN);
        assert_eq!(base.clone().with_verbosity(1).level, Level::DEBUG);
        assert_eq!(base.with_verbosity(3).level, Level::TRACE);

        let chatty = TracingConfig::new_for_test(Level::TRACE);
        assert_eq!(chatty.with_verbosity(1).level, Level::TRACE);
    }

    #[test]
    fn init_is_idempotent() {
        let config = TracingConfig {
            format: OutputFormat::Compact,
            ..Default::default()
        };
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }

    impl TracingConfig {
        fn new_for_test(level: Level) -> Self {
            Self {
                level,
                ..Default::default()
            }
        }
    }
}
