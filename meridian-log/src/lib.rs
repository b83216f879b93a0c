//! Meridian Logging
//!
//! Installs a `tracing` subscriber configured from the environment. Every
//! Meridian crate logs through the `tracing` macros with structured fields;
//! this crate only decides where those records go and how they look.
//!
//! # Usage
//!
//! ```rust,no_run
//! use meridian_log::LogConfig;
//!
//! meridian_log::init(&LogConfig::from_env());
//! tracing::info!(service = "billing", "Service started");
//! ```
//!
//! # Environment Variables
//!
//! - `MERIDIAN_DEBUG=1` - Enable debug logging
//! - `MERIDIAN_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `MERIDIAN_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `MERIDIAN_LOG_COLOR=1|0` - Enable/disable ANSI colors
//! - `RUST_LOG` - Full `EnvFilter` directive; overrides the level when set

use std::env;
use std::fmt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for Meridian logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Trace level (most verbose)
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level (least verbose)
    Error,
    /// Off (no logging)
    Off,
}

impl Level {
    /// Parse a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_directive().to_uppercase())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines for log shippers
    Json,
}

impl Format {
    /// Parse a format name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether ANSI colors are enabled
    pub color: bool,
    /// Whether to include the event target (module path)
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            color: false,
            target: true,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };

        let debug = flag("MERIDIAN_DEBUG", false);

        let level = lookup("MERIDIAN_LOG_LEVEL")
            .and_then(|s| Level::parse(&s))
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = lookup("MERIDIAN_LOG_FORMAT")
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Json);

        let color_default = lookup("NO_COLOR").is_none() && lookup("TERM").is_some();
        let color = flag("MERIDIAN_LOG_COLOR", color_default) && format != Format::Json;

        Self {
            debug,
            level,
            format,
            color,
            target: flag("MERIDIAN_LOG_TARGET", true),
        }
    }

    /// Set the log level.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the output format.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable colors.
    pub fn color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Build the `EnvFilter` for this config. `RUST_LOG` wins when present.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.effective_level().as_directive()))
    }

    fn effective_level(&self) -> Level {
        if self.debug && self.level > Level::Debug {
            Level::Debug
        } else {
            self.level
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Error returned when a global subscriber is already installed.
#[derive(Debug, thiserror::Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct InitError(String);

/// Install the global subscriber, ignoring an already-installed one.
///
/// Safe to call from every binary entry point and from tests.
pub fn init(config: &LogConfig) {
    if let Err(err) = try_init(config) {
        tracing::debug!(error = %err, "Logging already initialized");
    }
}

/// Install the global subscriber.
pub fn try_init(config: &LogConfig) -> Result<(), InitError> {
    let filter = config.env_filter();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        Format::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.color)
                    .with_target(config.target),
            )
            .try_init(),
        Format::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.color)
                    .with_target(config.target),
            )
            .try_init(),
        #[cfg(feature = "json")]
        Format::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(config.target),
            )
            .try_init(),
        #[cfg(not(feature = "json"))]
        Format::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_target(config.target),
            )
            .try_init(),
    };

    result.map_err(|e| InitError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("invalid"), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("pretty"), Some(Format::Pretty));
        assert_eq!(Format::parse("Compact"), Some(Format::Compact));
        assert_eq!(Format::parse("json"), Some(Format::Json));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn test_defaults_without_env() {
        let config = LogConfig::from_lookup(|_| None);
        assert_eq!(config.level, Level::Info);
        assert_eq!(config.format, Format::Json);
        assert!(!config.debug);
        assert!(!config.color);
    }

    #[test]
    fn test_debug_flag_lowers_level() {
        let config = LogConfig::from_lookup(lookup(&[("MERIDIAN_DEBUG", "true")]));
        assert!(config.debug);
        assert_eq!(config.level, Level::Debug);

        let config = LogConfig::from_lookup(lookup(&[
            ("MERIDIAN_DEBUG", "1"),
            ("MERIDIAN_LOG_LEVEL", "warn"),
        ]));
        assert_eq!(config.level, Level::Warn);
        assert_eq!(config.effective_level(), Level::Debug);
    }

    #[test]
    fn test_json_never_colored() {
        let config = LogConfig::from_lookup(lookup(&[
            ("MERIDIAN_LOG_COLOR", "1"),
            ("MERIDIAN_LOG_FORMAT", "json"),
        ]));
        assert!(!config.color);

        let config = LogConfig::from_lookup(lookup(&[
            ("MERIDIAN_LOG_COLOR", "1"),
            ("MERIDIAN_LOG_FORMAT", "compact"),
        ]));
        assert!(config.color);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default().format(Format::Compact);
        init(&config);
        init(&config);
        assert!(try_init(&config).is_err());
    }
}
