//! Subscriber setup for the `tracing` events this crate emits.
//!
//! Breakers, limiters, retries and caches log through `tracing` macros with
//! structured fields (`service`, `attempt`, `delay_ms`, `key`). Applications
//! that do not install their own subscriber can use [`LoggingConfig::init`].

use crate::errors::{ResilienceError, ResilienceResult};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Verbosity threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, including per-attempt and per-entry events
    Trace,
    /// Transitions, rejections and retries
    Debug,
    /// Configuration and reset events
    Info,
    /// Circuits opening and exhausted retries
    Warn,
    /// Failed batched writes
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ResilienceError::configuration(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, ANSI coloured
    Pretty,
    /// One JSON object per event
    Json,
    /// Single line per event
    Compact,
}

impl FromStr for LogFormat {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ResilienceError::configuration(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

/// Settings for the global `tracing` subscriber.
///
/// `RUST_LOG` directives are honoured on top of `level`.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default verbosity
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Prefix events with a timestamp
    pub include_timestamps: bool,
    /// Print the emitting module
    pub include_target: bool,
    /// Print source file and line (pretty format only)
    pub include_file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_timestamps: true,
            include_target: true,
            include_file_line: false,
        }
    }
}

impl LoggingConfig {
    /// Info level, pretty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `RESILIENCE_LOG_LEVEL` and
    /// `RESILIENCE_LOG_FORMAT`.
    pub fn from_env() -> ResilienceResult<Self> {
        let mut config = Self::default();
        if let Ok(level) = std::env::var("RESILIENCE_LOG_LEVEL") {
            config.level = level.parse()?;
        }
        if let Ok(format) = std::env::var("RESILIENCE_LOG_FORMAT") {
            config.format = format.parse()?;
        }
        Ok(config)
    }

    /// Change the level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Change the format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle timestamps
    pub fn with_timestamps(mut self, on: bool) -> Self {
        self.include_timestamps = on;
        self
    }

    /// Toggle module targets
    pub fn with_target(mut self, on: bool) -> Self {
        self.include_target = on;
        self
    }

    /// Toggle file and line
    pub fn with_file_line(mut self, on: bool) -> Self {
        self.include_file_line = on;
        self
    }

    /// Installs the subscriber process-wide. Fails if one is already set.
    pub fn init(self) -> ResilienceResult<()> {
        let filter = EnvFilter::from_default_env().add_directive(LevelFilter::from(self.level).into());

        tracing_subscriber::registry()
            .with(self.fmt_layer())
            .with(filter)
            .try_init()
            .map_err(|e| ResilienceError::configuration(format!("cannot install subscriber: {}", e)))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer().with_target(self.include_target);
        match (self.format, self.include_timestamps) {
            (LogFormat::Json, true) => base.json().boxed(),
            (LogFormat::Json, false) => base.json().without_time().boxed(),
            (LogFormat::Compact, true) => base.compact().boxed(),
            (LogFormat::Compact, false) => base.compact().without_time().boxed(),
            (LogFormat::Pretty, stamped) => {
                let pretty = base
                    .with_ansi(true)
                    .with_file(self.include_file_line)
                    .with_line_number(self.include_file_line);
                if stamped {
                    pretty.boxed()
                } else {
                    pretty.without_time().boxed()
                }
            }
        }
    }
}
