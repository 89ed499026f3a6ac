//! Structured JSONL logging for Q-SYS change group monitoring
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines for log aggregation (default)
//! - **Core Context Injection**: Spans carry the monitored core's name and session id
//! - **Poll Correlation**: Every poll gets an id; scheduled ticks share a schedule id
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use qsys_logging::{LogConfig, QsysSubscriberBuilder};
//!
//! // JSONL to console
//! QsysSubscriberBuilder::new().init();
//!
//! // Pretty human-readable output
//! QsysSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```
//!
//! # Core Context
//!
//! ```ignore
//! use qsys_logging::CoreContextGuard;
//!
//! let _guard = CoreContextGuard::new("Core-110f");
//! tracing::info!("Polling group");
//! ```

pub mod config;
pub mod context;
pub mod correlation;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, FilterConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{CoreContextData, CoreContextGuard};
pub use correlation::{PollCorrelation, PollCorrelationExt, fields, spans};
pub use layers::{CoreContextLayer, jsonl_layer};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid filter directive: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create rolling appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Builder for configuring and installing the logging subscriber
///
/// Console output is JSONL unless `console.pretty` is set. File output,
/// when configured, is always JSONL.
pub struct QsysSubscriberBuilder {
    config: LogConfig,
}

impl QsysSubscriberBuilder {
    /// Builder with the default configuration (JSONL to console)
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Switch between pretty and JSONL console output
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.config.console.pretty = pretty;
        self.config.console.ansi = pretty;
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install the subscriber globally
    ///
    /// Returns the file writer's guard when file output is enabled; keep it
    /// alive for the life of the program or buffered lines are lost.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.filter_directives())?,
        };

        let console = &self.config.console;
        let pretty_console = (console.enabled && console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
        });
        let jsonl_console = (console.enabled && !console.pretty)
            .then(|| jsonl_layer(std::io::stdout, &self.config.jsonl));

        let (file_layer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = file_writer(file_config)?;
                (Some(jsonl_layer(writer, &self.config.jsonl)), Some(guard))
            }
            None => (None, None),
        };

        Registry::default()
            .with(env_filter)
            .with(CoreContextLayer::new())
            .with(pretty_console)
            .with(jsonl_console)
            .with(file_layer)
            .try_init()?;

        Ok(guard)
    }

    /// Install the subscriber, reporting failures on stderr instead of
    /// returning them
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {}", e);
                None
            }
        }
    }
}

impl Default for QsysSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the file writer for `config`; `Never` truncates a single file
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            fs::create_dir_all(&config.directory)?;
            let path = config.directory.join(format!("{}.log", config.prefix));
            let file = File::create(path)?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .filename_suffix("log")
        .build(&config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// JSONL to console with default settings
pub fn init_default() {
    QsysSubscriberBuilder::new().init();
}

/// Pretty, verbose console output
pub fn init_development() {
    QsysSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init();
}

/// Minimal output; safe to call from every test
pub fn init_testing() {
    let _ = QsysSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
