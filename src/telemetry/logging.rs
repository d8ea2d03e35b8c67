//! Logging setup for the CLI and the Lambda handler
//!
//! Console output goes to stderr so that agent answers on stdout stay clean.
//! A daily-rolling file log is added when a log directory is configured.

use crate::error::KitError;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Crates whose output is capped at `warn` regardless of the requested level
const NOISY_TARGETS: [&str; 8] = [
    "aws_smithy_runtime",
    "aws_smithy",
    "aws_config",
    "aws_credential_types",
    "hyper",
    "h2",
    "reqwest",
    "tokio",
];

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level (or full `EnvFilter` directive string) for stderr
    pub console_log_level: String,
    /// Level for the file log
    pub file_log_level: String,
    /// Directory of the daily-rolling log file; `None` disables file logging
    pub log_dir: Option<PathBuf>,
    /// File name prefix inside `log_dir`
    pub file_prefix: String,
    /// Write the file log as JSON lines
    pub json_format: bool,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_log_level: "info".to_string(),
            file_log_level: "debug".to_string(),
            log_dir: None,
            file_prefix: "bedrock-agent-kit.log".to_string(),
            json_format: true,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Read `KIT_LOG_LEVEL`, `KIT_LOG_DIR`, `KIT_FILE_LOGGING` and `KIT_JSON_LOGS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("KIT_LOG_LEVEL") {
            config.console_log_level = level;
        }

        if let Ok(dir) = std::env::var("KIT_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }

        if let Ok(enabled) = std::env::var("KIT_FILE_LOGGING") {
            match enabled.parse::<bool>() {
                Ok(true) if config.log_dir.is_none() => {
                    config.log_dir = Some(PathBuf::from("logs"));
                }
                Ok(false) => config.log_dir = None,
                _ => {}
            }
        }

        if let Ok(json) = std::env::var("KIT_JSON_LOGS") {
            config.json_format = json.parse().unwrap_or(true);
        }

        config
    }

    /// Raise console verbosity by `-v` count (1 = debug, 2+ = trace)
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        match verbose {
            0 => {}
            1 => self.console_log_level = "debug".to_string(),
            _ => self.console_log_level = "trace".to_string(),
        }
        self
    }

    /// Configuration for the Lambda bootstrap: plain stderr lines for CloudWatch
    pub fn lambda() -> Self {
        Self {
            console_log_level: std::env::var("KIT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            ansi: false,
            ..Self::default()
        }
    }
}

/// Keeps the non-blocking file writer flushing until dropped
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build an `EnvFilter` for `level` with the noisy targets capped at `warn`
pub fn build_filter(level: &str) -> Result<EnvFilter, KitError> {
    let mut filter = EnvFilter::try_new(level)
        .map_err(|e| KitError::configuration_error(format!("Invalid log level '{}': {}", level, e)))?;

    for target in NOISY_TARGETS {
        let directive: Directive = format!("{}=warn", target).parse().map_err(|e| {
            KitError::configuration_error(format!("Invalid log directive for {}: {}", target, e))
        })?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber
pub fn init_logging(config: LoggingConfig) -> Result<LoggingGuard, KitError> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(true)
        .with_filter(build_filter(&config.console_log_level)?)
        .boxed();
    layers.push(console_layer);

    let mut file_guard = None;
    if let Some(log_dir) = &config.log_dir {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            KitError::configuration_error(format!("Failed to create log directory: {}", e))
        })?;

        let appender = tracing_appender::rolling::daily(log_dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let timer = tracing_subscriber::fmt::time::ChronoUtc::new(
            "%Y-%m-%d %H:%M:%S%.3f UTC".to_string(),
        );
        let file_filter = build_filter(&config.file_log_level)?;

        let file_layer = if config.json_format {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(timer)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .json()
                .with_filter(file_filter)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(timer)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_filter(file_filter)
                .boxed()
        };
        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| KitError::configuration_error(format!("Logging already initialized: {}", e)))?;

    info!(
        console_level = %config.console_log_level,
        log_dir = ?config.log_dir,
        json_format = config.json_format,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
