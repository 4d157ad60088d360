//! Tracing subscriber setup for embedding applications
//!
//! The library itself only emits `tracing` events. Applications that want
//! them on stderr call [`init_logging`] once at startup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use thiserror::Error;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Error)]
#[error("failed to install log subscriber: {0}")]
pub struct LoggingError(String);

/// Map a verbosity count to a level name (0=error .. 4+=trace)
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Install a global subscriber writing to stderr
///
/// `RUST_LOG` overrides the verbosity when set.
///
/// # Arguments
/// * `verbosity` - 0=error, 1=warn, 2=info, 3=debug, 4+=trace
/// * `format` - Text or JSON output
pub fn init_logging(verbosity: u8, format: LogFormat) -> Result<(), LoggingError> {
    let level = level_for_verbosity(verbosity);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("swarm_daemon={level},swarm_common={level}"))
    });

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(verbosity >= 3)
                    .with_line_number(verbosity >= 3),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
    };
    result.map_err(|e| LoggingError(e.to_string()))
}

/// Install a subscriber for tests, ignoring an already-installed one
pub fn init_test_logging() {
    let _ = init_logging(2, LogFormat::Text);
}
