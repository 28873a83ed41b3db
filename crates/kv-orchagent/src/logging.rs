//! Logging initialization.
//!
//! The agent logs through `tracing`. The common crate logs through the `log`
//! facade; those records are bridged into the same subscriber.

use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line, for log collectors
    Json,
    /// Human-readable multi-line output
    #[default]
    Pretty,
}

/// Builds the filter: `RUST_LOG` takes precedence over `log_level`.
fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Initialize logging with structured JSON output.
pub fn init_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .init();
}

/// Initialize logging with human-readable (pretty) output.
pub fn init_logging_pretty(log_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .init();
}

/// Initialize logging in the requested format.
pub fn init(format: LogFormat, log_level: &str) {
    match format {
        LogFormat::Json => init_logging(log_level),
        LogFormat::Pretty => init_logging_pretty(log_level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from_str("json", true), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_str("PRETTY", true), Ok(LogFormat::Pretty));
        assert!(LogFormat::from_str("xml", true).is_err());
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
