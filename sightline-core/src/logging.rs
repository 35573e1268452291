//! Logging infrastructure for sightline
//!
//! The library only emits `tracing` events; embedding applications install
//! whatever subscriber they like. `init` is the subscriber the CLI uses: logs
//! are written to `~/.local/state/sightline/sightline.log` following XDG
//! standards.

use crate::config::{Config, LoggingConfig};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the logging system
///
/// Sets up tracing with:
/// - File output to XDG state directory
/// - Daily rotation
/// - Configurable log level via config or RUST_LOG env var
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "sightline.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // A host may already own the global subscriber; keep theirs.
    if tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("global subscriber already installed, file logging not attached");
    }

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Returns the log file path
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

/// Emit a diagnostic that only surfaces at `warn` when the tracker runs with
/// `debug` enabled. Otherwise it stays at `debug` level.
macro_rules! diagnostic {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::warn!(target: "sightline", $($arg)+);
        } else {
            tracing::debug!(target: "sightline", $($arg)+);
        }
    };
}

pub(crate) use diagnostic;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        let path = log_file_path();
        assert!(path.ends_with("sightline.log"));
    }

    #[test]
    fn test_diagnostic_macro_accepts_fields() {
        init_test();
        let debug = true;
        diagnostic!(debug, reason = "test", "diagnostic at warn");
        diagnostic!(!debug, "diagnostic at debug");
    }
}
