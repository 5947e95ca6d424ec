//! Logging setup.
//!
//! Everything the crate reports goes through `tracing`. [`init`] installs the
//! process-wide subscriber: an [`EnvFilter`] and a single `fmt` layer writing
//! to stderr, pretty or JSON.

use crate::{Error, Result};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingConfig {
    /// Number of `-v` flags: 0 is info, 1 is debug, 2 or more is trace.
    pub verbosity: u8,
    /// Output format.
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Level directive implied by the verbosity.
    #[must_use]
    pub const fn default_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Builds the filter. `RUST_LOG`, when set and valid, wins over the
    /// verbosity.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }
}

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if logging was already initialized, by this function or
/// anything else.
pub fn init(config: LoggingConfig) -> Result<()> {
    if LOGGING_INIT.get().is_some() {
        return Err(Error::operation("logging_init", "logging already initialized"));
    }

    let registry = tracing_subscriber::registry().with(config.filter());
    match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
    }
    .map_err(|e| Error::operation("logging_init", e))?;

    LOGGING_INIT
        .set(())
        .map_err(|()| Error::operation("logging_init", "failed to mark logging initialized"))
}
