//! Binary entry point for quay-backstop.
//!
//! Ensures Quay's garbage-collection decisions are propagated back to Clair.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{ArgAction, Parser};
use quay_backstop::config::{
    BackstopConfig, CatalogConfig, DEFAULT_PAGE_SIZE, default_workers, load_clair_config,
    load_quay_config,
};
use quay_backstop::observability::{self, LogFormat, LoggingConfig};
use reqwest::Url;
use secrecy::SecretString;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Propagates Quay's GC decisions back to Clair.
///
/// Each catalog is read through a GABI query gateway if one is given, and
/// through a direct database connection from its config file otherwise.
#[derive(Parser, Debug)]
#[command(name = "quay-backstop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print debugging output (-vv for more output).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "BACKSTOP_LOG_FORMAT")]
    log_format: LogFormat,

    /// Dry-run: do not issue delete requests.
    #[arg(short = 'n', long, env = "BACKSTOP_DRY_RUN")]
    dry_run: bool,

    /// Pull pages of SIZE manifests from the Clair database.
    #[arg(long, value_name = "SIZE", default_value_t = DEFAULT_PAGE_SIZE, env = "BACKSTOP_PAGE_SIZE")]
    page_size: usize,

    /// Only process N pages before stopping (default: all).
    #[arg(long, value_name = "N", env = "BACKSTOP_PAGE_COUNT")]
    page_count: Option<usize>,

    /// Resume from FILE and write progress back to it.
    #[arg(long, value_name = "FILE", env = "BACKSTOP_CURSOR_FILE")]
    cursor_file: Option<PathBuf>,

    /// Query the Clair database via the GABI instance at URL.
    #[arg(long, value_name = "URL", env = "BACKSTOP_CLAIR_GABI")]
    clair_gabi: Option<Url>,

    /// Use TOKEN for Clair GABI queries.
    #[arg(long, value_name = "TOKEN", env = "BACKSTOP_CLAIR_GABI_AUTH", hide_env_values = true)]
    clair_gabi_auth: Option<String>,

    /// Load Clair configuration from FILE (database and indexer PSK).
    #[arg(long, value_name = "FILE", env = "BACKSTOP_CLAIR_CONFIG")]
    clair_config: Option<PathBuf>,

    /// Query the Quay database via the GABI instance at URL.
    #[arg(long, value_name = "URL", env = "BACKSTOP_QUAY_GABI")]
    quay_gabi: Option<Url>,

    /// Use TOKEN for Quay GABI queries.
    #[arg(long, value_name = "TOKEN", env = "BACKSTOP_QUAY_GABI_AUTH", hide_env_values = true)]
    quay_gabi_auth: Option<String>,

    /// Load Quay configuration from FILE and connect to its database directly.
    #[arg(long, value_name = "FILE", env = "BACKSTOP_QUAY_CONFIG")]
    quay_config: Option<PathBuf>,

    /// Issue deletes to the Clair indexer at URL.
    #[arg(long, value_name = "URL", env = "BACKSTOP_INDEXER_ADDR")]
    indexer_addr: Option<Url>,

    /// Concurrent workers per stage (default: available parallelism).
    #[arg(long, value_name = "N", env = "BACKSTOP_WORKERS")]
    workers: Option<usize>,
}

impl Cli {
    fn into_config(self) -> quay_backstop::Result<BackstopConfig> {
        let mut config = BackstopConfig {
            dry_run: self.dry_run,
            page_size: self.page_size,
            page_count: self.page_count,
            workers: self.workers.unwrap_or_else(default_workers),
            cursor_file: self.cursor_file,
            clair: CatalogConfig {
                gateway: self.clair_gabi,
                gateway_auth: token("--clair-gabi-auth", self.clair_gabi_auth)?,
                database: None,
            },
            quay: CatalogConfig {
                gateway: self.quay_gabi,
                gateway_auth: token("--quay-gabi-auth", self.quay_gabi_auth)?,
                database: None,
            },
            indexer_addr: self.indexer_addr,
            psk: None,
        };
        if let Some(path) = &self.clair_config {
            config.apply_clair_file(load_clair_config(path)?);
        }
        if let Some(path) = &self.quay_config {
            config.quay.database = Some(load_quay_config(path)?);
        }
        Ok(config)
    }
}

fn token(flag: &str, value: Option<String>) -> quay_backstop::Result<Option<SecretString>> {
    match value {
        Some(v) if v.is_empty() => Err(quay_backstop::Error::Config(format!(
            "empty value for {flag}"
        ))),
        v => Ok(v.map(SecretString::from)),
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            tracing::error!("unable to install signal handlers");
            return;
        };
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT, stopping"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping"),
            () = cancel.cancelled() => return,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "unable to listen for ctrl-c");
                    return;
                }
                tracing::info!("received ctrl-c, stopping");
            },
            () = cancel.cancelled() => return,
        }
    }

    cancel.cancel();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = observability::init(LoggingConfig {
        verbosity: cli.verbose,
        format: cli.log_format,
    }) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    let res = match cli.into_config() {
        Ok(config) => quay_backstop::run(config, cancel.clone()).await.map(|_| ()),
        Err(e) => Err(e),
    };
    // Stops the signal listener if it is still waiting.
    cancel.cancel();
    let _ = signals.await;

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting with error");
            ExitCode::FAILURE
        },
    }
}
