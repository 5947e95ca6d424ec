//! Run configuration.
//!
//! [`BackstopConfig`] is assembled by the binary from flags, environment
//! variables and the Quay and Clair configuration files, then checked once by
//! [`BackstopConfig::validate`] before anything connects anywhere.

mod files;

pub use files::{ClairFile, load_clair_config, load_quay_config};

use crate::backend::{GatewaySettings, PoolSettings};
use crate::{Error, Result};
use reqwest::Url;
use secrecy::{SecretSlice, SecretString};
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Default number of manifests per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Direct database connection details.
#[derive(Debug)]
pub struct DatabaseConfig {
    /// Connection string, URL or `key=value` form.
    pub uri: SecretString,
    /// PEM bundle of extra trusted CAs.
    pub ca_file: Option<PathBuf>,
}

/// How to reach one catalog.
#[derive(Debug, Default)]
pub struct CatalogConfig {
    /// Query gateway base URL.
    pub gateway: Option<Url>,
    /// Bearer token for the gateway.
    pub gateway_auth: Option<SecretString>,
    /// Direct database connection, used when no gateway is set.
    pub database: Option<DatabaseConfig>,
}

impl CatalogConfig {
    /// Reports whether any backend is configured.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.gateway.is_some() || self.database.is_some()
    }

    /// Splits into backend settings, sizing the pool to `max_size`.
    #[must_use]
    pub fn into_settings(self, max_size: usize) -> (Option<GatewaySettings>, Option<PoolSettings>) {
        let token = self.gateway_auth;
        let gateway = self
            .gateway
            .map(|endpoint| GatewaySettings { endpoint, token });
        let pooled = self.database.map(|db| PoolSettings {
            uri: db.uri,
            ca_file: db.ca_file,
            max_size,
        });
        (gateway, pooled)
    }

    fn log_status(&self, catalog: &str) {
        tracing::debug!(
            catalog,
            enabled = self.gateway.is_some(),
            url = self.gateway.as_ref().map(Url::as_str),
            "gateway"
        );
        tracing::debug!(catalog, provided = self.gateway_auth.is_some(), "gateway auth");
        tracing::debug!(
            catalog,
            provided = self.database.is_some(),
            ca = ?self.database.as_ref().and_then(|db| db.ca_file.as_deref()),
            "database config"
        );
    }
}

/// Everything a run needs.
#[derive(Debug)]
pub struct BackstopConfig {
    /// Log instead of deleting.
    pub dry_run: bool,
    /// Manifests per page.
    pub page_size: usize,
    /// Stop after this many pages. `None` means all.
    pub page_count: Option<usize>,
    /// Concurrent filter and delete workers.
    pub workers: usize,
    /// Cursor file to resume from and write back to.
    pub cursor_file: Option<PathBuf>,
    /// Source catalog.
    pub clair: CatalogConfig,
    /// Target catalog.
    pub quay: CatalogConfig,
    /// Base URL of Clair's indexer API.
    pub indexer_addr: Option<Url>,
    /// HS256 key for indexer tokens.
    pub psk: Option<SecretSlice<u8>>,
}

impl Default for BackstopConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            page_size: DEFAULT_PAGE_SIZE,
            page_count: None,
            workers: default_workers(),
            cursor_file: None,
            clair: CatalogConfig::default(),
            quay: CatalogConfig::default(),
            indexer_addr: None,
            psk: None,
        }
    }
}

/// Available parallelism, or 1 if it cannot be determined.
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

impl BackstopConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a loaded Clair configuration file: its database becomes the
    /// direct Clair backend and its PSK signs indexer tokens.
    pub fn apply_clair_file(&mut self, file: ClairFile) {
        self.clair.database = Some(file.database);
        self.psk = file.psk;
    }

    /// Checks the configuration is sane.
    ///
    /// # Errors
    ///
    /// Returns every problem found, as one [`Error::Config`] or an
    /// [`Error::Aggregate`] of them.
    pub fn validate(&self) -> Result<()> {
        let mut errs: Vec<Result<()>> = Vec::new();
        let mut check = |ok: bool, msg: &str| {
            if !ok {
                errs.push(Err(Error::Config(msg.to_string())));
            }
        };
        check(self.clair.is_configured(), "no Clair config provided");
        check(self.quay.is_configured(), "no Quay config provided");
        check(self.page_count != Some(0), "asked for 0 pages");
        check(self.page_size > 0, "page size must be positive");
        check(self.workers > 0, "worker count must be positive");
        check(
            self.dry_run || self.indexer_addr.is_some(),
            "no indexer address provided (use dry-run mode to skip deletes)",
        );
        Error::aggregate(errs)?;

        if !self.dry_run && self.psk.is_none() {
            tracing::warn!("no Clair PSK available, delete requests will be unauthenticated");
        }
        Ok(())
    }

    /// Logs the configuration at debug level. Secrets are only reported as
    /// present or absent.
    pub fn log_status(&self) {
        tracing::debug!(count = self.page_size, "page size");
        tracing::debug!(count = ?self.page_count, "page count");
        tracing::debug!(count = self.workers, "workers");
        tracing::debug!(
            provided = self.cursor_file.is_some(),
            file = ?self.cursor_file.as_deref(),
            "cursor file"
        );
        self.clair.log_status("Clair");
        self.quay.log_status("Quay");
        tracing::debug!(url = self.indexer_addr.as_ref().map(Url::as_str), "indexer address");
        tracing::debug!(provided = self.psk.is_some(), "indexer PSK");
        tracing::debug!(enabled = self.dry_run, "dry-run mode");
    }
}
