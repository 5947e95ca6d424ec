//! The reconciliation pipeline.
//!
//! ```text
//!            pages              FilteredPage
//! ManifestPager ---> MissingFilter ---> DeleteIssuer
//!       |              (W workers)       (W workers)
//!   PagerFinalizer --> cursor file
//! ```
//!
//! Stages hand work over single-slot channels, so a slow stage stalls the
//! ones before it instead of buffering. One [`CancellationToken`] is shared
//! by every task of a run: the first failure cancels it and every stage
//! unwinds at its next suspension point. All stage errors are collected, not
//! only the first.

mod deleter;
mod filter;
mod group;
mod pager;

pub use deleter::{DeleteIssuer, DeleteMode, DeleteSummary, ManifestDeleter};
pub use filter::{FilterJoin, FilteredPage, FilteredPages, MissingFilter};
pub use pager::{ManifestPager, Page, PageStream, PagerFinalizer, PagerProgress};

use crate::auth::{TokenCache, TokenPolicy};
use crate::backend::{Backend, QueryBackend};
use crate::config::BackstopConfig;
use crate::cursor::{CursorSnapshot, CursorStore};
use crate::indexer::IndexerClient;
use crate::{Error, Result};
use secrecy::ExposeSecret;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A strictly sequential source of pages.
///
/// Pulls take `&mut self`, so a source can only ever have one consumer.
pub trait PageSource: Send + 'static {
    /// Next page, or `None` once the source is done.
    fn next_page(&mut self) -> impl Future<Output = Option<Page>> + Send;
}

/// Shape of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Manifests per page.
    pub page_size: usize,
    /// Stop after this many pages.
    pub page_limit: Option<usize>,
    /// Workers per concurrent stage.
    pub workers: usize,
}

impl PipelineOptions {
    /// Takes the pipeline shape from a validated configuration.
    #[must_use]
    pub const fn from_config(config: &BackstopConfig) -> Self {
        Self {
            page_size: config.page_size,
            page_limit: config.page_count,
            workers: config.workers,
        }
    }
}

/// Runs one reconciliation pass: pages `source`, filters against `target`
/// and deletes what is missing.
///
/// The cursor, if given, is loaded first and written back only if every
/// stage ran to completion. A failed or cancelled run leaves it as found.
///
/// # Errors
///
/// Returns every stage failure, aggregated.
pub async fn reconcile<S, T, D>(
    source: Arc<S>,
    target: Arc<T>,
    deletes: DeleteMode<D>,
    options: &PipelineOptions,
    cursor: Option<CursorStore>,
    cancel: CancellationToken,
) -> Result<DeleteSummary>
where
    S: QueryBackend + 'static,
    T: QueryBackend + 'static,
    D: ManifestDeleter + 'static,
{
    if options.page_size == 0 || options.page_limit == Some(0) || options.workers == 0 {
        return Err(Error::Config(format!("unusable pipeline options: {options:?}")));
    }
    let cursor = cursor
        .map(|store| store.load().map(|snap| (store, snap)))
        .transpose()?;
    log_start(cursor.as_ref().map(|(_, snap)| snap));

    let (pages, finalizer) =
        ManifestPager::open(source, options.page_size, cursor, cancel.clone());
    let (filtered, filter) =
        MissingFilter::open(cancel.clone(), target, pages, options.page_limit, options.workers);
    let deleted = DeleteIssuer::new(deletes, options.workers)
        .run(&cancel, filtered)
        .await;
    let filtered = filter.join().await;

    let complete = deleted.is_ok() && filtered.is_ok();
    let paged = finalizer.finish(complete);

    let (deleted, summary) = match deleted {
        Ok(summary) => (Ok(()), Some(summary)),
        Err(e) => (Err(e), None),
    };
    Error::aggregate([deleted, paged, filtered])?;
    // Every stage succeeded, so the summary is present.
    summary.ok_or(Error::Cancelled)
}

fn log_start(snapshot: Option<&CursorSnapshot>) {
    match snapshot {
        Some(snap) if snap.existed => tracing::debug!(id = snap.token, "resuming from cursor"),
        Some(_) => tracing::debug!("cursor file does not exist yet, starting from the beginning"),
        None => tracing::debug!("no cursor file, starting from the beginning"),
    }
}

/// Runs the backstop as configured.
///
/// Validates `config`, connects to both catalogs, runs [`reconcile`] and
/// releases the connections.
///
/// # Errors
///
/// Returns configuration errors before connecting anywhere, otherwise
/// every failure of the run, aggregated.
pub async fn run(config: BackstopConfig, cancel: CancellationToken) -> Result<DeleteSummary> {
    config.log_status();
    config.validate()?;
    let options = PipelineOptions::from_config(&config);

    let deletes = if config.dry_run {
        DeleteMode::DryRun
    } else {
        let addr = config
            .indexer_addr
            .as_ref()
            .ok_or_else(|| Error::Config("no indexer address provided".to_string()))?;
        let tokens = config
            .psk
            .as_ref()
            .map(|psk| TokenCache::new(psk.expose_secret(), TokenPolicy::default()));
        DeleteMode::Live(Arc::new(IndexerClient::new(addr, tokens)?))
    };
    let cursor = config.cursor_file.map(CursorStore::new);

    // Clair is only read sequentially by the pager.
    let (gateway, pooled) = config.clair.into_settings(1);
    let clair = Arc::new(Backend::select("Clair", gateway, pooled).await?);
    let (gateway, pooled) = config.quay.into_settings(options.workers);
    let quay = match Backend::select("Quay", gateway, pooled).await {
        Ok(quay) => Arc::new(quay),
        Err(e) => {
            clair.close();
            return Err(e);
        },
    };

    let res = reconcile(
        Arc::clone(&clair),
        Arc::clone(&quay),
        deletes,
        &options,
        cursor,
        cancel,
    )
    .await;
    clair.close();
    quay.close();
    if let Ok(summary) = &res {
        tracing::info!(
            pages = summary.pages,
            total = summary.checked,
            removable = summary.removable,
            requests = summary.delete_requests,
            "run complete"
        );
    }
    res
}
