//! Bulk deletes against the indexer.

use super::filter::{FilteredPage, FilteredPages};
use super::group::TaskGroup;
use crate::{Error, ManifestDigest, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Pages between progress reports.
const PROGRESS_EVERY: usize = 10;

/// Capability to delete a batch of manifests from the index.
pub trait ManifestDeleter: Send + Sync {
    /// Deletes `digests` in one request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or is rejected.
    fn delete(&self, digests: &[ManifestDigest]) -> impl Future<Output = Result<()>> + Send;
}

/// Whether deletes are actually issued.
#[derive(Debug)]
pub enum DeleteMode<D> {
    /// Log what would be deleted.
    DryRun,
    /// Send deletes through the given deleter.
    Live(Arc<D>),
}

impl<D> Clone for DeleteMode<D> {
    fn clone(&self) -> Self {
        match self {
            Self::DryRun => Self::DryRun,
            Self::Live(d) => Self::Live(Arc::clone(d)),
        }
    }
}

/// Totals for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    /// Filtered pages consumed.
    pub pages: usize,
    /// Digests checked against the target.
    pub checked: usize,
    /// Digests found absent from the target.
    pub removable: usize,
    /// Delete requests that succeeded (or would have, in dry-run mode).
    pub delete_requests: usize,
}

impl DeleteSummary {
    fn record(&mut self, page: &FilteredPage) {
        self.pages += 1;
        self.checked += page.checked;
        self.removable += page.missing.len();
    }

    fn log(&self) {
        tracing::info!(
            pages = self.pages,
            total = self.checked,
            exists = self.checked.saturating_sub(self.removable),
            removable = self.removable,
            "manifests checked"
        );
    }
}

/// Consumes filtered pages and deletes their digests with `W` workers.
pub struct DeleteIssuer<D> {
    mode: DeleteMode<D>,
    workers: usize,
}

impl<D: ManifestDeleter + 'static> DeleteIssuer<D> {
    /// Creates an issuer with `workers` concurrent requests at most.
    #[must_use]
    pub fn new(mode: DeleteMode<D>, workers: usize) -> Self {
        Self {
            mode,
            workers: workers.max(1),
        }
    }

    /// Drains `pages`, issuing one delete per non-empty page.
    ///
    /// Returns once every page is handled or the run is cancelled. Progress
    /// is logged every few pages and once more at the end.
    ///
    /// # Errors
    ///
    /// Returns the first delete failure, or [`Error::Cancelled`].
    pub async fn run(self, cancel: &CancellationToken, mut pages: FilteredPages) -> Result<DeleteSummary> {
        let (tx, rx) = mpsc::channel::<Vec<ManifestDigest>>(1);
        let rx = Arc::new(Mutex::new(rx));
        let sent = Arc::new(AtomicUsize::new(0));

        let mut group = TaskGroup::new(cancel.clone());
        for worker in 0..self.workers {
            group.spawn(
                "delete",
                Some(worker),
                issue_deletes(
                    cancel.clone(),
                    self.mode.clone(),
                    Arc::clone(&rx),
                    Arc::clone(&sent),
                ),
            );
        }
        drop(rx);

        let mut summary = DeleteSummary::default();
        let read = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(Error::Cancelled),
                page = pages.next() => page,
            };
            let Some(page) = next else {
                break Ok(());
            };
            summary.record(&page);
            if summary.pages % PROGRESS_EVERY == 0 {
                summary.log();
            }
            if page.missing.is_empty() {
                continue;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(Error::Cancelled),
                res = tx.send(page.missing) => if res.is_err() {
                    break Err(Error::Cancelled);
                },
            }
        };
        drop(tx);
        pages.close();
        if summary.pages % PROGRESS_EVERY != 0 {
            summary.log();
        }

        let workers = group.wait().await;
        Error::aggregate([read, workers])?;
        summary.delete_requests = sent.load(Ordering::SeqCst);
        Ok(summary)
    }
}

async fn issue_deletes<D: ManifestDeleter>(
    cancel: CancellationToken,
    mode: DeleteMode<D>,
    batches: Arc<Mutex<mpsc::Receiver<Vec<ManifestDigest>>>>,
    sent: Arc<AtomicUsize>,
) -> Result<()> {
    loop {
        let next = {
            let mut rx = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                rx = batches.lock() => rx,
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                batch = rx.recv() => batch,
            }
        };
        let Some(batch) = next else {
            return Ok(());
        };
        if batch.is_empty() {
            continue;
        }
        match &mode {
            DeleteMode::DryRun => {
                tracing::info!(count = batch.len(), manifests = ?batch, "would delete");
            },
            DeleteMode::Live(deleter) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    res = deleter.delete(&batch) => res?,
                }
                tracing::debug!(count = batch.len(), "deleted manifests");
            },
        }
        sent.fetch_add(1, Ordering::SeqCst);
    }
}
