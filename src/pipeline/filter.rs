//! Concurrent filtering of pages against Quay's manifest table.
//!
//! One reader pulls pages from the pager and hands them to `W` workers over
//! a single-slot channel. Each worker asks the target catalog which digests
//! of its page are absent and emits the answer downstream. Pages are
//! independent, so downstream order is not guaranteed to match page order.

use super::group::TaskGroup;
use super::pager::Page;
use super::PageSource;
use crate::backend::{QueryBackend, Rows, Statement};
use crate::{Error, ManifestDigest, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};

/// The absent digests of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredPage {
    /// Token of the page this came from.
    pub token: i64,
    /// Number of digests checked.
    pub checked: usize,
    /// Digests absent from the target catalog.
    pub missing: Vec<ManifestDigest>,
}

/// Entry point for filtering.
pub struct MissingFilter;

impl MissingFilter {
    /// Starts the reader and workers.
    ///
    /// At most `page_limit` pages are pulled from `pages`, if set. The worker
    /// count is capped by the target's connection slots, so workers never
    /// queue on the backend.
    pub fn open<T, P>(
        cancel: CancellationToken,
        target: Arc<T>,
        pages: P,
        page_limit: Option<usize>,
        workers: usize,
    ) -> (FilteredPages, FilterJoin)
    where
        T: QueryBackend + 'static,
        P: PageSource,
    {
        let workers = target
            .connection_slots()
            .map_or(workers, |slots| workers.min(slots))
            .max(1);
        let (page_tx, page_rx) = mpsc::channel::<Page>(1);
        let (out_tx, out_rx) = mpsc::channel::<FilteredPage>(1);
        let gone = CancellationToken::new();

        let mut group = TaskGroup::new(cancel.clone());
        group.spawn(
            "filter_reader",
            None,
            read_pages(cancel.clone(), gone.clone(), pages, page_limit, page_tx),
        );
        let page_rx = Arc::new(Mutex::new(page_rx));
        for worker in 0..workers {
            group.spawn(
                "filter",
                Some(worker),
                filter_pages(
                    cancel.clone(),
                    gone.clone(),
                    Arc::clone(&target),
                    Arc::clone(&page_rx),
                    out_tx.clone(),
                ),
            );
        }
        tracing::debug!(tasks = group.len(), "filter started");

        (
            FilteredPages {
                rx: out_rx,
                _gone: gone.drop_guard(),
            },
            FilterJoin { group },
        )
    }
}

async fn read_pages<P: PageSource>(
    cancel: CancellationToken,
    gone: CancellationToken,
    mut pages: P,
    page_limit: Option<usize>,
    tx: mpsc::Sender<Page>,
) -> Result<()> {
    let mut read = 0_usize;
    while page_limit.is_none_or(|limit| read < limit) {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = gone.cancelled() => return Ok(()),
            page = pages.next_page() => page,
        };
        let Some(page) = next else {
            return Ok(());
        };
        read += 1;
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = gone.cancelled() => return Ok(()),
            sent = tx.send(page) => if sent.is_err() {
                // Every worker has exited, which only happens on failure.
                return Err(Error::Cancelled);
            },
        }
    }
    tracing::debug!(pages = read, "page limit reached");
    Ok(())
}

async fn filter_pages<T: QueryBackend>(
    cancel: CancellationToken,
    gone: CancellationToken,
    target: Arc<T>,
    pages: Arc<Mutex<mpsc::Receiver<Page>>>,
    tx: mpsc::Sender<FilteredPage>,
) -> Result<()> {
    loop {
        let next = {
            let mut rx = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                rx = pages.lock() => rx,
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                page = rx.recv() => page,
            }
        };
        let Some(page) = next else {
            return Ok(());
        };

        let missing = if page.digests.is_empty() {
            Vec::new()
        } else {
            let statement = Statement::AbsentDigests {
                digests: &page.digests,
            };
            let rows = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                rows = target.query(&statement) => rows?,
            };
            absent_digests(&page.digests, rows)?
        };
        tracing::trace!(token = page.token, missing = missing.len(), "filtered page");

        let out = FilteredPage {
            token: page.token,
            checked: page.digests.len(),
            missing,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = gone.cancelled() => {
                tracing::debug!(token = page.token, "consumer gone, dropping filtered page");
                return Ok(());
            },
            sent = tx.send(out) => if sent.is_err() {
                tracing::debug!(token = page.token, "consumer gone, dropping filtered page");
                return Ok(());
            },
        }
    }
}

/// Decodes single-column rows, checking each digest came from the page.
fn absent_digests(page: &[ManifestDigest], rows: Rows) -> Result<Vec<ManifestDigest>> {
    let asked: HashSet<&str> = page.iter().map(String::as_str).collect();
    rows.into_iter()
        .map(|row| {
            let Ok([digest]) = <[String; 1]>::try_from(row) else {
                return Err(Error::operation("absent_digests", "expected 1 column"));
            };
            if !asked.contains(digest.as_str()) {
                return Err(Error::operation(
                    "absent_digests",
                    format!("unexpected digest {digest:?} in result"),
                ));
            }
            Ok(digest)
        })
        .collect()
}

/// Receiving end of the filter.
///
/// Dropping it tells the filter nobody is listening any more; its tasks then
/// stop without error.
pub struct FilteredPages {
    rx: mpsc::Receiver<FilteredPage>,
    _gone: DropGuard,
}

impl FilteredPages {
    /// Next filtered page, or `None` once every worker is done.
    pub async fn next(&mut self) -> Option<FilteredPage> {
        self.rx.recv().await
    }

    /// Stops consuming.
    pub fn close(self) {}
}

/// Handle on the filter's tasks.
pub struct FilterJoin {
    group: TaskGroup,
}

impl FilterJoin {
    /// Waits for the reader and every worker.
    ///
    /// # Errors
    ///
    /// Returns the first task failure, or [`Error::Cancelled`].
    pub async fn join(self) -> Result<()> {
        self.group.wait().await
    }
}
