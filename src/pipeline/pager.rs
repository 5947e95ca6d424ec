//! Paging over Clair's manifest table.
//!
//! [`ManifestPager::open`] returns a strictly sequential stream of pages and
//! a finalizer. Each pull runs one `id > token ORDER BY id LIMIT size` query
//! and advances the token to the last id seen. A page shorter than the page
//! size is the last one.
//!
//! The finalizer owns the cursor policy: once the stream is drained or
//! abandoned it writes the token back to the cursor file, or `0` if the last
//! page was reached so the next run starts over.

use super::PageSource;
use crate::backend::{QueryBackend, Rows, Statement};
use crate::cursor::{CursorSnapshot, CursorStore};
use crate::{Error, ManifestDigest, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// A bounded, ordered batch of digests from the source catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Row id of the last digest in the page.
    pub token: i64,
    /// Digests in ascending row-id order.
    pub digests: Vec<ManifestDigest>,
}

/// Pager progress, shared between the stream and its finalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagerProgress {
    /// Row id of the last digest handed out.
    pub token: i64,
    /// Whether the last page has been reached.
    pub exhausted: bool,
    /// Pages handed out.
    pub pages: usize,
}

#[derive(Debug, Default)]
struct PagerState {
    progress: PagerProgress,
    error: Option<Error>,
}

fn lock(state: &Mutex<PagerState>) -> MutexGuard<'_, PagerState> {
    // The state is plain data; a panicking holder cannot leave it torn.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry point for paging.
pub struct ManifestPager;

impl ManifestPager {
    /// Opens a page stream over `backend`, resuming after `cursor`'s token if
    /// a cursor is given.
    ///
    /// Errors while paging end the stream, cancel `cancel` and are reported
    /// by [`PagerFinalizer::finish`].
    pub fn open<B: QueryBackend>(
        backend: Arc<B>,
        page_size: usize,
        cursor: Option<(CursorStore, CursorSnapshot)>,
        cancel: CancellationToken,
    ) -> (PageStream<B>, PagerFinalizer) {
        let start = cursor.as_ref().map_or(0, |(_, snap)| snap.token);
        let state = Arc::new(Mutex::new(PagerState {
            progress: PagerProgress {
                token: start,
                ..PagerProgress::default()
            },
            error: None,
        }));
        let stream = PageStream {
            backend,
            page_size,
            token: start,
            done: false,
            cancel,
            state: Arc::clone(&state),
        };
        (stream, PagerFinalizer { state, cursor })
    }
}

/// Lazy stream of [`Page`]s.
///
/// Pulling takes `&mut self`: there is exactly one consumer and pulls are
/// strictly sequential.
pub struct PageStream<B> {
    backend: Arc<B>,
    page_size: usize,
    token: i64,
    done: bool,
    cancel: CancellationToken,
    state: Arc<Mutex<PagerState>>,
}

impl<B: QueryBackend> PageStream<B> {
    /// Pulls the next page, or `None` once the catalog is exhausted or paging
    /// failed.
    pub async fn next(&mut self) -> Option<Page> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.fail(Error::Cancelled);
            return None;
        }

        let after = self.token;
        let statement = Statement::ManifestPage {
            after,
            limit: self.page_size,
        };
        let rows = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            rows = self.backend.query(&statement) => rows,
        };
        let rows = match rows.and_then(|rows| parse_page(after, &rows)) {
            Ok(rows) => rows,
            Err(e) => {
                self.fail(e);
                return None;
            },
        };

        let short = rows.len() < self.page_size;
        let Some(&(last, _)) = rows.last() else {
            tracing::debug!(token = after, "done reading manifests");
            self.finish_exhausted();
            return None;
        };
        self.token = last;
        {
            let mut state = lock(&self.state);
            state.progress.token = last;
            state.progress.pages += 1;
            state.progress.exhausted = short;
        }
        if short {
            tracing::debug!(count = rows.len(), want = self.page_size, "done reading manifests");
            self.done = true;
        }
        tracing::trace!(token = last, count = rows.len(), "page");
        Some(Page {
            token: last,
            digests: rows.into_iter().map(|(_, digest)| digest).collect(),
        })
    }

    fn finish_exhausted(&mut self) {
        self.done = true;
        lock(&self.state).progress.exhausted = true;
    }

    fn fail(&mut self, err: Error) {
        self.done = true;
        if !err.is_cancelled() {
            tracing::error!(error = %err, "paging manifests failed");
        }
        self.cancel.cancel();
        let mut state = lock(&self.state);
        if state.error.is_none() {
            state.error = Some(err);
        }
    }
}

impl<B: QueryBackend + 'static> PageSource for PageStream<B> {
    async fn next_page(&mut self) -> Option<Page> {
        self.next().await
    }
}

/// Decodes `(id, hash)` rows, checking ids strictly increase past `after`.
fn parse_page(after: i64, rows: &Rows) -> Result<Vec<(i64, ManifestDigest)>> {
    let mut last = after;
    rows.iter()
        .map(|row| {
            let [id, digest] = row.as_slice() else {
                return Err(Error::operation(
                    "manifest_page",
                    format!("expected 2 columns, got {}", row.len()),
                ));
            };
            let id: i64 = id.parse().map_err(|e| {
                Error::operation("manifest_page", format!("bad manifest id {id:?}: {e}"))
            })?;
            if id <= last {
                return Err(Error::operation(
                    "manifest_page",
                    format!("manifest id {id} does not follow {last}"),
                ));
            }
            last = id;
            Ok((id, digest.clone()))
        })
        .collect()
}

/// Completes a pager run. Must be called once the stream is drained or
/// dropped; consuming `self` makes a second call impossible.
pub struct PagerFinalizer {
    state: Arc<Mutex<PagerState>>,
    cursor: Option<(CursorStore, CursorSnapshot)>,
}

impl PagerFinalizer {
    /// Current progress.
    #[must_use]
    pub fn progress(&self) -> PagerProgress {
        lock(&self.state).progress.clone()
    }

    /// Reports paging errors and, if `persist` is set and paging succeeded,
    /// writes the cursor.
    ///
    /// An exhausted catalog resets the cursor to `0`.
    ///
    /// # Errors
    ///
    /// Returns the paging error, the cursor write error, or both.
    pub fn finish(self, persist: bool) -> Result<()> {
        let (progress, error) = {
            let mut state = lock(&self.state);
            (state.progress.clone(), state.error.take())
        };
        let paging = match error {
            None => Ok(()),
            Some(e) if e.is_cancelled() => Err(e),
            Some(e) => Err(Error::operation("querying Clair DB", e)),
        };

        let Some((store, snapshot)) = self.cursor else {
            return paging;
        };
        if !persist || paging.is_err() {
            tracing::warn!(
                file = %store.path().display(),
                "run did not complete, leaving cursor untouched"
            );
            return paging;
        }
        let token = if progress.exhausted {
            tracing::info!(id = progress.token, "reached last page, resetting cursor for next run");
            0
        } else {
            progress.token
        };
        let stored = store.store(&snapshot, token);
        if let Err(e) = &stored {
            tracing::error!(error = %e, "unable to write cursor file");
        }
        stored
    }
}
