//! Shared fixtures for integration tests: in-memory catalogs and a recording
//! deleter.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use quay_backstop::backend::{QueryBackend, Rows, Statement};
use quay_backstop::{Error, ManifestDeleter, ManifestDigest, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A `manifest` table held in memory.
///
/// Answers `ManifestPage` from its `(id, digest)` rows and `AbsentDigests`
/// from the set of digests it holds.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    rows: BTreeMap<i64, ManifestDigest>,
    digests: HashSet<ManifestDigest>,
    queries: AtomicUsize,
    stall_after: Option<usize>,
    fail_after: Option<usize>,
}

impl MemoryCatalog {
    /// A catalog holding `digests` with ids `1..`.
    pub fn with_digests<S: AsRef<str>>(digests: &[S]) -> Self {
        Self::with_rows(
            (1..)
                .zip(digests)
                .map(|(id, d)| (id, d.as_ref().to_string())),
        )
    }

    /// A catalog holding the given rows.
    pub fn with_rows(rows: impl IntoIterator<Item = (i64, ManifestDigest)>) -> Self {
        let rows: BTreeMap<i64, ManifestDigest> = rows.into_iter().collect();
        let digests = rows.values().cloned().collect();
        Self {
            rows,
            digests,
            ..Self::default()
        }
    }

    /// Queries after the first `n` never complete.
    #[must_use]
    pub const fn stall_after(mut self, n: usize) -> Self {
        self.stall_after = Some(n);
        self
    }

    /// Queries after the first `n` fail.
    #[must_use]
    pub const fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Number of queries received.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl QueryBackend for MemoryCatalog {
    async fn query(&self, statement: &Statement<'_>) -> Result<Rows> {
        let n = self.queries.fetch_add(1, Ordering::SeqCst);
        if self.stall_after.is_some_and(|limit| n >= limit) {
            std::future::pending::<()>().await;
        }
        if self.fail_after.is_some_and(|limit| n >= limit) {
            return Err(Error::operation(statement.name(), "injected failure"));
        }
        match *statement {
            Statement::ManifestPage { after, limit } => Ok(self
                .rows
                .range(after + 1..)
                .take(limit)
                .map(|(id, d)| vec![id.to_string(), d.clone()])
                .collect()),
            Statement::AbsentDigests { digests } => Ok(digests
                .iter()
                .filter(|d| !self.digests.contains(*d))
                .map(|d| vec![d.clone()])
                .collect()),
        }
    }
}

/// Deleter that remembers every batch it was given.
#[derive(Debug, Default)]
pub struct RecordingDeleter {
    calls: Mutex<Vec<Vec<ManifestDigest>>>,
    reject: bool,
}

impl RecordingDeleter {
    /// A deleter that answers every call like a 500 from the indexer.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    /// Batches received, in arrival order.
    pub fn calls(&self) -> Vec<Vec<ManifestDigest>> {
        self.calls.lock().unwrap().clone()
    }

    /// Every digest received, sorted.
    pub fn deleted(&self) -> Vec<ManifestDigest> {
        let mut all: Vec<ManifestDigest> = self.calls().into_iter().flatten().collect();
        all.sort();
        all
    }
}

impl ManifestDeleter for RecordingDeleter {
    async fn delete(&self, digests: &[ManifestDigest]) -> Result<()> {
        self.calls.lock().unwrap().push(digests.to_vec());
        if self.reject {
            return Err(Error::DeleteRejected {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(())
    }
}

/// `count` digests named `sha256:0000…` with ids `1..=count`.
pub fn digests(count: usize) -> Vec<ManifestDigest> {
    (0..count).map(|i| format!("sha256:{i:064x}")).collect()
}
