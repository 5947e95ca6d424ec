//! End-to-end pipeline tests over in-memory catalogs.
//!
//! Covers paging order, resumption through the cursor file, exhaustion reset,
//! filter correctness across worker counts, dry-run, cancellation and cursor
//! conflicts.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use common::{MemoryCatalog, RecordingDeleter, digests};
use quay_backstop::pipeline::{DeleteSummary, ManifestPager, MissingFilter};
use quay_backstop::{CursorStore, DeleteMode, Error, PipelineOptions, reconcile};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_case::test_case;
use tokio_util::sync::CancellationToken;

fn options(page_size: usize, page_limit: Option<usize>, workers: usize) -> PipelineOptions {
    PipelineOptions {
        page_size,
        page_limit,
        workers,
    }
}

fn read_cursor(store: &CursorStore) -> String {
    std::fs::read_to_string(store.path()).unwrap()
}

// ============================================================================
// Worked example: a..e with ids 1..5, page size 2, Quay holds {b, d}
// ============================================================================

#[tokio::test]
async fn test_worked_example_pages() {
    let clair = Arc::new(MemoryCatalog::with_digests(&["a", "b", "c", "d", "e"]));
    let (mut pages, finalizer) = ManifestPager::open(clair, 2, None, CancellationToken::new());

    let mut seen = Vec::new();
    while let Some(page) = pages.next().await {
        seen.push((page.token, page.digests));
    }
    assert_eq!(
        seen,
        vec![
            (2, vec!["a".to_string(), "b".to_string()]),
            (4, vec!["c".to_string(), "d".to_string()]),
            (5, vec!["e".to_string()]),
        ]
    );
    assert!(finalizer.progress().exhausted);
    finalizer.finish(true).unwrap();
}

#[tokio::test]
async fn test_worked_example_deletes() {
    let clair = Arc::new(MemoryCatalog::with_digests(&["a", "b", "c", "d", "e"]));
    let quay = Arc::new(MemoryCatalog::with_digests(&["b", "d"]));
    let deleter = Arc::new(RecordingDeleter::default());

    let summary = reconcile(
        clair,
        quay,
        DeleteMode::Live(Arc::clone(&deleter)),
        &options(2, None, 4),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(deleter.deleted(), vec!["a", "c", "e"]);
    // One request per non-empty filtered page.
    assert_eq!(deleter.calls().len(), 3);
    assert_eq!(
        summary,
        DeleteSummary {
            pages: 3,
            checked: 5,
            removable: 3,
            delete_requests: 3,
        }
    );
}

// ============================================================================
// Filter correctness
// ============================================================================

#[test_case(1; "one worker")]
#[test_case(2; "two workers")]
#[test_case(8; "eight workers")]
#[tokio::test]
async fn test_output_is_set_difference(workers: usize) {
    let all = digests(97);
    let present: Vec<String> = all.iter().step_by(3).cloned().collect();
    let expected: BTreeSet<String> = all
        .iter()
        .filter(|d| !present.contains(d))
        .cloned()
        .collect();

    let clair = Arc::new(MemoryCatalog::with_digests(&all));
    let quay = Arc::new(MemoryCatalog::with_digests(&present));
    let (mut out, join) = MissingFilter::open(
        CancellationToken::new(),
        quay,
        ManifestPager::open(clair, 10, None, CancellationToken::new()).0,
        None,
        workers,
    );

    let mut missing = BTreeSet::new();
    let mut pages = 0;
    while let Some(page) = out.next().await {
        pages += 1;
        missing.extend(page.missing);
    }
    join.join().await.unwrap();
    assert_eq!(pages, 10);
    assert_eq!(missing, expected);
}

#[tokio::test]
async fn test_nothing_missing_sends_nothing() {
    let all = digests(25);
    let clair = Arc::new(MemoryCatalog::with_digests(&all));
    let quay = Arc::new(MemoryCatalog::with_digests(&all));
    let deleter = Arc::new(RecordingDeleter::default());

    let summary = reconcile(
        clair,
        quay,
        DeleteMode::Live(Arc::clone(&deleter)),
        &options(10, None, 3),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(deleter.calls().is_empty());
    assert_eq!(summary.checked, 25);
    assert_eq!(summary.removable, 0);
}

#[tokio::test]
async fn test_empty_source_catalog() {
    let clair = Arc::new(MemoryCatalog::default());
    let quay = Arc::new(MemoryCatalog::default());
    let summary = reconcile(
        clair,
        quay,
        DeleteMode::<RecordingDeleter>::DryRun,
        &options(10, None, 2),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(summary, DeleteSummary::default());
}

// ============================================================================
// Dry-run
// ============================================================================

#[tokio::test]
async fn test_dry_run_never_deletes() {
    let all = digests(40);
    let clair = Arc::new(MemoryCatalog::with_digests(&all));
    let quay = Arc::new(MemoryCatalog::default());
    let summary = reconcile(
        clair,
        quay,
        DeleteMode::<RecordingDeleter>::DryRun,
        &options(7, None, 4),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(summary.removable, 40);
    assert_eq!(summary.pages, 6);
}

// ============================================================================
// Cursor handling
// ============================================================================

#[tokio::test]
async fn test_page_limit_persists_cursor_and_resumes() {
    let dir = TempDir::new().unwrap();
    let store = CursorStore::new(dir.path().join("cursor"));
    let all = digests(10);
    let clair = Arc::new(MemoryCatalog::with_digests(&all));
    let quay = Arc::new(MemoryCatalog::default());

    let first = Arc::new(RecordingDeleter::default());
    reconcile(
        Arc::clone(&clair),
        Arc::clone(&quay),
        DeleteMode::Live(Arc::clone(&first)),
        &options(3, Some(2), 2),
        Some(store.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(read_cursor(&store), "6\n");
    assert_eq!(first.deleted().len(), 6);

    let second = Arc::new(RecordingDeleter::default());
    reconcile(
        clair,
        quay,
        DeleteMode::Live(Arc::clone(&second)),
        &options(3, None, 2),
        Some(store.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    // Ran off the end: reset for the next pass.
    assert_eq!(read_cursor(&store), "0\n");

    let mut both: Vec<String> = first.deleted();
    both.extend(second.deleted());
    both.sort();
    let mut expected = all;
    expected.sort();
    assert_eq!(both, expected);
}

#[tokio::test]
async fn test_exhaustion_resets_cursor() {
    let dir = TempDir::new().unwrap();
    let store = CursorStore::new(dir.path().join("cursor"));
    std::fs::write(store.path(), "2\n").unwrap();
    let clair = Arc::new(MemoryCatalog::with_digests(&["a", "b", "c", "d", "e"]));
    let quay = Arc::new(MemoryCatalog::default());

    let summary = reconcile(
        clair,
        quay,
        DeleteMode::<RecordingDeleter>::DryRun,
        &options(2, None, 2),
        Some(store.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(summary.checked, 3);
    assert_eq!(read_cursor(&store), "0\n");
}

#[tokio::test]
async fn test_sparse_ids_resume_after_last_id() {
    let dir = TempDir::new().unwrap();
    let store = CursorStore::new(dir.path().join("cursor"));
    let clair = Arc::new(MemoryCatalog::with_rows([
        (10, "a".to_string()),
        (200, "b".to_string()),
        (3_000, "c".to_string()),
    ]));
    let quay = Arc::new(MemoryCatalog::default());

    reconcile(
        clair,
        quay,
        DeleteMode::<RecordingDeleter>::DryRun,
        &options(1, Some(2), 1),
        Some(store.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(read_cursor(&store), "200\n");
}

#[tokio::test]
async fn test_failed_delete_leaves_cursor_untouched() {
    let dir = TempDir::new().unwrap();
    let store = CursorStore::new(dir.path().join("cursor"));
    std::fs::write(store.path(), "1\n").unwrap();
    let clair = Arc::new(MemoryCatalog::with_digests(&digests(30)));
    let quay = Arc::new(MemoryCatalog::default());
    let deleter = Arc::new(RecordingDeleter::rejecting());

    let err = reconcile(
        clair,
        quay,
        DeleteMode::Live(deleter),
        &options(5, None, 2),
        Some(store.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::DeleteRejected { status: 500, .. }), "got {err:?}");
    assert_eq!(read_cursor(&store), "1\n");
}

#[tokio::test]
async fn test_cursor_conflict_is_reported_and_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let store = CursorStore::new(dir.path().join("cursor"));
    std::fs::write(store.path(), "0\n").unwrap();
    let clair = Arc::new(MemoryCatalog::with_digests(&digests(20)));
    let quay = Arc::new(MemoryCatalog::default());
    let deleter = Arc::new(DeletingWriter {
        path: store.path().to_path_buf(),
    });

    let err = reconcile(
        clair,
        quay,
        DeleteMode::Live(deleter),
        &options(5, Some(2), 1),
        Some(store.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::CursorConflict { .. }), "got {err:?}");
    assert_eq!(read_cursor(&store), "999\n");
}

/// Deleter that rewrites the cursor file behind the pipeline's back.
struct DeletingWriter {
    path: std::path::PathBuf,
}

impl quay_backstop::ManifestDeleter for DeletingWriter {
    async fn delete(&self, _digests: &[String]) -> quay_backstop::Result<()> {
        std::fs::write(&self.path, "999\n").unwrap();
        Ok(())
    }
}

// ============================================================================
// Failure and cancellation
// ============================================================================

#[tokio::test]
async fn test_source_failure_is_reported() {
    let clair = Arc::new(MemoryCatalog::with_digests(&digests(30)).fail_after(2));
    let quay = Arc::new(MemoryCatalog::default());
    let err = reconcile(
        clair,
        quay,
        DeleteMode::<RecordingDeleter>::DryRun,
        &options(5, None, 2),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("querying Clair DB"), "{msg}");
    assert!(msg.contains("injected failure"), "{msg}");
}

#[tokio::test]
async fn test_target_failure_is_reported() {
    let clair = Arc::new(MemoryCatalog::with_digests(&digests(30)));
    let quay = Arc::new(MemoryCatalog::default().fail_after(1));
    let err = reconcile(
        clair,
        quay,
        DeleteMode::<RecordingDeleter>::DryRun,
        &options(5, None, 2),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::OperationFailed { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_cancellation_stops_promptly() {
    let dir = TempDir::new().unwrap();
    let store = CursorStore::new(dir.path().join("cursor"));
    std::fs::write(store.path(), "0\n").unwrap();
    let clair = Arc::new(MemoryCatalog::with_digests(&digests(1_000)));
    // The first page gets through, everything after hangs.
    let quay = Arc::new(MemoryCatalog::default().stall_after(1));
    let deleter = Arc::new(RecordingDeleter::default());
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let deletes = DeleteMode::Live(Arc::clone(&deleter));
        let store = store.clone();
        let cancel = cancel.clone();
        async move {
            reconcile(clair, quay, deletes, &options(10, None, 4), Some(store), cancel).await
        }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while deleter.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();

    let res = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("pipeline did not stop after cancellation")
        .unwrap();
    assert!(matches!(res, Err(Error::Cancelled)), "got {res:?}");
    assert_eq!(read_cursor(&store), "0\n");
}

#[tokio::test]
async fn test_bad_options_are_config_errors() {
    let clair = Arc::new(MemoryCatalog::default());
    let quay = Arc::new(MemoryCatalog::default());
    let err = reconcile(
        clair,
        quay,
        DeleteMode::<RecordingDeleter>::DryRun,
        &options(10, Some(0), 1),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
