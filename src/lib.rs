//! # Quay backstop
//!
//! Propagates Quay's garbage-collection decisions back to Clair.
//!
//! Clair keeps an index of every manifest it has ever been asked about. Quay
//! decides when a manifest is garbage; Clair is never told. This crate walks
//! Clair's manifest table page by page, asks Quay which of those manifests it
//! no longer has, and issues bulk delete requests to Clair's indexer for
//! them.
//!
//! ## Pipeline
//!
//! ```text
//! ManifestPager --pages--> MissingFilter --missing--> DeleteIssuer
//!  (Clair, 1 task)         (Quay, N workers)          (indexer, N workers)
//! ```
//!
//! Either database can be reached through a GABI query gateway or through a
//! direct PostgreSQL pool, see [`backend::Backend`]. A cursor file makes runs
//! resumable, see [`cursor::CursorStore`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use quay_backstop::config::BackstopConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = BackstopConfig::default();
//! quay_backstop::run(config, CancellationToken::new()).await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use std::path::PathBuf;
use thiserror::Error as ThisError;

// Module declarations
pub mod auth;
pub mod backend;
pub mod config;
pub mod cursor;
pub mod indexer;
pub mod observability;
pub mod pipeline;

// Re-exports for convenience
pub use backend::{Backend, QueryBackend, Rows, Statement};
pub use config::BackstopConfig;
pub use cursor::{CursorSnapshot, CursorStore};
pub use pipeline::{DeleteMode, ManifestDeleter, PipelineOptions, reconcile, run};

/// Opaque identifier of a manifest, e.g. `sha256:…`.
pub type ManifestDigest = String;

/// Error type for backstop operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Config` | No backend configured, zero pages requested, bad config files |
/// | `InvalidInput` | A digest cannot be rendered into a gateway query |
/// | `OperationFailed` | Query, transport, pool or decode failures |
/// | `Cursor` | The cursor file cannot be read, parsed or written |
/// | `CursorConflict` | The cursor file changed between load and store |
/// | `DeleteRejected` | The indexer answered a delete with a non-200 status |
/// | `Cancelled` | The run was cancelled by a signal or a failing sibling |
/// | `Aggregate` | More than one stage failed |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The process is not configured sanely. Fatal before any stage starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation against a backend failed.
    ///
    /// Raised when:
    /// - A database query or pool checkout fails
    /// - The query gateway returns a non-200 status or a non-empty `error`
    /// - Returned rows do not have the expected shape
    /// - A pipeline task panics
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The cursor file could not be used.
    #[error("cursor file {}: {cause}", .path.display())]
    Cursor {
        /// Path of the cursor file.
        path: PathBuf,
        /// The underlying cause.
        cause: String,
    },

    /// The cursor file was modified by someone else while running.
    ///
    /// The file is left as found. Cursor state may be inconsistent with what
    /// this run processed.
    #[error(
        "cursor file {} changed while running, not updating (got {found:?}, expected {expected:?})",
        .path.display()
    )]
    CursorConflict {
        /// Path of the cursor file.
        path: PathBuf,
        /// Contents observed at load time.
        expected: String,
        /// Contents observed at store time.
        found: String,
    },

    /// The indexer refused a delete request.
    #[error("indexer rejected delete: {status}: {body}")]
    DeleteRejected {
        /// HTTP status returned by the indexer.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Several independent failures.
    #[error("{}", Joined(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation(operation: &str, cause: impl fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Reports whether this error is only an echo of a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Aggregate(errs) => errs.iter().all(Self::is_cancelled),
            _ => false,
        }
    }

    /// Combines the terminal results of independent stages.
    ///
    /// Cancellations are dropped when a concrete failure is present, since
    /// they only report that some other stage failed first.
    pub fn aggregate<I>(results: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<()>>,
    {
        let mut errs: Vec<Self> = Vec::new();
        for err in results.into_iter().filter_map(std::result::Result::err) {
            match err {
                Self::Aggregate(inner) => errs.extend(inner),
                other => errs.push(other),
            }
        }
        if errs.iter().any(|e| !e.is_cancelled()) {
            errs.retain(|e| !e.is_cancelled());
        } else {
            errs.truncate(1);
        }
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Self::Aggregate(errs)),
        }
    }
}

struct Joined<'a>(&'a [Error]);

impl fmt::Display for Joined<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Result type alias for backstop operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("no Clair config provided".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: no Clair config provided"
        );

        let err = Error::operation("gateway_query", "unexpected response: 502");
        assert_eq!(
            err.to_string(),
            "operation 'gateway_query' failed: unexpected response: 502"
        );

        let err = Error::DeleteRejected {
            status: 403,
            body: String::new(),
        };
        assert_eq!(err.to_string(), "indexer rejected delete: 403: ");
    }

    #[test]
    fn test_aggregate_all_ok() {
        assert!(Error::aggregate([Ok(()), Ok(())]).is_ok());
    }

    #[test]
    fn test_aggregate_drops_cancellation_echoes() {
        let res = Error::aggregate([
            Err(Error::Cancelled),
            Err(Error::DeleteRejected {
                status: 500,
                body: "boom".to_string(),
            }),
            Ok(()),
            Err(Error::Cancelled),
        ]);
        assert!(matches!(res, Err(Error::DeleteRejected { status: 500, .. })));
    }

    #[test]
    fn test_aggregate_only_cancelled() {
        let res = Error::aggregate([Err(Error::Cancelled), Err(Error::Cancelled)]);
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn test_aggregate_keeps_every_failure() {
        let res = Error::aggregate([
            Err(Error::Config("a".to_string())),
            Err(Error::Aggregate(vec![
                Error::Config("b".to_string()),
                Error::Cancelled,
            ])),
        ]);
        let Err(Error::Aggregate(errs)) = res else {
            panic!("expected aggregate, got {res:?}");
        };
        assert_eq!(errs.len(), 2);
        let shown = Error::Aggregate(errs).to_string();
        assert_eq!(
            shown,
            "configuration error: a\nconfiguration error: b"
        );
    }
}
