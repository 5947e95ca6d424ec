//! Query backends for the Clair and Quay databases.
//!
//! Both databases can be reached two ways:
//!
//! - through a [GABI] query gateway, an HTTP service relaying read-only SQL
//!   ([`GatewayBackend`]);
//! - through a direct PostgreSQL connection pool ([`PooledBackend`]).
//!
//! The pipeline only ever asks two questions, captured by [`Statement`]. Which
//! backend answers them is decided once, by [`Backend::select`], and stays
//! fixed for the run.
//!
//! [GABI]: https://github.com/app-sre/gabi

mod gateway;
mod pooled;

pub use gateway::{GatewayBackend, GatewaySettings, USER_AGENT};
pub(crate) use gateway::{build_http_client, join_path};
pub use pooled::{PoolSettings, PooledBackend};

use crate::{Error, ManifestDigest, Result};
use std::fmt::Write as _;
use std::future::Future;

/// Rows returned by a backend, every column rendered as a string.
///
/// Never contains a header row.
pub type Rows = Vec<Vec<String>>;

/// Query for the manifest catalog, resolved against the `manifest` table of
/// whichever database the backend points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement<'a> {
    /// Next page of Clair's manifest table: `(id, hash)` rows with
    /// `id > after`, ascending, at most `limit` of them.
    ManifestPage {
        /// Exclusive lower bound on the row id.
        after: i64,
        /// Page size.
        limit: usize,
    },
    /// The subset of `digests` absent from Quay's manifest table, one
    /// single-column row per digest.
    AbsentDigests {
        /// Digests to look up.
        digests: &'a [ManifestDigest],
    },
}

/// Parameterized text of [`Statement::AbsentDigests`].
pub const ABSENT_DIGESTS_SQL: &str = "SELECT * FROM unnest($1::TEXT[]) EXCEPT ALL SELECT digest FROM manifest WHERE digest = ANY($1::TEXT[]);";

impl Statement<'_> {
    /// Returns the parameterized SQL for this statement.
    ///
    /// The page size cannot be a bind parameter in every deployment, so it
    /// is formatted into the text.
    #[must_use]
    pub fn sql(&self) -> String {
        match self {
            Self::ManifestPage { limit, .. } => {
                format!("SELECT id, hash FROM manifest WHERE id > $1 ORDER BY id ASC LIMIT {limit};")
            },
            Self::AbsentDigests { .. } => ABSENT_DIGESTS_SQL.to_string(),
        }
    }

    /// Renders the statement as self-contained SQL text, with every parameter
    /// expanded inline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a digest contains a `'`, which would
    /// escape the array literal.
    pub fn literal(&self) -> Result<String> {
        match self {
            Self::ManifestPage { after, .. } => Ok(self.sql().replace("$1", &after.to_string())),
            Self::AbsentDigests { digests } => {
                let array = postgres_array_literal(digests)?;
                Ok(format!(
                    "SELECT * FROM unnest({array}) EXCEPT ALL SELECT digest FROM manifest WHERE digest = ANY({array});"
                ))
            },
        }
    }

    /// Short name used in operation labels and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ManifestPage { .. } => "manifest_page",
            Self::AbsentDigests { .. } => "absent_digests",
        }
    }
}

/// Writes `ARRAY['a','b',…]`.
fn postgres_array_literal(values: &[ManifestDigest]) -> Result<String> {
    let mut out = String::with_capacity(8 + values.iter().map(|v| v.len() + 3).sum::<usize>());
    out.push_str("ARRAY[");
    for (i, v) in values.iter().enumerate() {
        if v.contains('\'') {
            return Err(Error::InvalidInput(format!(
                "digest {v:?} cannot be quoted into a query"
            )));
        }
        if i != 0 {
            out.push(',');
        }
        let _ = write!(out, "'{v}'");
    }
    out.push(']');
    Ok(out)
}

/// Capability to run a [`Statement`] and return its rows.
///
/// Implementations must be safe to call from many tasks at once.
pub trait QueryBackend: Send + Sync {
    /// Runs the statement.
    ///
    /// # Errors
    ///
    /// Returns an error on transport or query failure, or when the result
    /// cannot be decoded into rows.
    fn query(&self, statement: &Statement<'_>) -> impl Future<Output = Result<Rows>> + Send;

    /// Number of queries the backend can serve in parallel, if bounded.
    fn connection_slots(&self) -> Option<usize> {
        None
    }
}

/// A backend chosen at configuration time.
#[derive(Debug)]
pub enum Backend {
    /// HTTP query gateway.
    Gateway(GatewayBackend),
    /// Direct connection pool.
    Pooled(PooledBackend),
}

impl Backend {
    /// Picks the backend for a catalog.
    ///
    /// The gateway is preferred when both are configured. The pool is only
    /// built (and its first connection attempted) when it is the one picked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if neither is configured, or the pool
    /// construction error.
    pub async fn select(
        catalog: &str,
        gateway: Option<GatewaySettings>,
        pooled: Option<PoolSettings>,
    ) -> Result<Self> {
        match (gateway, pooled) {
            (Some(settings), _) => {
                tracing::debug!(catalog, endpoint = %settings.endpoint, "using query gateway");
                Ok(Self::Gateway(GatewayBackend::new(settings)?))
            },
            (None, Some(settings)) => {
                tracing::debug!(catalog, pool_size = settings.max_size, "using direct connection");
                Ok(Self::Pooled(PooledBackend::connect(catalog, &settings).await?))
            },
            (None, None) => Err(Error::Config(format!("no {catalog} backend configured"))),
        }
    }

    /// Releases any pooled connections.
    pub fn close(&self) {
        if let Self::Pooled(pool) = self {
            pool.close();
        }
    }
}

impl QueryBackend for Backend {
    async fn query(&self, statement: &Statement<'_>) -> Result<Rows> {
        match self {
            Self::Gateway(gw) => gw.query(statement).await,
            Self::Pooled(pool) => pool.query(statement).await,
        }
    }

    fn connection_slots(&self) -> Option<usize> {
        match self {
            Self::Gateway(gw) => gw.connection_slots(),
            Self::Pooled(pool) => pool.connection_slots(),
        }
    }
}
