//! PostgreSQL connection-pool backend.

use super::{QueryBackend, Rows, Statement};
use crate::{Error, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres_rustls::MakeRustlsConnect;

/// How long the first connection may take before the pool is given up on.
const INITIAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How to build a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// `postgresql://` connection URI.
    pub uri: SecretString,
    /// Extra PEM-encoded CA certificates to trust.
    pub ca_file: Option<PathBuf>,
    /// Maximum connections in the pool.
    pub max_size: usize,
}

/// Backend running parameterized statements over a connection pool.
///
/// Each query checks a connection out and returns it when done; no
/// connection is held between queries.
pub struct PooledBackend {
    pool: Pool,
}

impl std::fmt::Debug for PooledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBackend")
            .field("status", &self.pool.status())
            .finish_non_exhaustive()
    }
}

/// Helper to map pool errors.
fn pool_error(e: impl std::fmt::Display) -> Error {
    Error::operation("postgres_get_client", e)
}

impl PooledBackend {
    /// Builds the pool and waits for its first connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI does not parse, the CA file is unusable, or
    /// the first connection fails or takes longer than 10 seconds.
    pub async fn connect(catalog: &str, settings: &PoolSettings) -> Result<Self> {
        let config = settings
            .uri
            .expose_secret()
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::operation("postgres_parse_url", e))?;
        let tls = tls_connector(settings.ca_file.as_deref())?;

        let manager = Manager::from_config(
            config,
            tls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(settings.max_size.max(1))
            .runtime(Runtime::Tokio1)
            .create_timeout(Some(INITIAL_CONNECT_TIMEOUT))
            .build()
            .map_err(|e| Error::operation("postgres_create_pool", e))?;

        match tokio::time::timeout(INITIAL_CONNECT_TIMEOUT, pool.get()).await {
            Ok(Ok(_client)) => {},
            Ok(Err(e)) => return Err(pool_error(e)),
            Err(_) => {
                return Err(Error::operation(
                    "postgres_connect",
                    format!("too slow to do initial connection to {catalog} database"),
                ));
            },
        }
        tracing::debug!(catalog, max_size = settings.max_size, "connected to database");
        Ok(Self { pool })
    }

    /// Closes the pool. Outstanding connections are dropped when returned.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl QueryBackend for PooledBackend {
    async fn query(&self, statement: &Statement<'_>) -> Result<Rows> {
        let op = statement.name();
        let client = self.pool.get().await.map_err(pool_error)?;
        let prepared = client
            .prepare_cached(&statement.sql())
            .await
            .map_err(|e| Error::operation(op, e))?;

        match statement {
            Statement::ManifestPage { after, .. } => {
                let rows = client
                    .query(&prepared, &[after])
                    .await
                    .map_err(|e| Error::operation(op, e))?;
                rows.iter()
                    .map(|row| {
                        let id: i64 = row.try_get(0).map_err(|e| Error::operation(op, e))?;
                        let hash: String = row.try_get(1).map_err(|e| Error::operation(op, e))?;
                        Ok(vec![id.to_string(), hash])
                    })
                    .collect()
            },
            Statement::AbsentDigests { digests } => {
                let rows = client
                    .query(&prepared, &[digests])
                    .await
                    .map_err(|e| Error::operation(op, e))?;
                rows.iter()
                    .map(|row| {
                        let digest: String = row.try_get(0).map_err(|e| Error::operation(op, e))?;
                        Ok(vec![digest])
                    })
                    .collect()
            },
        }
    }

    fn connection_slots(&self) -> Option<usize> {
        Some(self.pool.status().max_size)
    }
}

/// Builds the TLS connector: web PKI roots plus any CAs from `ca_file`.
fn tls_connector(ca_file: Option<&Path>) -> Result<MakeRustlsConnect> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = ca_file {
        let added = add_pem_roots(&mut roots, path)?;
        tracing::debug!(file = %path.display(), count = added, "added database CA certificates");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::operation("postgres_tls_config", e))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

/// Adds every certificate in a PEM file to `roots`.
fn add_pem_roots(roots: &mut rustls::RootCertStore, path: &Path) -> Result<usize> {
    let unusable = |cause: String| Error::Config(format!("CA file {}: {cause}", path.display()));
    let mut added = 0;
    for cert in CertificateDer::pem_file_iter(path).map_err(|e| unusable(e.to_string()))? {
        let cert = cert.map_err(|e| unusable(e.to_string()))?;
        roots.add(cert).map_err(|e| unusable(e.to_string()))?;
        added += 1;
    }
    if added == 0 {
        return Err(unusable(
            "no certificates found (is it PEM encoded CA certificate(s)?)".to_string(),
        ));
    }
    Ok(added)
}
