//! Loaders for the Quay and Clair YAML configuration files.
//!
//! Only the handful of keys the backstop needs are read; everything else in
//! the files is ignored.

use super::DatabaseConfig;
use crate::auth::DEFAULT_ISSUER;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{SecretSlice, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct QuayYaml {
    #[serde(rename = "DB_URI")]
    db_uri: String,
    #[serde(rename = "DB_CONNECTION_ARGS", default)]
    connection_args: QuayConnectionArgs,
}

#[derive(Debug, Default, Deserialize)]
struct QuayConnectionArgs {
    #[serde(default)]
    ssl: QuaySsl,
}

#[derive(Debug, Default, Deserialize)]
struct QuaySsl {
    ca: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ClairYaml {
    indexer: ClairIndexer,
    #[serde(default)]
    auth: ClairAuth,
}

#[derive(Debug, Deserialize)]
struct ClairIndexer {
    connstring: String,
}

#[derive(Debug, Default, Deserialize)]
struct ClairAuth {
    psk: Option<ClairPsk>,
}

#[derive(Debug, Deserialize)]
struct ClairPsk {
    key: String,
    #[serde(default)]
    iss: Vec<String>,
}

/// What the backstop takes from Clair's configuration.
#[derive(Debug)]
pub struct ClairFile {
    /// Clair's database.
    pub database: DatabaseConfig,
    /// Decoded pre-shared key, if the file has one.
    pub psk: Option<SecretSlice<u8>>,
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("unable to read {}: {e}", path.display())))
}

/// Loads Quay's `config.yaml`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file cannot be read or parsed, or if
/// `DB_URI` is not a PostgreSQL URI.
pub fn load_quay_config(path: &Path) -> Result<DatabaseConfig> {
    let yaml: QuayYaml = serde_yaml_ng::from_str(&read(path)?)
        .map_err(|e| Error::Config(format!("unable to parse {}: {e}", path.display())))?;
    if !yaml.db_uri.starts_with("postgresql://") {
        // Only the scheme is echoed; the rest may carry a password.
        let scheme = yaml.db_uri.split_once("://").map_or("", |(s, _)| s);
        return Err(Error::Config(format!(
            "unrecognized database URI scheme {scheme:?} (only \"postgresql\" is supported)"
        )));
    }
    tracing::debug!(file = %path.display(), "loaded Quay config");
    Ok(DatabaseConfig {
        uri: SecretString::from(yaml.db_uri),
        ca_file: yaml.connection_args.ssl.ca,
    })
}

/// Loads Clair's `config.yaml`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file cannot be read or parsed, or the PSK
/// is not valid base64.
pub fn load_clair_config(path: &Path) -> Result<ClairFile> {
    let yaml: ClairYaml = serde_yaml_ng::from_str(&read(path)?)
        .map_err(|e| Error::Config(format!("unable to parse {}: {e}", path.display())))?;
    let psk = yaml
        .auth
        .psk
        .map(|psk| {
            if !psk.iss.is_empty() && !psk.iss.iter().any(|i| i == DEFAULT_ISSUER) {
                tracing::warn!(
                    accepted = ?psk.iss,
                    issuer = DEFAULT_ISSUER,
                    "Clair does not list the backstop's token issuer"
                );
            }
            STANDARD
                .decode(psk.key.trim())
                .map(SecretSlice::from)
                .map_err(|e| Error::Config(format!("bad PSK in {}: {e}", path.display())))
        })
        .transpose()?;
    tracing::debug!(file = %path.display(), psk = psk.is_some(), "loaded Clair config");
    Ok(ClairFile {
        database: DatabaseConfig {
            uri: SecretString::from(yaml.indexer.connstring),
            ca_file: None,
        },
        psk,
    })
}
