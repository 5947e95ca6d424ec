//! Client for Clair's indexer manifest-deletion endpoint.
//!
//! `DELETE {indexer}/manifest` with a JSON array of digests deletes those
//! manifests from the index. Anything but `200 OK` is a failure; requests are
//! never retried.

use crate::auth::TokenCache;
use crate::backend::{build_http_client, join_path};
use crate::pipeline::ManifestDeleter;
use crate::{Error, ManifestDigest, Result};
use reqwest::{StatusCode, Url};

/// Indexer delete client.
#[derive(Debug)]
pub struct IndexerClient {
    client: reqwest::Client,
    manifest_url: Url,
    tokens: Option<TokenCache>,
}

impl IndexerClient {
    /// Creates a client for the indexer at `base`.
    ///
    /// When `tokens` is set, every request carries a signed bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if `base` cannot carry a path or the HTTP client
    /// cannot be built.
    pub fn new(base: &Url, tokens: Option<TokenCache>) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            manifest_url: join_path(base, "manifest")?,
            tokens,
        })
    }

    /// URL delete requests are sent to.
    #[must_use]
    pub const fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }
}

impl ManifestDeleter for IndexerClient {
    async fn delete(&self, digests: &[ManifestDigest]) -> Result<()> {
        let mut request = self.client.delete(self.manifest_url.clone()).json(digests);
        if let Some(tokens) = &self.tokens {
            request = request.bearer_auth(tokens.get()?);
        }
        tracing::debug!(
            url = %self.manifest_url,
            auth = self.tokens.is_some(),
            count = digests.len(),
            "constructed request"
        );

        let response = request
            .send()
            .await
            .map_err(|e| Error::operation("indexer_delete", e))?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "indexer rejected delete");
            return Err(Error::DeleteRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
