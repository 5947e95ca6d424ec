//! GABI query gateway backend.
//!
//! Wire protocol: `POST {endpoint}/query` with `{"query": "<sql>"}`; the
//! answer is `{"error": "", "result": [[columns…], [row…], …]}` where the
//! first row names the columns.

use super::{QueryBackend, Rows, Statement};
use crate::{Error, Result};
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// User agent sent with every outbound request.
pub const USER_AGENT: &str = concat!("quay-backstop/", env!("CARGO_PKG_VERSION"));

/// Where and how to reach a gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Base URL of the gateway.
    pub endpoint: Url,
    /// Pre-shared bearer token, if the gateway wants one.
    pub token: Option<SecretString>,
}

/// Request body.
#[derive(Debug, Serialize)]
struct GatewayQuery<'a> {
    query: &'a str,
}

/// Response body.
#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    result: Vec<Vec<String>>,
}

/// Backend relaying literal SQL through a GABI instance.
#[derive(Debug)]
pub struct GatewayBackend {
    client: reqwest::Client,
    query_url: Url,
    token: Option<SecretString>,
}

impl GatewayBackend {
    /// Creates a gateway backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot carry a path or the HTTP client
    /// cannot be built.
    pub fn new(settings: GatewaySettings) -> Result<Self> {
        let client = build_http_client()?;
        Ok(Self {
            client,
            query_url: join_path(&settings.endpoint, "query")?,
            token: settings.token,
        })
    }

    /// URL queries are posted to.
    #[must_use]
    pub const fn query_url(&self) -> &Url {
        &self.query_url
    }
}

impl QueryBackend for GatewayBackend {
    async fn query(&self, statement: &Statement<'_>) -> Result<Rows> {
        let text = statement.literal()?;
        tracing::trace!(query = %text, url = %self.query_url, "gateway query");

        let mut request = self
            .client
            .post(self.query_url.clone())
            .json(&GatewayQuery { query: &text });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        tracing::debug!(url = %self.query_url, auth = self.token.is_some(), "constructed request");

        let response = request.send().await.map_err(|e| {
            Error::operation("gateway_query", format!("unable to execute query: {e}"))
        })?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::operation(
                "gateway_query",
                format!("unexpected response: {status}"),
            ));
        }
        let body: GatewayResponse = response.json().await.map_err(|e| {
            Error::operation("gateway_query", format!("unable to read response: {e}"))
        })?;
        if !body.error.is_empty() {
            return Err(Error::operation(
                "gateway_query",
                format!("gabi API error: {}", body.error),
            ));
        }

        // Skip the initial value, it's the list of columns.
        let mut rows = body.result;
        if !rows.is_empty() {
            rows.remove(0);
        }
        Ok(rows)
    }

    fn connection_slots(&self) -> Option<usize> {
        Some(1)
    }
}

/// Builds the shared outbound HTTP client.
pub(crate) fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| Error::operation("build_http_client", e))
}

/// Appends one path segment to `base`, tolerating a trailing slash.
pub(crate) fn join_path(base: &Url, segment: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| Error::Config(format!("{base} cannot be used as a base URL")))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}
