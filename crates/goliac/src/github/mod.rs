//! GitHub transport: the minimal REST + GraphQL surface the core consumes.
//!
//! The transport is a black box to everything above it: it owns
//! authentication headers, rate-limit back-off, and retries. Snapshot
//! loading and mutation code only ever see [`GithubTransport`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Method, StatusCode,
    header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, InvalidHeaderValue, RETRY_AFTER},
};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

const GOLIAC_AGENT: &str = concat!("goliac/", env!("CARGO_PKG_VERSION"));

/// Ceiling on cursor/page loops, against runaway pagination.
pub(crate) const MAX_PAGES: usize = 100;

/// Page size used by every list query.
pub(crate) const PAGE_SIZE: usize = 100;

const MAX_ATTEMPTS: u32 = 3;

/// Errors that can occur while talking to GitHub.
#[derive(Debug, Error)]
pub(crate) enum GithubError {
    /// An error originating from the underlying HTTP client.
    #[error("request error while accessing the GitHub API")]
    Request(#[from] reqwest::Error),
    /// A non-success response that survived retries.
    #[error("GitHub returned {status} for {endpoint}")]
    Status {
        status: u16,
        endpoint: String,
        body: String,
    },
    /// The GraphQL layer reported query errors.
    #[error("GraphQL error: {0}")]
    GraphQl(String),
    /// A payload did not decode into the expected shape.
    #[error("malformed GitHub API payload")]
    Decode(#[from] serde_json::Error),
    /// We couldn't turn the token into a valid header value.
    #[error("invalid token header")]
    InvalidTokenHeader(#[from] InvalidHeaderValue),
    /// A list query exceeded the pagination safety ceiling.
    #[error("pagination exceeded {MAX_PAGES} pages for {0}")]
    PaginationOverflow(String),
}

impl GithubError {
    /// Whether the error is a plain 404, which several callers treat as
    /// "absent" rather than as a failure.
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// The transport contract. `call_rest` endpoints are API-relative
/// (`/orgs/{org}/teams`); `query_graphql` returns the raw response body.
#[async_trait]
pub(crate) trait GithubTransport: Send + Sync {
    async fn query_graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<Vec<u8>, GithubError>;

    async fn call_rest(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<u8>, GithubError>;

    /// The token used for git-over-HTTPS pushes.
    async fn access_token(&self) -> Result<String, GithubError>;

    /// Slug of the application this transport authenticates as.
    fn app_slug(&self) -> &str;
}

/// Represents different types of GitHub hosts.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum GithubHost {
    Enterprise(String),
    Standard(String),
}

impl GithubHost {
    pub(crate) fn new(hostname: &str) -> Result<Self, String> {
        let normalized = hostname.to_lowercase();

        // NOTE: ideally we'd do a full domain validity check here.
        // For now, this just checks the most likely kind of user
        // confusion (supplying a URL instead of a bare domain name).
        if normalized.starts_with("https://") || normalized.starts_with("http://") {
            return Err("must be a domain name, not a URL".into());
        }

        if normalized.eq_ignore_ascii_case("github.com") || normalized.ends_with(".ghe.com") {
            Ok(Self::Standard(hostname.into()))
        } else {
            Ok(Self::Enterprise(hostname.into()))
        }
    }

    fn to_api_url(&self) -> String {
        match self {
            Self::Enterprise(host) => format!("https://{host}/api/v3"),
            Self::Standard(host) => format!("https://api.{host}"),
        }
    }

    fn to_graphql_url(&self) -> String {
        match self {
            Self::Enterprise(host) => format!("https://{host}/api/graphql"),
            Self::Standard(host) => format!("https://api.{host}/graphql"),
        }
    }
}

impl Default for GithubHost {
    fn default() -> Self {
        Self::Standard("github.com".into())
    }
}

impl std::str::FromStr for GithubHost {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for GithubHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enterprise(host) | Self::Standard(host) => f.write_str(host),
        }
    }
}

/// The reqwest-backed transport.
pub(crate) struct GithubClient {
    api_base: String,
    graphql_url: String,
    http: reqwest::Client,
    token: String,
    app_slug: String,
}

impl GithubClient {
    pub(crate) fn new(
        host: &GithubHost,
        token: &str,
        app_slug: &str,
    ) -> Result<Self, GithubError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static("2022-11-28"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );

        let http = reqwest::Client::builder()
            .user_agent(GOLIAC_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            api_base: host.to_api_url(),
            graphql_url: host.to_graphql_url(),
            http,
            token: token.to_string(),
            app_slug: app_slug.to_string(),
        })
    }

    /// Sends a request, retrying rate-limit and transient server errors
    /// with a short back-off.
    async fn send(
        &self,
        make_request: impl Fn() -> reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<Vec<u8>, GithubError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = make_request().send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.bytes().await?.to_vec());
            }

            let retryable = status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::FORBIDDEN && is_rate_limited(&response)
                || status.is_server_error();
            if retryable && attempt < MAX_ATTEMPTS {
                let delay = retry_after(&response)
                    .unwrap_or_else(|| Duration::from_secs(2u64.pow(attempt)));
                tracing::debug!(
                    "retrying {endpoint} after {delay:?} (attempt {attempt}, status {status})"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::Status {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
                body,
            });
        }
    }
}

fn is_rate_limited(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0")
        || response.headers().contains_key(RETRY_AFTER)
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl GithubTransport for GithubClient {
    #[instrument(skip(self, variables))]
    async fn query_graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<Vec<u8>, GithubError> {
        let payload = json!({ "query": query, "variables": variables });
        self.send(
            || self.http.post(&self.graphql_url).json(&payload),
            "graphql",
        )
        .await
    }

    #[instrument(skip(self, body))]
    async fn call_rest(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<u8>, GithubError> {
        let url = format!("{base}{endpoint}", base = self.api_base);
        self.send(
            || {
                let mut request = self.http.request(method.clone(), &url);
                if let Some(body) = &body {
                    request = request.json(body);
                }
                request
            },
            endpoint,
        )
        .await
    }

    async fn access_token(&self) -> Result<String, GithubError> {
        Ok(self.token.clone())
    }

    fn app_slug(&self) -> &str {
        &self.app_slug
    }
}

/// Extracts `data` from a GraphQL response body, surfacing query errors.
pub(crate) fn graphql_data<T: DeserializeOwned>(raw: &[u8]) -> Result<T, GithubError> {
    #[derive(serde::Deserialize)]
    struct Envelope<T> {
        data: Option<T>,
        #[serde(default)]
        errors: Vec<GraphQlError>,
    }
    #[derive(serde::Deserialize)]
    struct GraphQlError {
        message: String,
    }

    let envelope: Envelope<T> = serde_json::from_slice(raw)?;
    if !envelope.errors.is_empty() {
        let messages = envelope
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(GithubError::GraphQl(messages));
    }
    envelope
        .data
        .ok_or_else(|| GithubError::GraphQl("response carried no data".into()))
}

/// Collects every page of a REST list endpoint. `endpoint` must not
/// already carry a query string.
pub(crate) async fn rest_paginate(
    transport: &dyn GithubTransport,
    endpoint: &str,
) -> Result<Vec<serde_json::Value>, GithubError> {
    let mut out = Vec::new();
    for page in 1..=MAX_PAGES {
        let paged = format!("{endpoint}?per_page={PAGE_SIZE}&page={page}");
        let raw = transport.call_rest(Method::GET, &paged, None).await?;
        let items: Vec<serde_json::Value> = serde_json::from_slice(&raw)?;
        let done = items.len() < PAGE_SIZE;
        out.extend(items);
        if done {
            return Ok(out);
        }
    }
    Err(GithubError::PaginationOverflow(endpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_host_urls() {
        for (host, api, graphql) in [
            (
                "github.com",
                "https://api.github.com",
                "https://api.github.com/graphql",
            ),
            (
                "corp.ghe.com",
                "https://api.corp.ghe.com",
                "https://api.corp.ghe.com/graphql",
            ),
            (
                "selfhosted.example.com",
                "https://selfhosted.example.com/api/v3",
                "https://selfhosted.example.com/api/graphql",
            ),
        ] {
            let host = GithubHost::new(host).unwrap();
            assert_eq!(host.to_api_url(), api);
            assert_eq!(host.to_graphql_url(), graphql);
        }

        assert!(GithubHost::new("https://github.com").is_err());
    }

    #[test]
    fn graphql_errors_are_surfaced() {
        let raw = br#"{"data": null, "errors": [{"message": "boom"}]}"#;
        let err = graphql_data::<serde_json::Value>(raw).unwrap_err();
        assert!(matches!(err, GithubError::GraphQl(m) if m == "boom"));

        let raw = br#"{"data": {"ok": true}}"#;
        let data: serde_json::Value = graphql_data(raw).unwrap();
        assert_eq!(data["ok"], true);
    }
}
