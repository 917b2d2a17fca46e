//! GitHub metadata source: `GET /repos/{owner}/{repo}` via the REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::channels::{MetadataLookup, MetadataSource, RepoMetadata};
use crate::error::ClientError;
use crate::pipeline::links::RepoRef;

const CLIENT_NAME: &str = "github";
const DEFAULT_API_BASE: &str = "https://api.github.com";

/// GitHub API configuration.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_base: String,
    /// Personal access token. Unauthenticated calls get a much smaller quota.
    pub token: Option<SecretString>,
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: None,
            user_agent: concat!("repo-curator/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl GitHubConfig {
    /// Build config from `CURATOR_GITHUB_TOKEN` and `CURATOR_GITHUB_API`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: std::env::var("CURATOR_GITHUB_API").unwrap_or(defaults.api_base),
            token: std::env::var("CURATOR_GITHUB_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            ..defaults
        }
    }
}

/// Repository fields we read from the API response.
#[derive(Debug, Deserialize)]
struct ApiRepository {
    full_name: String,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    archived: bool,
    homepage: Option<String>,
}

impl From<ApiRepository> for RepoMetadata {
    fn from(repo: ApiRepository) -> Self {
        Self {
            full_name: repo.full_name,
            description: repo.description.filter(|d| !d.trim().is_empty()),
            language: repo.language,
            topics: repo.topics,
            stars: repo.stargazers_count,
            archived: repo.archived,
            homepage: repo.homepage.filter(|h| !h.trim().is_empty()),
        }
    }
}

/// Metadata source backed by the GitHub REST API.
pub struct GitHubMetadataSource {
    config: GitHubConfig,
    client: reqwest::Client,
}

impl GitHubMetadataSource {
    pub fn new(config: GitHubConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, repo: &RepoRef) -> String {
        format!(
            "{}/repos/{}",
            self.config.api_base.trim_end_matches('/'),
            repo.full_name()
        )
    }
}

#[async_trait]
impl MetadataSource for GitHubMetadataSource {
    async fn fetch_metadata(&self, key: &str) -> Result<MetadataLookup, ClientError> {
        let Some(repo) = RepoRef::parse(key) else {
            return Err(permanent(format!("not a GitHub repository key: {key}")));
        };

        let mut request = self
            .client
            .get(self.api_url(&repo))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, &self.config.user_agent)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await.map_err(|e| ClientError::Transient {
            client: CLIENT_NAME.into(),
            reason: format!("request failed: {e}"),
        })?;

        let status = resp.status();
        debug!(repo = %repo, status = status.as_u16(), "GitHub metadata response");
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(MetadataLookup::NotFound);
        }
        if !status.is_success() {
            let now = chrono::Utc::now().timestamp();
            return Err(error_for_status(status, resp.headers(), now));
        }

        let body: ApiRepository = resp
            .json()
            .await
            .map_err(|e| permanent(format!("unexpected response body: {e}")))?;
        Ok(MetadataLookup::Found(body.into()))
    }
}

fn permanent(reason: String) -> ClientError {
    ClientError::Permanent {
        client: CLIENT_NAME.into(),
        reason,
    }
}

/// Map a non-success, non-404 response to a client error.
///
/// GitHub signals an exhausted quota with 403 or 429 plus either
/// `retry-after` (secondary limits) or `x-ratelimit-remaining: 0` and an
/// epoch `x-ratelimit-reset`. A 403 without those headers is a real denial.
fn error_for_status(status: StatusCode, headers: &HeaderMap, now_epoch: i64) -> ClientError {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };

    let retry_after = header(RETRY_AFTER.as_str())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let quota_exhausted = header("x-ratelimit-remaining") == Some("0");
    let reset_in = header("x-ratelimit-reset")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|reset| Duration::from_secs(reset.saturating_sub(now_epoch).max(0) as u64));

    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (retry_after.is_some() || quota_exhausted));
    if rate_limited {
        return ClientError::RateLimited {
            client: CLIENT_NAME.into(),
            retry_after: retry_after.or(if quota_exhausted { reset_in } else { None }),
        };
    }

    if status.is_server_error() {
        return ClientError::Transient {
            client: CLIENT_NAME.into(),
            reason: format!("HTTP {status}"),
        };
    }
    permanent(format!("HTTP {status}"))
}
