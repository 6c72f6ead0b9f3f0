//! GitHub REST API client.
//!
//! Only the handful of endpoints needed for pinning and maintained-action
//! lookups are covered: commit resolution, tag listing by prefix, and the
//! latest release.

use std::{fmt::Display, str::FromStr};

use async_trait::async_trait;
use reqwest::{
    Response, StatusCode,
    header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, InvalidHeaderValue},
    retry,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::{
    SECUREFLOW_AGENT,
    remote::{SourceControl, TagObject, TagRef},
};

/// Represents different types of GitHub hosts.
#[derive(Clone, Debug, PartialEq)]
pub enum GitHubHost {
    Enterprise(String),
    Standard(String),
}

impl GitHubHost {
    pub fn new(hostname: &str) -> Result<Self, String> {
        let normalized = hostname.to_lowercase();

        // Catch the most likely mistake: a URL instead of a bare domain.
        if normalized.starts_with("https://") || normalized.starts_with("http://") {
            return Err("must be a domain name, not a URL".into());
        }

        if normalized == "github.com" || normalized.ends_with(".ghe.com") {
            Ok(Self::Standard(hostname.into()))
        } else {
            Ok(Self::Enterprise(hostname.into()))
        }
    }

    fn to_api_host(&self) -> String {
        match self {
            Self::Enterprise(host) => host.clone(),
            Self::Standard(host) => format!("api.{host}"),
        }
    }

    fn to_api_url(&self) -> String {
        match self {
            Self::Enterprise(_) => format!("https://{host}/api/v3", host = self.to_api_host()),
            Self::Standard(_) => format!("https://{host}", host = self.to_api_host()),
        }
    }
}

impl Default for GitHubHost {
    fn default() -> Self {
        Self::Standard("github.com".into())
    }
}

impl Display for GitHubHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enterprise(host) | Self::Standard(host) => write!(f, "{host}"),
        }
    }
}

impl FromStr for GitHubHost {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A sanitized GitHub access token.
#[derive(Clone)]
pub struct GitHubToken(String);

impl GitHubToken {
    pub fn new(token: &str) -> Result<Self, String> {
        let token = token.trim();
        if token.is_empty() {
            return Err("GitHub token cannot be empty".into());
        }
        Ok(Self(token.to_owned()))
    }

    fn to_header_value(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", self.0))
    }
}

/// Errors that can occur while using the GitHub API client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An error originating from the underlying HTTP client.
    #[error("request error while accessing GitHub API")]
    Request(#[from] reqwest::Error),
    /// An error originating from the HTTP client's middleware.
    #[error("request error while accessing GitHub API")]
    Middleware(#[from] reqwest_middleware::Error),
    /// We couldn't turn the user's token into a valid header value.
    #[error("invalid token header")]
    InvalidTokenHeader(#[from] InvalidHeaderValue),
}

struct LoggingMiddleware;

#[async_trait]
impl reqwest_middleware::Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        tracing::debug!("Request URL: {}", req.url());

        let res = next.run(req, extensions).await?;
        tracing::debug!("Response status: {}", res.status());

        Ok(res)
    }
}

#[derive(Deserialize)]
struct MatchingRef {
    #[serde(rename = "ref")]
    name: String,
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

#[derive(Clone)]
pub struct Client {
    api_base: String,
    api_client: ClientWithMiddleware,
}

impl Client {
    /// Builds a client for `host`, authenticated with `token` if given.
    pub fn new(host: &GitHubHost, token: Option<&GitHubToken>) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(AUTHORIZATION, token.to_header_value()?);
        }
        headers.insert("X-GitHub-Api-Version", "2022-11-28".parse()?);
        headers.insert(ACCEPT, "application/vnd.github+json".parse()?);

        let client = reqwest::Client::builder()
            .user_agent(SECUREFLOW_AGENT)
            .default_headers(headers)
            .retry(
                retry::for_host(host.to_api_host())
                    .max_retries_per_request(3)
                    .no_budget()
                    // "success" here means "don't retry". We only send GETs.
                    .classify_fn(|req_rep| match req_rep.status() {
                        Some(status)
                            if status.is_server_error()
                                || status == StatusCode::TOO_MANY_REQUESTS =>
                        {
                            req_rep.retryable()
                        }
                        _ => req_rep.success(),
                    }),
            )
            .build()?;

        Ok(Self {
            api_base: host.to_api_url(),
            api_client: ClientBuilder::new(client).with(LoggingMiddleware).build(),
        })
    }

    /// Resolves `git_ref` (branch, tag, or commit) to a full commit SHA.
    #[instrument(skip(self))]
    pub async fn commit_sha(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Option<String>, ClientError> {
        let url = format!(
            "{api_base}/repos/{owner}/{repo}/commits/{git_ref}",
            api_base = self.api_base
        );

        let resp = self
            .api_client
            .get(&url)
            .header(ACCEPT, "application/vnd.github.sha")
            .send()
            .await?;

        match resp.error_for_status() {
            Ok(resp) => Ok(Some(resp.text().await?.trim().to_string())),
            Err(e)
                if matches!(
                    e.status(),
                    Some(StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY)
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the tags whose names start with `prefix`, in the order
    /// GitHub returns them.
    #[instrument(skip(self))]
    pub async fn matching_tags(
        &self,
        owner: &str,
        repo: &str,
        prefix: &str,
    ) -> Result<Vec<TagRef>, ClientError> {
        let url = format!(
            "{api_base}/repos/{owner}/{repo}/git/matching-refs/tags/{prefix}",
            api_base = self.api_base
        );

        let resp = self
            .api_client
            .get(&url)
            .query(&[("per_page", "100")])
            .send()
            .await?;

        let refs = match resp.error_for_status() {
            Ok(resp) => resp.json::<Vec<MatchingRef>>().await?,
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => vec![],
            Err(e) => return Err(e.into()),
        };

        Ok(refs
            .into_iter()
            .map(|r| TagRef {
                name: r
                    .name
                    .strip_prefix("refs/tags/")
                    .unwrap_or(&r.name)
                    .to_string(),
                object: match r.object.kind.as_str() {
                    "tag" => TagObject::Annotated(r.object.sha),
                    _ => TagObject::Commit(r.object.sha),
                },
            })
            .collect())
    }

    /// Fetches the tag of the latest published release.
    #[instrument(skip(self))]
    pub async fn latest_release_tag(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Option<String>, ClientError> {
        let url = format!(
            "{api_base}/repos/{owner}/{repo}/releases/latest",
            api_base = self.api_base
        );

        let resp = self.api_client.get(&url).send().await?;

        match resp.error_for_status() {
            Ok(resp) => Ok(Some(resp.json::<Release>().await?.tag_name)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SourceControl for Client {
    async fn resolve_ref(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(self.commit_sha(owner, repo, git_ref).await?)
    }

    async fn list_matching_tags(
        &self,
        owner: &str,
        repo: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<TagRef>> {
        Ok(self.matching_tags(owner, repo, prefix).await?)
    }

    async fn latest_release(&self, owner: &str, repo: &str) -> anyhow::Result<Option<String>> {
        Ok(self.latest_release_tag(owner, repo).await?)
    }
}
