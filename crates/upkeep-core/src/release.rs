use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use upkeep_api::{Asset, CacheMode, ReleaseInfo, ReleaseSource, RepoCoordinates, UpdateError};

use crate::asset::{AssetMatcher, SelectedAsset, select_asset};

const GITHUB_API_BASE: &str = "https://api.github.com";
const DEFAULT_PER_PAGE: u32 = 20;
const RATE_LIMIT_FALLBACK_MINUTES: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

impl From<GitHubRelease> for ReleaseInfo {
    fn from(release: GitHubRelease) -> Self {
        ReleaseInfo {
            published_at: release
                .published_at
                .or(release.created_at)
                .unwrap_or(DateTime::UNIX_EPOCH),
            tag: release.tag_name,
            prerelease: release.prerelease,
            assets: release
                .assets
                .into_iter()
                .map(|asset| Asset {
                    name: asset.name,
                    download_url: asset.browser_download_url,
                    size: asset.size,
                })
                .collect(),
        }
    }
}

#[derive(Clone)]
enum CachedBody {
    Latest(ReleaseInfo),
    Page(Vec<ReleaseInfo>),
}

struct CacheEntry {
    fetched_at: Instant,
    body: CachedBody,
}

/// GitHub releases API client with a per-request response cache.
///
/// Requests are keyed by their URL, so every page of a listing is cached on
/// its own. Quota exhaustion surfaces as [`UpdateError::RateLimitExceeded`];
/// nothing is retried here.
pub struct GithubReleaseClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
    per_page: u32,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl GithubReleaseClient {
    #[must_use]
    pub fn new(client: reqwest::Client, cache_ttl: Duration) -> Self {
        Self {
            client,
            api_base: GITHUB_API_BASE.to_string(),
            token: None,
            per_page: DEFAULT_PER_PAGE,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|token| !token.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, 100);
        self
    }

    fn repo_url(&self, repo: &RepoCoordinates) -> String {
        format!("{}/repos/{}/{}/releases", self.api_base, repo.owner, repo.name)
    }

    fn latest_url(&self, repo: &RepoCoordinates) -> String {
        format!("{}/latest", self.repo_url(repo))
    }

    fn page_url(&self, repo: &RepoCoordinates, page: u32) -> String {
        format!(
            "{}?per_page={}&page={page}",
            self.repo_url(repo),
            self.per_page
        )
    }

    fn cached(&self, key: &str, cache_mode: CacheMode) -> Option<CachedBody> {
        if cache_mode == CacheMode::ForceNetwork {
            return None;
        }
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.body.clone())
    }

    fn store(&self, key: String, body: CachedBody) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                CacheEntry {
                    fetched_at: Instant::now(),
                    body,
                },
            );
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        repo: &RepoCoordinates,
        url: &str,
        operation: &'static str,
    ) -> Result<T, UpdateError> {
        debug!("GET {url}");
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| UpdateError::network_request_from(operation, error))?;

        let status = response.status();
        if let Some(reset_at) = rate_limit_reset(status, response.headers(), Utc::now()) {
            info!("Release API quota exhausted until {reset_at}");
            return Err(UpdateError::RateLimitExceeded { reset_at });
        }

        // Missing or renamed repositories, and repositories without a
        // stable release, answer 404 on `/latest`.
        if status.is_client_error() {
            debug!("{url} answered {status}");
            return Err(UpdateError::ReleaseUnavailable {
                repo: repo.to_string(),
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            let body_snippet = response
                .text()
                .await
                .ok()
                .map(|body| response_snippet(&body, 160))
                .unwrap_or_default();
            return Err(UpdateError::network_request(
                operation,
                format!("HTTP {status}{body_snippet}"),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| UpdateError::network_parse_from(operation, error))
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseClient {
    async fn fetch_releases(
        &self,
        repo: &RepoCoordinates,
        page_count: u32,
        cache_mode: CacheMode,
    ) -> Result<Vec<ReleaseInfo>, UpdateError> {
        let mut releases = Vec::new();

        for page in 1..=page_count.max(1) {
            let url = self.page_url(repo, page);
            let cached = self.cached(&url, cache_mode);
            let page_releases = if let Some(CachedBody::Page(cached)) = cached {
                debug!("Release page cache hit: {url}");
                cached
            } else {
                let raw: Vec<GitHubRelease> = self.get_json(repo, &url, "fetch releases").await?;
                let fetched: Vec<ReleaseInfo> = raw.into_iter().map(ReleaseInfo::from).collect();
                self.store(url, CachedBody::Page(fetched.clone()));
                fetched
            };

            let exhausted = page_releases.len() < self.per_page as usize;
            releases.extend(page_releases);
            if exhausted {
                break;
            }
        }

        releases.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(releases)
    }

    async fn fetch_latest(
        &self,
        repo: &RepoCoordinates,
        cache_mode: CacheMode,
    ) -> Result<ReleaseInfo, UpdateError> {
        let url = self.latest_url(repo);
        if let Some(CachedBody::Latest(cached)) = self.cached(&url, cache_mode) {
            debug!("Latest release cache hit: {url}");
            return Ok(cached);
        }

        let raw: GitHubRelease = self.get_json(repo, &url, "fetch latest release").await?;
        let release = ReleaseInfo::from(raw);
        self.store(url, CachedBody::Latest(release.clone()));
        Ok(release)
    }
}

/// Find the newest stable release of `repo` carrying an asset for this device.
///
/// The latest release is tried first; when it is missing, a pre-release or
/// lacks a matching asset, up to `page_count` pages of the listing are
/// searched.
///
/// # Errors
/// Propagates source errors and returns [`UpdateError::NoMatchingAsset`] when
/// nothing qualifies.
pub async fn find_release(
    source: &dyn ReleaseSource,
    repo: &RepoCoordinates,
    page_count: u32,
    cache_mode: CacheMode,
    matcher: &AssetMatcher,
) -> Result<SelectedAsset, UpdateError> {
    match source.fetch_latest(repo, cache_mode).await {
        Ok(latest) => {
            if let Ok(selected) = select_asset(std::slice::from_ref(&latest), matcher) {
                return Ok(selected);
            }
            debug!(
                "Latest release {} of {repo} has no usable asset, searching {page_count} page(s)",
                latest.tag
            );
        }
        Err(UpdateError::ReleaseUnavailable { status, .. }) => {
            debug!("{repo} has no latest release (HTTP {status}), searching {page_count} page(s)");
        }
        Err(error) => return Err(error),
    }
    let releases = source.fetch_releases(repo, page_count, cache_mode).await?;
    select_asset(&releases, matcher)
}

fn rate_limit_reset(
    status: StatusCode,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    };

    let quota_exhausted = header("x-ratelimit-remaining") == Some("0");
    let retry_after = header("retry-after")
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(TimeDelta::try_seconds)
        .map(|delay| now + delay);

    let limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (quota_exhausted || retry_after.is_some()));
    if !limited {
        return None;
    }

    let reset = header("x-ratelimit-reset")
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    Some(reset.or(retry_after).unwrap_or_else(|| {
        now + TimeDelta::try_minutes(RATE_LIMIT_FALLBACK_MINUTES).unwrap_or_default()
    }))
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}
