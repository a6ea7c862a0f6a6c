// SPDX-License-Identifier: GPL-3.0-or-later

use crate::api::{FetchOutcome, OsuApi};
use crate::error::{OsuError, Result};
use crate::models::{OsuBeatmapset, OsuScore, OsuUser, ScoreType};
use crate::rate_limiter::RateLimiter;
use crate::retry::{retry, RetryPolicy};
use graveboards_config::OsuConfig;
use graveboards_domain::{BeatmapsetId, UserId};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};

const OSU_API_BASE: &str = "https://osu.ppy.sh/api/v2";
const USER_AGENT: &str = concat!("graveboards/", env!("CARGO_PKG_VERSION"));

/// osu! API v2 client with shared rate limiting and transient-failure retries.
#[derive(Debug, Clone)]
pub struct OsuClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
    rate_limiter: Option<RateLimiter>,
    retry_policy: RetryPolicy,
}

impl OsuClient {
    /// Create a client builder for custom configuration.
    pub fn builder() -> OsuClientBuilder {
        OsuClientBuilder::default()
    }

    pub fn from_config(config: &OsuConfig) -> OsuClientBuilder {
        let builder = Self::builder()
            .base_url(config.base_url.clone())
            .timeout(Duration::from_secs(config.timeout_seconds));
        match &config.access_token {
            Some(token) => builder.access_token(token.clone()),
            None => builder,
        }
    }

    /// One rate-limited GET, classified into [`OsuError`] variants.
    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await?;
        }

        let url = format!("{}{}", self.base_url, path);
        trace!(target: "osu", "GET {}", url);

        let mut request = self.client.get(&url).query(query);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        debug!(target: "osu", %path, "response status: {}", status);

        if status == StatusCode::NOT_FOUND {
            return Err(OsuError::NotFound(path.to_string()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(OsuError::Transient(format!("{} returned {}", path, status)));
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OsuError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        trace!(target: "osu", "response body: {}", body);

        serde_json::from_str(&body)
            .map_err(|e| OsuError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> FetchOutcome<T> {
        retry(&self.retry_policy, operation, OsuError::is_retryable, || {
            self.get(path, query)
        })
        .await
        .into()
    }
}

#[async_trait::async_trait]
impl OsuApi for OsuClient {
    async fn get_user(&self, user_id: UserId) -> FetchOutcome<OsuUser> {
        let path = format!("/users/{}", user_id);
        self.fetch("get_user", &path, &[("key", "id".to_string())]).await
    }

    async fn get_user_scores(&self, user_id: UserId, kind: ScoreType) -> FetchOutcome<Vec<OsuScore>> {
        let path = format!("/users/{}/scores/{}", user_id, kind.as_str());
        let query = [("limit", "100".to_string()), ("include_fails", "0".to_string())];
        self.fetch("get_user_scores", &path, &query).await
    }

    async fn get_beatmapset(&self, beatmapset_id: BeatmapsetId) -> FetchOutcome<OsuBeatmapset> {
        let path = format!("/beatmapsets/{}", beatmapset_id);
        self.fetch("get_beatmapset", &path, &[]).await
    }
}

/// Builder for configuring an osu! client.
#[derive(Debug)]
pub struct OsuClientBuilder {
    base_url: String,
    access_token: Option<String>,
    timeout: Duration,
    rate_limiter: Option<RateLimiter>,
    retry_policy: RetryPolicy,
}

impl Default for OsuClientBuilder {
    fn default() -> Self {
        Self {
            base_url: OSU_API_BASE.to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
            rate_limiter: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl OsuClientBuilder {
    /// Set a custom base URL (useful for testing with mock servers).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set request timeout duration.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn build(self) -> Result<OsuClient> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(OsuClient {
            client,
            base_url: self.base_url,
            access_token: self.access_token,
            rate_limiter: self.rate_limiter,
            retry_policy: self.retry_policy,
        })
    }
}
