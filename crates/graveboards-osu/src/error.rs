// SPDX-License-Identifier: GPL-3.0-or-later

use chrono::{DateTime, Utc};
use graveboards_infrastructure::cache::CacheError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OsuError>;

#[derive(Debug, Error)]
pub enum OsuError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Rate limit exceeded, next window opens at {retry_at}")]
    RateLimitExceeded { retry_at: DateTime<Utc> },

    #[error("Upstream temporarily unavailable: {0}")]
    Transient(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response from osu! API: {0}")]
    InvalidResponse(String),

    #[error("Rate limit state unavailable: {0}")]
    Cache(#[from] CacheError),
}

impl OsuError {
    /// Whether trying the same call again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(err) => err.is_timeout() || err.is_connect(),
            Self::RateLimitExceeded { .. } | Self::Transient(_) => true,
            Self::NotFound(_) | Self::ApiError { .. } | Self::InvalidResponse(_) | Self::Cache(_) => {
                false
            }
        }
    }

    /// Whether the client should retry in place. An exhausted rate-limit
    /// window is transient but is handed back with its `retry_at` instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::RateLimitExceeded { .. }) && self.is_transient()
    }
}
