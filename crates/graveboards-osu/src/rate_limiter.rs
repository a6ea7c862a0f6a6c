// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use chrono::{DateTime, Utc};
use graveboards_config::RateLimitConfig;
use graveboards_infrastructure::cache::SharedCache;
use graveboards_infrastructure::clock::Clock;
use tokio::time::{sleep, Duration};
use tracing::{trace, warn};

use crate::error::{OsuError, Result};

/// Fixed-window rate limiter shared by every process talking to one upstream.
///
/// Each window is a counter `rate_limit:{channel}:{window_start}` in the
/// shared cache, incremented once per call and left to expire one second
/// after the window closes. Calls beyond the budget wait for the next window,
/// or fail with [`OsuError::RateLimitExceeded`] when auto-retry is off.
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn SharedCache>,
    clock: Arc<dyn Clock>,
    channel: String,
    limit_per_window: u64,
    window: Duration,
    auto_retry: bool,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("channel", &self.channel)
            .field("limit_per_window", &self.limit_per_window)
            .field("window", &self.window)
            .field("auto_retry", &self.auto_retry)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        clock: Arc<dyn Clock>,
        channel: impl Into<String>,
        limit_per_window: u64,
        window: Duration,
    ) -> Self {
        Self {
            cache,
            clock,
            channel: channel.into(),
            limit_per_window,
            window,
            auto_retry: true,
        }
    }

    pub fn from_config(
        cache: Arc<dyn SharedCache>,
        clock: Arc<dyn Clock>,
        channel: impl Into<String>,
        config: &RateLimitConfig,
    ) -> Self {
        Self::new(
            cache,
            clock,
            channel,
            config.limit_per_window,
            Duration::from_secs(config.window_seconds),
        )
        .auto_retry(config.auto_retry)
    }

    /// Sleep through exhausted windows instead of returning an error.
    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    /// Count one call against the current window, waiting if it is full.
    pub async fn acquire(&self) -> Result<()> {
        let window_secs = self.window.as_secs().max(1) as i64;

        loop {
            let now = self.clock.now();
            let ts = now.timestamp();
            let window_start = ts - ts.rem_euclid(window_secs);
            let window_end = window_start + window_secs;
            let key = format!("rate_limit:{}:{}", self.channel, window_start);

            let count = self.cache.incr(&key).await?;
            if count == 1 {
                let remaining = (window_end - ts) as u64 + 1;
                self.cache.expire(&key, Duration::from_secs(remaining)).await?;
            }

            if count <= self.limit_per_window as i64 {
                trace!(target: "rate_limiter", channel = %self.channel, count, "call admitted");
                return Ok(());
            }

            let retry_at: DateTime<Utc> = DateTime::from_timestamp(window_end, 0).unwrap_or(now);
            if !self.auto_retry {
                return Err(OsuError::RateLimitExceeded { retry_at });
            }

            let wait = (retry_at - now).to_std().unwrap_or(Duration::ZERO);
            warn!(
                target: "rate_limiter",
                channel = %self.channel,
                count,
                limit = self.limit_per_window,
                wait_ms = wait.as_millis() as u64,
                "rate limit reached, waiting for next window"
            );
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use graveboards_infrastructure::cache::InMemoryCache;
    use graveboards_infrastructure::clock::ManualClock;
    use tokio::time::Instant;

    fn setup(limit: u64) -> (Arc<InMemoryCache>, Arc<ManualClock>, RateLimiter) {
        let cache = Arc::new(InMemoryCache::new());
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(base));
        let limiter = RateLimiter::new(
            cache.clone(),
            clock.clone(),
            "osu",
            limit,
            Duration::from_secs(60),
        );
        (cache, clock, limiter)
    }

    #[tokio::test(start_paused = true)]
    async fn calls_within_budget_do_not_wait() {
        let (cache, _clock, limiter) = setup(3);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        let key = "rate_limit:osu:1704067200";
        assert_eq!(cache.get(key).await.unwrap().as_deref(), Some("3"));
        assert_eq!(cache.ttl(key), Some(Duration::from_secs(61)));
    }

    #[tokio::test(start_paused = true)]
    async fn call_over_budget_waits_for_next_window() {
        let (cache, _clock, limiter) = setup(3);
        let start = Instant::now();

        for _ in 0..4 {
            limiter.acquire().await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(
            cache.get("rate_limit:osu:1704067260").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn call_over_budget_errors_without_auto_retry() {
        let (_cache, _clock, limiter) = setup(2);
        let limiter = limiter.auto_retry(false);

        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();

        match err {
            OsuError::RateLimitExceeded { retry_at } => {
                assert_eq!(retry_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mid_window_start_expires_with_the_window() {
        let (cache, clock, limiter) = setup(10);
        clock.advance(std::time::Duration::from_secs(45));

        limiter.acquire().await.unwrap();
        assert_eq!(
            cache.ttl("rate_limit:osu:1704067200"),
            Some(Duration::from_secs(16))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn windows_are_shared_between_limiters_on_the_same_channel() {
        let (cache, clock, first) = setup(1);
        let second = RateLimiter::new(cache.clone(), clock, "osu", 1, Duration::from_secs(60))
            .auto_retry(false);

        first.acquire().await.unwrap();
        assert!(matches!(
            second.acquire().await,
            Err(OsuError::RateLimitExceeded { .. })
        ));
    }
}
