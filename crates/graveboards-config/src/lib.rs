// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://graveboards.db".to_string(),
            pool_max_size: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

/// Shared cache and pub/sub bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// What a recurring task does after its handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Leave the task out of the heap until an external reload re-triggers it.
    #[default]
    DropOnFailure,
    /// Push the task back after `retry_delay_seconds`.
    RetryAndReschedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub profile_interval_hours: u64,
    pub score_interval_hours: u64,
    pub mapper_interval_hours: u64,
    pub failure_policy: FailurePolicy,
    pub retry_delay_seconds: u64,
    /// How many times a subscriber re-reads a notified record before giving up.
    pub visibility_attempts: u32,
    pub visibility_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            profile_interval_hours: 24,
            score_interval_hours: 24,
            mapper_interval_hours: 24,
            failure_policy: FailurePolicy::DropOnFailure,
            retry_delay_seconds: 15 * 60,
            visibility_attempts: 5,
            visibility_delay_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn visibility_delay(&self) -> Duration {
        Duration::from_millis(self.visibility_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub limit_per_window: u64,
    pub auto_retry: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            limit_per_window: 60,
            auto_retry: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_seconds: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub ttl_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 10,
            poll_interval_ms: 250,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsuConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for OsuConfig {
    fn default() -> Self {
        Self {
            base_url: "https://osu.ppy.sh/api/v2".to_string(),
            access_token: None,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub lock: LockConfig,
    pub osu: OsuConfig,
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: GRAVEBOARDS_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("GRAVEBOARDS_").split("__"));

    let config: AppConfig = figment.extract()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_source_intervals() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.profile_interval_hours, 24);
        assert_eq!(config.scheduler.failure_policy, FailurePolicy::DropOnFailure);
        assert_eq!(config.rate_limit.window_seconds, 60);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
    }

    #[test]
    fn env_overrides_nested_sections() {
        Jail::expect_with(|jail| {
            jail.set_env("GRAVEBOARDS_SCHEDULER__MAX_CONCURRENT_JOBS", "3");
            jail.set_env("GRAVEBOARDS_SCHEDULER__FAILURE_POLICY", "retry-and-reschedule");
            jail.set_env("GRAVEBOARDS_CACHE__BACKEND", "redis");

            let config = load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.scheduler.max_concurrent_jobs, 3);
            assert_eq!(
                config.scheduler.failure_policy,
                FailurePolicy::RetryAndReschedule
            );
            assert_eq!(config.cache.backend, CacheBackend::Redis);
            Ok(())
        });
    }

    #[test]
    fn toml_file_is_merged_below_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "graveboards.toml",
                r#"
                    [rate_limit]
                    limit_per_window = 10
                    auto_retry = false

                    [lock]
                    ttl_seconds = 30
                "#,
            )?;
            jail.set_env("GRAVEBOARDS_LOCK__TTL_SECONDS", "5");

            let config = load(Some(Path::new("graveboards.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.rate_limit.limit_per_window, 10);
            assert!(!config.rate_limit.auto_retry);
            assert_eq!(config.lock.ttl(), Duration::from_secs(5));
            Ok(())
        });
    }
}
