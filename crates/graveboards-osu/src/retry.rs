// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use graveboards_config::RetryConfig;
use tracing::{error, warn};

/// Delay before the retry that follows failed attempt `n` (1-based).
#[derive(Clone)]
pub enum Backoff {
    /// `n² × base`
    Quadratic { base: Duration },
    Fixed(Duration),
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Quadratic { base } => base.saturating_mul(attempt.saturating_mul(attempt)),
            Self::Fixed(delay) => *delay,
            Self::Custom(f) => f(attempt),
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quadratic { base } => f.debug_struct("Quadratic").field("base", base).finish(),
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Quadratic {
                base: Duration::from_secs(1),
            },
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Backoff::Quadratic {
                base: Duration::from_secs(config.backoff_base_seconds),
            },
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only errors for which `is_transient` holds are retried. The error from the
/// final attempt is returned as is.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < max_attempts => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    target: "retry",
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if is_transient(&err) {
                    error!(
                        target: "retry",
                        operation,
                        attempts = attempt,
                        error = %err,
                        "giving up after repeated transient failures"
                    );
                }
                return Err(err);
            }
        }
    }
}
