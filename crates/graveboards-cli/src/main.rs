// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use graveboards_config::{load as load_config, AppConfig, CacheBackend};
use graveboards_infrastructure::clock::{Clock, SystemClock};
use graveboards_infrastructure::{connect_cache, init_database, Persistence};
use graveboards_osu::{OsuClient, RateLimiter, RetryPolicy};
use graveboards_realtime::{InMemoryPubSub, PubSub};
use graveboards_scheduler::{Daemon, DaemonContext};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path(std::env::args());
    let config = load_config(config_path.as_deref())?;
    init_tracing(&config.telemetry.log_level);

    let pool = init_database(&config)
        .await
        .context("initializing database")?;
    let cache = connect_cache(&config).await.context("connecting cache")?;
    let bus = connect_bus(&config).await.context("connecting bus")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let osu = OsuClient::from_config(&config.osu)
        .rate_limiter(RateLimiter::from_config(
            cache.clone(),
            clock.clone(),
            "osu",
            &config.rate_limit,
        ))
        .retry_policy(RetryPolicy::from_config(&config.retry))
        .build()?;

    let daemon = Daemon::new(DaemonContext {
        config,
        persistence: Persistence::sqlite(pool.clone()),
        cache,
        bus,
        osu: Arc::new(osu),
        clock,
    });

    info!(target: "cli", "graveboards daemon running");
    let outcome = daemon.run_until(shutdown_signal()).await;

    pool.close().await;
    info!(target: "cli", "database pool closed");
    outcome
}

/// First positional argument, if any, is the config file.
fn config_path(args: impl IntoIterator<Item = String>) -> Option<PathBuf> {
    args.into_iter().nth(1).map(PathBuf::from)
}

fn init_tracing(default_level: &str) {
    let fmt_layer = fmt::layer().with_target(true).with_thread_names(true).with_level(true);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

async fn connect_bus(config: &AppConfig) -> Result<Arc<dyn PubSub>> {
    match config.cache.backend {
        CacheBackend::Memory => Ok(Arc::new(InMemoryPubSub::new())),
        CacheBackend::Redis => connect_redis_bus(config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis_bus(config: &AppConfig) -> Result<Arc<dyn PubSub>> {
    let bus = graveboards_realtime::RedisPubSub::connect(&config.cache.redis_url).await?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis_bus(_config: &AppConfig) -> Result<Arc<dyn PubSub>> {
    anyhow::bail!("bus backend 'redis' requires building with the `redis` feature")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => {},
                    _ = terminate.recv() => {},
                }
            }
            _ => {
                tracing::warn!(target: "cli", "failed to install unix signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(target: "cli", "shutdown signal received");
}
