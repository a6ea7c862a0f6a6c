// SPDX-License-Identifier: GPL-3.0-or-later
pub mod cache;
pub mod clock;
pub mod lock;
pub mod memory_adapters;
#[cfg(feature = "redis")]
pub mod redis_cache;
pub mod repositories;
pub mod sqlite_adapters;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use graveboards_config::{AppConfig, CacheBackend};
use graveboards_domain::TaskKind;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::cache::{InMemoryCache, SharedCache};
use crate::memory_adapters::{InMemoryStore, InMemoryTaskRepository};
use crate::repositories::{
    BeatmapRepository, LeaderboardRepository, MapperRepository, ProfileRepository,
    RequestRepository, ScoreRepository, TaskRepository,
};
use crate::sqlite_adapters::{SqliteStore, SqliteTaskRepository};

/// Resolve a relative `sqlite://` file URL to an absolute one that SQLite may
/// create, creating the parent directory on the way.
fn normalize_sqlite_url(url: &str) -> Result<String> {
    if !url.starts_with("sqlite://") || url.starts_with("sqlite://:memory:") {
        return Ok(url.to_string());
    }

    let db_path = url.trim_start_matches("sqlite://");
    let path = Path::new(db_path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
            info!(target: "infrastructure", path = %parent.display(), "created database directory");
        }
    }

    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    // Forward slashes work for SQLite on every platform
    let path_str = absolute_path.to_string_lossy().replace('\\', "/");
    Ok(format!("sqlite://{}?mode=rwc", path_str))
}

pub async fn init_database(config: &AppConfig) -> Result<SqlitePool> {
    info!(target: "infrastructure", "initializing database");

    let db_url = normalize_sqlite_url(&config.database.url)?;
    info!(target: "infrastructure", db_url = %db_url, "connecting to database");

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.pool_max_size)
        .connect(&db_url)
        .await?;

    info!(target: "infrastructure", db_url = %config.database.url, "running migrations");
    sqlx::migrate!("../../migrations").run(&pool).await?;

    info!(target: "infrastructure", "database initialized successfully");
    Ok(pool)
}

/// Open the shared cache selected by `cache.backend`.
pub async fn connect_cache(config: &AppConfig) -> Result<Arc<dyn SharedCache>> {
    match config.cache.backend {
        CacheBackend::Memory => {
            info!(target: "infrastructure", "using in-process cache");
            Ok(Arc::new(InMemoryCache::new()))
        }
        CacheBackend::Redis => connect_redis_cache(config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis_cache(config: &AppConfig) -> Result<Arc<dyn SharedCache>> {
    let cache = redis_cache::RedisCache::connect(&config.cache.redis_url).await?;
    Ok(Arc::new(cache))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis_cache(_config: &AppConfig) -> Result<Arc<dyn SharedCache>> {
    anyhow::bail!("cache backend 'redis' requires building with the `redis` feature")
}

/// Every repository the background handlers write through.
#[derive(Clone)]
pub struct Persistence {
    pub profile_tasks: Arc<dyn TaskRepository>,
    pub score_tasks: Arc<dyn TaskRepository>,
    pub mapper_tasks: Arc<dyn TaskRepository>,
    pub profiles: Arc<dyn ProfileRepository>,
    pub mappers: Arc<dyn MapperRepository>,
    pub scores: Arc<dyn ScoreRepository>,
    pub leaderboards: Arc<dyn LeaderboardRepository>,
    pub beatmaps: Arc<dyn BeatmapRepository>,
    pub requests: Arc<dyn RequestRepository>,
}

impl Persistence {
    pub fn sqlite(pool: SqlitePool) -> Self {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        Self {
            profile_tasks: Arc::new(SqliteTaskRepository::new(pool.clone(), TaskKind::ProfileFetcher)),
            score_tasks: Arc::new(SqliteTaskRepository::new(pool.clone(), TaskKind::ScoreFetcher)),
            mapper_tasks: Arc::new(SqliteTaskRepository::new(pool, TaskKind::MapperInfoFetcher)),
            profiles: store.clone(),
            mappers: store.clone(),
            scores: store.clone(),
            leaderboards: store.clone(),
            beatmaps: store.clone(),
            requests: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::in_memory_with(Arc::new(InMemoryStore::new()))
    }

    /// In-memory persistence over a store the caller keeps a handle to.
    pub fn in_memory_with(store: Arc<InMemoryStore>) -> Self {
        Self {
            profile_tasks: Arc::new(InMemoryTaskRepository::new()),
            score_tasks: Arc::new(InMemoryTaskRepository::new()),
            mapper_tasks: Arc::new(InMemoryTaskRepository::new()),
            profiles: store.clone(),
            mappers: store.clone(),
            scores: store.clone(),
            leaderboards: store.clone(),
            beatmaps: store.clone(),
            requests: store,
        }
    }

    pub fn tasks(&self, kind: TaskKind) -> Arc<dyn TaskRepository> {
        match kind {
            TaskKind::ProfileFetcher => self.profile_tasks.clone(),
            TaskKind::ScoreFetcher => self.score_tasks.clone(),
            TaskKind::MapperInfoFetcher => self.mapper_tasks.clone(),
        }
    }
}
