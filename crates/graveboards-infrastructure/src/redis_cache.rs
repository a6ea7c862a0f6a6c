// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::cache::{CacheError, SharedCache};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

fn backend(err: redis::RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

/// Redis-backed [`SharedCache`] shared by every daemon process.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    compare_and_delete: redis::Script,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        info!(target: "cache", "connected to redis cache");
        Ok(Self {
            conn,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }
}

#[async_trait::async_trait]
impl SharedCache for RedisCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(backend)?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await.map_err(backend)?;
        Ok(found)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await.map_err(backend)?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let applied: bool = conn
            .pexpire(key, millis(ttl) as i64)
            .await
            .map_err(backend)?;
        Ok(applied)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await.map_err(backend)?;
        Ok(fields)
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), CacheError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await.map_err(backend)?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = conn.keys(format!("{prefix}*")).await.map_err(backend)?;
        keys.sort();
        Ok(keys)
    }
}
