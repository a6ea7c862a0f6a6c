// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared cache used for cross-process coordination.
//!
//! Locks, rate windows and queued work records live here and nowhere else.
//! Expiry is the only cleanup mechanism for ephemeral keys, so every
//! implementation must honour TTLs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key {key} holds a value of the wrong type")]
    WrongType { key: String },

    #[error("cache backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait SharedCache: Send + Sync + 'static {
    /// Atomically set `key` only if it does not exist. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Atomically delete `key` if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CacheError>;

    /// Atomically increment an integer counter, creating it at 0 first.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), CacheError>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Single-process cache with lazy expiry, for tests and the `memory` backend.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| {
            warn!(target: "cache", "cache mutex poisoned, recovering");
            poisoned.into_inner()
        });
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries)
    }

    /// Remaining time to live of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.with_entries(|entries| {
            entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        })
    }
}

#[async_trait::async_trait]
impl SharedCache for InMemoryCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        Ok(self.with_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
            }),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.with_entries(|entries| entries.contains_key(key)))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.with_entries(|entries| entries.remove(key).is_some()))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        Ok(self.with_entries(|entries| {
            let matches = matches!(
                entries.get(key),
                Some(Entry { value: Value::Str(s), .. }) if s == value
            );
            if matches {
                entries.remove(key);
            }
            matches
        }))
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Str("0".to_string()),
                expires_at: None,
            });
            let current = match &entry.value {
                Value::Str(s) => s.parse::<i64>().map_err(|_| CacheError::WrongType {
                    key: key.to_string(),
                })?,
                Value::Hash(_) => {
                    return Err(CacheError::WrongType {
                        key: key.to_string(),
                    })
                }
            };
            let next = current + 1;
            entry.value = Value::Str(next.to_string());
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        Ok(self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
            }),
        })
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(h) => {
                    h.extend(fields.iter().cloned());
                    Ok(())
                }
                Value::Str(_) => Err(CacheError::WrongType {
                    key: key.to_string(),
                }),
            }
        })
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.with_entries(|entries| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            keys
        }))
    }
}
