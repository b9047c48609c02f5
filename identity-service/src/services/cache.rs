use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use tokio::time::{Duration, Instant};

/// Key/value side channel for counters, lock markers, revocation markers
/// and cached permission sets. Callers treat every read as a possible miss.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), anyhow::Error>;
    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error>;
    async fn delete(&self, keys: &[String]) -> Result<(), anyhow::Error>;
    /// Remaining lifetime in seconds, `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, anyhow::Error>;
    /// Atomically increment `key` and reset its expiry to `ttl_secs`.
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<i64, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl CacheStore for RedisService {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get cache: {}", e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache: {}", e))
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check key: {}", e))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), anyhow::Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete keys: {}", e))
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, anyhow::Error> {
        let mut conn = self.manager.clone();
        // -2 = missing, -1 = no expiry
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read ttl: {}", e))?;

        Ok(u64::try_from(ttl).ok())
    }

    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<i64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to increment counter: {}", e))?;

        Ok(count)
    }
}

/// In-process cache used by tests and single-node development runs.
///
/// Expiry is measured with `tokio::time::Instant`, so paused test clocks
/// drive it. `set_unavailable(true)` makes every call fail.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Option<Instant>)>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), anyhow::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Memory cache marked unavailable"));
        }
        Ok(())
    }

    fn live_value(&self, key: &str) -> Option<(String, Option<Instant>)> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.1 {
                Some(deadline) if deadline <= now => true,
                _ => return Some(entry.value().clone()),
            },
            None => return None,
        };
        if expired {
            // A concurrent writer may have replaced the entry since the read
            self.entries
                .remove_if(key, |_, (_, deadline)| deadline.map_or(false, |d| d <= now));
        }
        None
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.ensure_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        self.ensure_available()?;
        Ok(self.live_value(key).map(|(v, _)| v))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), anyhow::Error> {
        self.ensure_available()?;
        let deadline = Instant::now() + Duration::from_secs(ttl_secs.max(1));
        self.entries
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        self.ensure_available()?;
        Ok(self.live_value(key).is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), anyhow::Error> {
        self.ensure_available()?;
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, anyhow::Error> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .live_value(key)
            .and_then(|(_, deadline)| deadline)
            .map(|deadline| {
                let remaining = deadline.saturating_duration_since(now);
                // Round up like Redis so a live key never reports 0
                remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
            }))
    }

    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<i64, anyhow::Error> {
        self.ensure_available()?;
        let now = Instant::now();
        // The entry guard holds the shard lock across read and write
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| ("0".to_string(), None));
        let (value, deadline) = entry.value_mut();
        let current = match *deadline {
            Some(at) if at <= now => 0,
            _ => value
                .parse::<i64>()
                .map_err(|e| anyhow::anyhow!("Counter {} is not an integer: {}", key, e))?,
        };
        let next = current + 1;
        *value = next.to_string();
        *deadline = Some(now + Duration::from_secs(ttl_secs));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_expires_entries() -> Result<(), anyhow::Error> {
        let cache = MemoryCache::new();
        cache.set_ex("session:revoked:abc", "1", 10).await?;

        assert!(cache.exists("session:revoked:abc").await?);
        assert_eq!(cache.ttl("session:revoked:abc").await?, Some(10));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(!cache.exists("session:revoked:abc").await?);
        assert_eq!(cache.ttl("session:revoked:abc").await?, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_resets_expiry() -> Result<(), anyhow::Error> {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_with_ttl("login_fail:x", 900).await?, 1);

        tokio::time::advance(Duration::from_secs(800)).await;
        assert_eq!(cache.incr_with_ttl("login_fail:x", 900).await?, 2);

        tokio::time::advance(Duration::from_secs(800)).await;
        assert_eq!(cache.get("login_fail:x").await?.as_deref(), Some("2"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() -> Result<(), anyhow::Error> {
        let cache = Arc::new(MemoryCache::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.incr_with_ttl("login_fail:y", 900).await })
            })
            .collect();

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await??);
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=64).collect::<Vec<i64>>());
        assert_eq!(cache.get("login_fail:y").await?.as_deref(), Some("64"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unavailable_cache_errors() {
        let cache = MemoryCache::new();
        cache.set_unavailable(true);

        assert!(cache.get("anything").await.is_err());
        assert!(cache.health_check().await.is_err());
    }
}
