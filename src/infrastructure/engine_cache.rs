//! Connection-keyed cache of target-database engines.
//!
//! Engines are `sqlx` PostgreSQL pools keyed by `(connection_id,
//! version_key)`, where the version key is the connection's last-modified
//! marker: rotating credentials changes the key and the stale pool ages
//! out. Eviction is FIFO on first insert, bounded by `engine_cache_size`.
//!
//! Locking discipline: the mutex guards only the map and the insertion
//! order list. Pool construction happens outside the lock, with a
//! double-check on re-entry so concurrent misses for the same key settle
//! on one pool.

use crate::domain::connection::ConnectionInfo;
use crate::domain::error::{AppError, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

type CacheKey = (i64, Option<String>);

/// Pool sizing for engines built by the cache.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
        }
    }
}

struct CacheInner {
    pools: HashMap<CacheKey, PgPool>,
    order: Vec<CacheKey>,
}

/// Process-wide engine cache. One instance is shared by every
/// orchestration.
pub struct EngineCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    config: EngineConfig,
}

impl EngineCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, EngineConfig::default())
    }

    pub fn with_config(capacity: usize, config: EngineConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                pools: HashMap::new(),
                order: Vec::new(),
            }),
            capacity,
            config,
        }
    }

    /// Returns the cached engine for the connection, building one on miss.
    pub fn acquire(&self, info: &ConnectionInfo) -> Result<PgPool> {
        let key: CacheKey = (info.id, info.version_key.clone());

        {
            let inner = self.lock();
            if let Some(pool) = inner.pools.get(&key) {
                return Ok(pool.clone());
            }
        }

        // Construct outside the lock; connecting is deferred until first use.
        let pool = self.build_pool(info)?;

        let evicted: Vec<PgPool>;
        let resolved = {
            let mut inner = self.lock();
            if let Some(existing) = inner.pools.get(&key) {
                // Another caller won the race; keep theirs.
                let existing = existing.clone();
                evicted = vec![pool];
                existing
            } else {
                inner.pools.insert(key.clone(), pool.clone());
                inner.order.push(key);
                let mut out = Vec::new();
                while inner.order.len() > self.capacity {
                    let oldest = inner.order.remove(0);
                    if let Some(old) = inner.pools.remove(&oldest) {
                        info!(
                            connection_id = oldest.0,
                            "engine_cache_evicted"
                        );
                        out.push(old);
                    }
                }
                evicted = out;
                pool
            }
        };

        for old in evicted {
            tokio::spawn(async move {
                old.close().await;
            });
        }

        Ok(resolved)
    }

    pub fn len(&self) -> usize {
        self.lock().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pools.is_empty()
    }

    /// Drops every cached engine, closing pools in the background.
    pub fn clear(&self) {
        let drained: Vec<PgPool> = {
            let mut inner = self.lock();
            inner.order.clear();
            inner.pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in drained {
            tokio::spawn(async move {
                pool.close().await;
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn build_pool(&self, info: &ConnectionInfo) -> Result<PgPool> {
        let options = Self::build_options(info)?;
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(self.config.idle_timeout_secs))
            .connect_lazy_with(options);
        info!(
            connection_id = info.id,
            host = %info.host,
            "engine_cache_built"
        );
        Ok(pool)
    }

    fn build_options(info: &ConnectionInfo) -> Result<PgConnectOptions> {
        if info.host.is_empty() {
            return Err(AppError::ValidationError(
                "Connection host is required".to_string(),
            ));
        }
        if info.database.is_empty() {
            return Err(AppError::ValidationError(
                "Connection database name is required".to_string(),
            ));
        }
        Ok(PgConnectOptions::new()
            .host(&info.host)
            .port(info.port)
            .database(&info.database)
            .username(&info.username)
            .password(&info.password)
            .ssl_mode(parse_ssl_mode(&info.ssl_mode)))
    }
}

fn parse_ssl_mode(ssl_mode: &str) -> PgSslMode {
    match ssl_mode.to_lowercase().as_str() {
        "disable" => PgSslMode::Disable,
        "allow" => PgSslMode::Allow,
        "prefer" => PgSslMode::Prefer,
        "require" => PgSslMode::Require,
        "verify-ca" => PgSslMode::VerifyCa,
        "verify-full" => PgSslMode::VerifyFull,
        _ => PgSslMode::Prefer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(id: i64, version_key: Option<&str>) -> ConnectionInfo {
        ConnectionInfo {
            id,
            host: "localhost".to_string(),
            port: 5432,
            database: "catalog".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            ssl_mode: "prefer".to_string(),
            version_key: version_key.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_parse_ssl_mode() {
        assert!(matches!(parse_ssl_mode("disable"), PgSslMode::Disable));
        assert!(matches!(parse_ssl_mode("require"), PgSslMode::Require));
        assert!(matches!(parse_ssl_mode("PREFER"), PgSslMode::Prefer));
        assert!(matches!(parse_ssl_mode("unknown"), PgSslMode::Prefer));
    }

    #[tokio::test]
    async fn test_acquire_reuses_same_key() {
        let cache = EngineCache::new(4);
        cache.acquire(&connection(1, Some("v1"))).unwrap();
        cache.acquire(&connection(1, Some("v1"))).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_version_key_invalidates() {
        let cache = EngineCache::new(4);
        cache.acquire(&connection(1, Some("v1"))).unwrap();
        cache.acquire(&connection(1, Some("v2"))).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_eviction() {
        let cache = EngineCache::new(2);
        cache.acquire(&connection(1, None)).unwrap();
        cache.acquire(&connection(2, None)).unwrap();
        cache.acquire(&connection(3, None)).unwrap();
        assert_eq!(cache.len(), 2);
        // Connection 1 was first in, so it is the one evicted.
        let inner = cache.lock();
        assert!(!inner.pools.contains_key(&(1, None)));
        assert!(inner.pools.contains_key(&(2, None)));
        assert!(inner.pools.contains_key(&(3, None)));
    }

    #[test]
    fn test_rejects_empty_host() {
        let cache = EngineCache::new(2);
        let mut info = connection(1, None);
        info.host = String::new();
        assert!(cache.acquire(&info).is_err());
    }
}
