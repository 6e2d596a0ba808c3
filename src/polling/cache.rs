//! Cache shared between the instances of a deployment.
//!
//! Values are JSON strings produced by this crate. The master instance writes, replicas read.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum CacheError {
    #[cfg(feature = "redis")]
    #[error(transparent)]
    RedisError(#[from] redis::RedisError),
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn setex(&self, key: &str, ttl_seconds: u64, value: String) -> Result<(), CacheError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, (String, Instant)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Process local [`SharedCache`], for single instance deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<Entries>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.values.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn setex(&self, key: &str, ttl_seconds: u64, value: String) -> Result<(), CacheError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_cache::RedisCache;

#[cfg(feature = "redis")]
mod redis_cache {
    use async_trait::async_trait;
    use redis::{aio::ConnectionManager, AsyncCommands, Client};

    use super::{CacheError, SharedCache};

    /// [`SharedCache`] backed by Redis.
    #[derive(Clone)]
    pub struct RedisCache {
        conn: ConnectionManager,
    }

    impl RedisCache {
        pub async fn new(url: &str) -> Result<Self, CacheError> {
            let client = Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            tracing::info!(target = "amms_sync::polling", url, "Connected to redis");
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl SharedCache for RedisCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            let mut conn = self.conn.clone();
            Ok(conn.get(key).await?)
        }

        async fn setex(
            &self,
            key: &str,
            ttl_seconds: u64,
            value: String,
        ) -> Result<(), CacheError> {
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
            Ok(())
        }

        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
            let mut conn = self.conn.clone();
            Ok(conn.hget(key, field).await?)
        }

        async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), CacheError> {
            let mut conn = self.conn.clone();
            conn.hset::<_, _, _, ()>(key, field, value).await?;
            Ok(())
        }
    }
}
