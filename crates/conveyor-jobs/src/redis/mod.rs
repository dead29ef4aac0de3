//! Redis-backed job store.

mod store;

pub use store::RedisJobStore;

use crate::error::{JobError, JobResult};
use conveyor_config::StoreConfig;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool and verify the server answers.
///
/// A store that cannot be reached here is a fatal startup error.
pub async fn create_pool(config: &StoreConfig) -> JobResult<Pool> {
    info!(pool_size = config.pool_size, "Creating Redis connection pool for job store...");

    let cfg = Config::from_url(&config.redis_url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let timeout = config.connect_timeout();
    tokio::time::timeout(timeout, async {
        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok::<_, JobError>(())
    })
    .await
    .map_err(|_| JobError::Timeout(timeout.as_secs()))??;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for the job store.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Ready jobs of a queue (sorted set of ids by priority + time).
    pub fn ready(&self, queue: &str) -> String {
        format!("{}:pqueue:{}", self.prefix, queue)
    }

    /// Delayed jobs of a queue (sorted set of ids by `available_at`).
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:delayed:{}", self.prefix, queue)
    }

    /// Leased jobs of a queue (sorted set of ids by lease expiry).
    pub fn leases(&self, queue: &str) -> String {
        format!("{}:leases:{}", self.prefix, queue)
    }

    /// Lease holders of a queue (hash: job_id -> worker_id).
    pub fn active(&self, queue: &str) -> String {
        format!("{}:active:{}", self.prefix, queue)
    }

    /// Job record (JSON string).
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Dead letter entries (hash: job_id -> entry JSON).
    pub fn dead_letters(&self) -> String {
        format!("{}:dead_letters", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("conveyor:jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.ready("email"), "test:pqueue:email");
        assert_eq!(keys.delayed("email"), "test:delayed:email");
        assert_eq!(keys.leases("email"), "test:leases:email");
        assert_eq!(keys.job("123"), "test:job:123");
        assert_eq!(keys.dead_letters(), "test:dead_letters");
    }

    #[test]
    fn test_default_prefix() {
        assert_eq!(RedisKeys::default().active("media"), "conveyor:jobs:active:media");
    }
}
