//! Cross-process mutual exclusion keyed by job id.
//!
//! A lock is an atomic "set if not already held" with a TTL, so a crashed
//! holder's lock expires on its own instead of wedging the job.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("Lock backend error: {0}")]
    Backend(String),
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Key under which the lock for `job_id` is stored.
pub fn lock_key(job_id: &str) -> String {
    format!("job_lock:{job_id}")
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock if nobody holds it. `Ok(false)` means contention.
    async fn try_acquire(&self, job_id: &str, holder: &str, ttl: Duration) -> LockResult<bool>;

    /// Release the lock if `holder` still owns it. `Ok(false)` means it had
    /// expired and now belongs to someone else (or nobody), and was left alone.
    async fn release(&self, job_id: &str, holder: &str) -> LockResult<bool>;

    /// Current holder, if the lock is held and not expired.
    async fn holder(&self, job_id: &str) -> LockResult<Option<String>>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    deadline: Instant,
}

/// Single-process lock table. Sufficient when only one scheduler instance runs.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, job_id: &str, holder: &str, ttl: Duration) -> LockResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let key = lock_key(job_id);
        if let Some(entry) = entries.get(&key) {
            if entry.deadline > now {
                return Ok(false);
            }
            tracing::debug!(job_id, previous_holder = %entry.holder, "Taking over expired lock");
        }
        entries.insert(
            key,
            LockEntry {
                holder: holder.to_string(),
                deadline: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, job_id: &str, holder: &str) -> LockResult<bool> {
        let mut entries = self.entries.lock().await;
        let key = lock_key(job_id);
        match entries.get(&key) {
            Some(entry) if entry.holder == holder => {
                entries.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, job_id: &str) -> LockResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .await
            .get(&lock_key(job_id))
            .filter(|entry| entry.deadline > now)
            .map(|entry| entry.holder.clone()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "redis-lock")]
pub use redis_lock::RedisLock;

#[cfg(feature = "redis-lock")]
mod redis_lock {
    use super::*;
    use redis::aio::MultiplexedConnection;

    /// Delete the key only while it still names the caller.
    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

    /// Redis-backed lock: `SET job_lock:{id} holder NX PX ttl`.
    pub struct RedisLock {
        conn: MultiplexedConnection,
    }

    impl RedisLock {
        pub async fn connect(url: &str) -> LockResult<Self> {
            let client =
                redis::Client::open(url).map_err(|e| LockError::Unavailable(e.to_string()))?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| LockError::Unavailable(e.to_string()))?;
            tracing::info!(url, "Connected to redis lock backend");
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl DistributedLock for RedisLock {
        async fn try_acquire(
            &self,
            job_id: &str,
            holder: &str,
            ttl: Duration,
        ) -> LockResult<bool> {
            let mut conn = self.conn.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(lock_key(job_id))
                .arg(holder)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            Ok(reply.is_some())
        }

        async fn release(&self, job_id: &str, holder: &str) -> LockResult<bool> {
            let mut conn = self.conn.clone();
            let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(lock_key(job_id))
                .arg(holder)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            Ok(deleted == 1)
        }

        async fn holder(&self, job_id: &str) -> LockResult<Option<String>> {
            let mut conn = self.conn.clone();
            let holder: Option<String> = redis::cmd("GET")
                .arg(lock_key(job_id))
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            Ok(holder)
        }

        fn backend_name(&self) -> &'static str {
            "redis"
        }
    }
}
