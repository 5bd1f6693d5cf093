//! Upstream connection limiter.
//!
//! A per-key counter lives in a shared store; acquiring runs a compare-and-increment
//! script so concurrent proxies never read-modify-write the counter. The counter
//! carries an expiry so a crashed holder cannot pin it forever.

use crate::config::UPSTREAM_CONN_COUNTER_TTL_SECS;
use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const ACQUIRE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local max = tonumber(ARGV[1])
if current + 1 <= max then
    redis.call('INCRBY', KEYS[1], 1)
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
local val = tonumber(redis.call('GET', KEYS[1]) or '0')
if val > 0 then
    redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Counter key guarding connections to one upstream registry
pub fn upstream_key(registry_id: i64) -> String {
    format!("upstream_conn:{}", registry_id)
}

/// Atomic bounded counter
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment when below `limit`. Returns whether the slot was taken.
    async fn try_increment(&self, key: &str, limit: i64) -> Result<bool>;

    /// Decrement, never below zero
    async fn decrement(&self, key: &str) -> Result<()>;

    async fn current(&self, key: &str) -> Result<i64>;
}

pub struct RedisCounterStore {
    conn: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn try_increment(&self, key: &str, limit: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let taken: i64 = self
            .acquire
            .key(key)
            .arg(limit)
            .arg(UPSTREAM_CONN_COUNTER_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(taken == 1)
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self.release.key(key).invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }
}

/// Process-local counters, used when no shared store is configured
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, i64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn try_increment(&self, key: &str, limit: i64) -> Result<bool> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let current = counters.entry(key.to_string()).or_insert(0);
        if *current + 1 <= limit {
            *current += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = counters.get_mut(key) {
            if *current > 0 {
                *current -= 1;
            }
        }
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<i64> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        Ok(counters.get(key).copied().unwrap_or(0))
    }
}

pub struct ConnectionLimiter {
    store: Arc<dyn CounterStore>,
}

impl ConnectionLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Store failures deny the slot
    pub async fn acquire(&self, key: &str, limit: i64) -> bool {
        match self.store.try_increment(key, limit).await {
            Ok(taken) => {
                tracing::debug!(key = %key, limit = limit, taken = taken, "Connection slot acquire");
                taken
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to read connection counter");
                false
            }
        }
    }

    pub async fn release(&self, key: &str) {
        if let Err(e) = self.store.decrement(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to release connection slot");
        }
    }

    pub async fn in_use(&self, key: &str) -> Result<i64> {
        self.store.current(key).await
    }

    /// Scoped acquire. `limit <= 0` means unlimited and never touches the counter.
    pub async fn permit(self: &Arc<Self>, key: &str, limit: i64) -> Option<ConnectionPermit> {
        if limit <= 0 {
            return Some(ConnectionPermit {
                limiter: None,
                key: key.to_string(),
            });
        }
        if self.acquire(key, limit).await {
            Some(ConnectionPermit {
                limiter: Some(self.clone()),
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

/// Held slot on a connection counter. Call [`ConnectionPermit::release`] on the
/// normal path; dropping an unreleased permit schedules the release on the runtime.
pub struct ConnectionPermit {
    limiter: Option<Arc<ConnectionLimiter>>,
    key: String,
}

impl ConnectionPermit {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release(&self.key).await;
        }
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let Some(limiter) = self.limiter.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { limiter.release(&key).await });
            }
            Err(_) => {
                tracing::warn!(key = %key, "Connection permit dropped outside runtime, slot leaks until expiry");
            }
        }
    }
}
