//! Job runtime state kept in Redis using the gocraft/work key layout:
//!
//! - `{ns}:known_jobs` set of job type names
//! - `{ns}:jobs:<type>` pending list, newest at the head
//! - `{ns}:jobs:<type>:paused` paused marker
//! - `{ns}:worker_pools` set of pool ids, `{ns}:worker_pools:<id>` heartbeat hash
//! - `{ns}:worker:<id>` observation hash of a busy worker

use crate::error::Result;
use crate::runtime::{PoolHeartbeat, QueueDepth, WorkRuntime, WorkerObservation};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::HashMap;

/// Pending job as serialized by the job runtime
#[derive(Debug, Deserialize)]
struct PendingJob {
    #[serde(default)]
    id: String,
    /// Enqueue time, unix seconds
    #[serde(rename = "t", default)]
    enqueued_at: i64,
}

fn field_i64(hash: &HashMap<String, String>, name: &str) -> i64 {
    hash.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn field_str(hash: &HashMap<String, String>, name: &str) -> String {
    hash.get(name).cloned().unwrap_or_default()
}

fn field_list(hash: &HashMap<String, String>, name: &str) -> Vec<String> {
    hash.get(name)
        .map(|v| {
            v.split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Job id of a raw pending list entry. Entries that are not job JSON are taken verbatim.
fn pending_job_id(raw: &str) -> String {
    match serde_json::from_str::<PendingJob>(raw) {
        Ok(job) if !job.id.is_empty() => job.id,
        _ => raw.to_string(),
    }
}

/// Key names under one namespace
#[derive(Debug, Clone)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("{{{}}}", self.namespace)
    }

    pub fn known_jobs_key(&self) -> String {
        format!("{}:known_jobs", self.prefix())
    }

    pub fn job_queue_key(&self, job_type: &str) -> String {
        format!("{}:jobs:{}", self.prefix(), job_type)
    }

    pub fn paused_key(&self, job_type: &str) -> String {
        format!("{}:jobs:{}:paused", self.prefix(), job_type)
    }

    pub fn paused_pattern(&self) -> String {
        format!("{}:jobs:*:paused", self.prefix())
    }

    pub fn worker_pools_key(&self) -> String {
        format!("{}:worker_pools", self.prefix())
    }

    pub fn worker_pool_key(&self, pool_id: &str) -> String {
        format!("{}:worker_pools:{}", self.prefix(), pool_id)
    }

    pub fn worker_key(&self, worker_id: &str) -> String {
        format!("{}:worker:{}", self.prefix(), worker_id)
    }

    /// Job type embedded in a paused marker key
    pub fn job_type_of_paused_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:jobs:", self.prefix()))
            .and_then(|rest| rest.strip_suffix(":paused"))
            .filter(|t| !t.is_empty())
    }
}

/// Seconds the oldest pending entry has waited; 0 when it carries no enqueue time
fn queue_latency(oldest: Option<&str>, now: i64) -> i64 {
    oldest
        .and_then(|raw| serde_json::from_str::<PendingJob>(raw).ok())
        .filter(|job| job.enqueued_at > 0)
        .map(|job| (now - job.enqueued_at).max(0))
        .unwrap_or(0)
}

pub struct RedisWorkRuntime {
    conn: ConnectionManager,
    keys: KeyLayout,
}

impl RedisWorkRuntime {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            keys: KeyLayout::new(namespace),
        }
    }

    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, namespace))
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }
}

#[async_trait]
impl WorkRuntime for RedisWorkRuntime {
    async fn pool_heartbeats(&self) -> Result<Vec<PoolHeartbeat>> {
        let mut conn = self.conn.clone();
        let mut pool_ids: Vec<String> = conn.smembers(self.keys.worker_pools_key()).await?;
        pool_ids.sort();
        if pool_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &pool_ids {
            pipe.hgetall(self.keys.worker_pool_key(id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let heartbeats = pool_ids
            .into_iter()
            .zip(hashes)
            .filter(|(_, hash)| !hash.is_empty())
            .map(|(pool_id, hash)| PoolHeartbeat {
                pool_id,
                started_at: field_i64(&hash, "started_at"),
                heartbeat_at: field_i64(&hash, "heartbeat_at"),
                job_names: field_list(&hash, "job_names"),
                concurrency: field_i64(&hash, "concurrency"),
                host: field_str(&hash, "host"),
                pid: field_i64(&hash, "pid"),
                worker_ids: field_list(&hash, "worker_ids"),
            })
            .collect();
        Ok(heartbeats)
    }

    async fn worker_observations(&self, worker_ids: &[String]) -> Result<Vec<WorkerObservation>> {
        if worker_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for id in worker_ids {
            pipe.hgetall(self.keys.worker_key(id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        Ok(worker_ids
            .iter()
            .zip(hashes)
            .map(|(worker_id, hash)| {
                if hash.is_empty() {
                    return WorkerObservation {
                        worker_id: worker_id.clone(),
                        ..Default::default()
                    };
                }
                WorkerObservation {
                    worker_id: worker_id.clone(),
                    is_busy: true,
                    job_name: field_str(&hash, "job_name"),
                    job_id: field_str(&hash, "job_id"),
                    started_at: field_i64(&hash, "started_at"),
                    args: field_str(&hash, "args"),
                    checkin: field_str(&hash, "checkin"),
                    checkin_at: field_i64(&hash, "checkin_at"),
                }
            })
            .collect())
    }

    async fn known_job_types(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut types: Vec<String> = conn.smembers(self.keys.known_jobs_key()).await?;
        types.sort();
        Ok(types)
    }

    async fn queue_depths(&self) -> Result<Vec<QueueDepth>> {
        let job_types = self.known_job_types().await?;
        if job_types.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for job_type in &job_types {
            let key = self.keys.job_queue_key(job_type);
            pipe.llen(&key).lindex(&key, -1);
        }
        let replies: Vec<redis::Value> = pipe.query_async(&mut conn).await?;

        let now = chrono::Utc::now().timestamp();
        let mut depths = Vec::with_capacity(job_types.len());
        for (job_type, pair) in job_types.into_iter().zip(replies.chunks(2)) {
            let count: i64 = redis::from_redis_value(&pair[0])?;
            let oldest: Option<String> = redis::from_redis_value(&pair[1])?;
            let latency = queue_latency(oldest.as_deref(), now);
            depths.push(QueueDepth {
                job_name: job_type,
                count,
                latency,
            });
        }
        Ok(depths)
    }

    async fn paused_job_types(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = self.keys.paused_pattern();
        let mut cursor: u64 = 0;
        let mut types = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            types.extend(
                keys.iter()
                    .filter_map(|k| self.keys.job_type_of_paused_key(k))
                    .map(|t| t.to_string()),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn set_paused(&self, job_type: &str, paused: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.paused_key(job_type);
        if paused {
            let _: () = conn.set(&key, "1").await?;
        } else {
            let _: () = conn.del(&key).await?;
        }
        Ok(())
    }

    async fn drain_pending(&self, job_type: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = self.keys.job_queue_key(job_type);
        let (raw, deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await?;
        tracing::info!(
            job_type = %job_type,
            drained = raw.len(),
            deleted_keys = deleted,
            "Pending job queue drained"
        );
        Ok(raw.iter().map(|r| pending_job_id(r)).collect())
    }
}
