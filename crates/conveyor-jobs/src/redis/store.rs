//! Redis job store implementation.

use super::RedisKeys;
use crate::dlq::DeadLetterEntry;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobStatus};
use crate::store::{AdmitHook, JobStore, COMPLETED_RETENTION};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Deletes a lease only while `ARGV[2]` still holds it.
///
/// Returns 1 when released, 0 when the job is not leased and -1 when another
/// worker holds the lease.
const RELEASE_SCRIPT: &str = r#"
local holder = redis.call('HGET', KEYS[1], ARGV[1])
if not holder then
    return 0
end
if holder ~= ARGV[2] then
    return -1
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#;

/// Redis-backed job store.
///
/// Each queue keeps ready ids in a priority-scored sorted set, delayed ids in
/// a sorted set scored by `available_at`, and leases in a sorted set scored by
/// expiry. `ZPOPMIN` on the ready set makes leases exclusive, and a lease is
/// only released by the worker that holds it. Dead letter entries live in one
/// hash keyed by job id. The saturation check runs before the insert and is
/// best-effort under concurrent producers.
pub struct RedisJobStore {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisJobStore {
    /// Create a new Redis job store.
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Calculate priority score for sorted set.
    /// Higher priority = lower score (processed first).
    /// Score = -priority * 1e12 + timestamp_ms
    fn priority_score(job: &Job) -> f64 {
        let priority_component = -(i8::from(job.priority) as f64) * 1_000_000_000_000.0;
        let time_component = job.available_at.timestamp_millis() as f64;
        priority_component + time_component
    }

    async fn load(&self, conn: &mut deadpool_redis::Connection, job_id: &str) -> JobResult<Option<Job>> {
        let json: Option<String> = conn.get(self.keys.job(job_id)).await?;
        json.map(|j| Job::from_json(&j)).transpose().map_err(JobError::from)
    }

    async fn save(&self, conn: &mut deadpool_redis::Connection, job: &Job) -> JobResult<()> {
        let _: () = conn.set(self.keys.job(job.id.as_str()), job.to_json()?).await?;
        Ok(())
    }

    /// Places a queued job in the ready or delayed set.
    async fn schedule(&self, conn: &mut deadpool_redis::Connection, job: &Job) -> JobResult<()> {
        let now = Utc::now().timestamp_millis();
        let available = job.available_at.timestamp_millis();

        if available > now {
            let _: () = conn
                .zadd(self.keys.delayed(&job.queue), job.id.as_str(), available as f64)
                .await?;
            debug!(job_id = %job.id, queue = %job.queue, available_at = %job.available_at, "Scheduled delayed job");
        } else {
            let _: () = conn
                .zadd(self.keys.ready(&job.queue), job.id.as_str(), Self::priority_score(job))
                .await?;
        }
        Ok(())
    }

    /// Move delayed jobs that became due to the ready set.
    async fn promote_delayed(&self, conn: &mut deadpool_redis::Connection, queue: &str) -> JobResult<u64> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn.zrangebyscore(self.keys.delayed(queue), 0i64, now).await?;

        let mut moved = 0u64;
        for id in due {
            // Only the caller that removes the id may re-add it.
            let removed: i64 = conn.zrem(self.keys.delayed(queue), &id).await?;
            if removed == 0 {
                continue;
            }
            match self.load(conn, &id).await? {
                Some(job) => {
                    let _: () = conn
                        .zadd(self.keys.ready(queue), &id, Self::priority_score(&job))
                        .await?;
                    moved += 1;
                }
                None => warn!(job_id = %id, queue = %queue, "Dropping delayed id without a job record"),
            }
        }

        if moved > 0 {
            debug!(count = moved, queue = %queue, "Promoted delayed jobs");
        }
        Ok(moved)
    }

    /// Return jobs whose lease expired to the ready set.
    async fn recover_expired(&self, conn: &mut deadpool_redis::Connection, queue: &str) -> JobResult<u64> {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = conn.zrangebyscore(self.keys.leases(queue), 0i64, now).await?;

        let mut recovered = 0u64;
        for id in expired {
            let removed: i64 = conn.zrem(self.keys.leases(queue), &id).await?;
            if removed == 0 {
                continue;
            }
            let worker_id: Option<String> = conn.hget(self.keys.active(queue), &id).await?;
            let _: () = conn.hdel(self.keys.active(queue), &id).await?;

            if let Some(mut job) = self.load(conn, &id).await? {
                job.status = JobStatus::Queued;
                job.leased_by = None;
                job.last_error = Some(format!(
                    "lease held by {} expired",
                    worker_id.as_deref().unwrap_or("unknown worker")
                ));
                self.save(conn, &job).await?;
                self.schedule(conn, &job).await?;
                recovered += 1;
                warn!(job_id = %id, worker_id = ?worker_id, queue = %queue, "Recovered job with expired lease");
            }
        }
        Ok(recovered)
    }

    /// Removes a job's lease; fails unless `job.leased_by` holds it.
    async fn release(&self, conn: &mut deadpool_redis::Connection, job: &Job) -> JobResult<()> {
        let worker_id = job.leased_by.as_deref().unwrap_or_default();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.keys.active(&job.queue))
            .key(self.keys.leases(&job.queue))
            .arg(job.id.as_str())
            .arg(worker_id)
            .invoke_async(&mut **conn)
            .await?;
        match released {
            1 => Ok(()),
            0 => Err(JobError::invalid_state("active", "not leased")),
            _ => Err(JobError::invalid_state(
                format!("leased by {}", worker_id),
                "leased by another worker",
            )),
        }
    }

    async fn finish(&self, job: &Job, status: JobStatus) -> JobResult<()> {
        let mut conn = self.conn().await?;
        self.release(&mut conn, job).await?;
        let mut record = job.clone();
        record.status = status;
        record.leased_by = None;
        self.save(&mut conn, &record).await
    }

    fn parse_entry(json: &str) -> JobResult<DeadLetterEntry> {
        serde_json::from_str(json).map_err(JobError::from)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, mut job: Job, max_depth: Option<u64>, on_admit: AdmitHook<'_>) -> JobResult<JobId> {
        let mut conn = self.conn().await?;

        if let Some(limit) = max_depth {
            let ready: u64 = conn.zcard(self.keys.ready(&job.queue)).await?;
            let delayed: u64 = conn.zcard(self.keys.delayed(&job.queue)).await?;
            let depth = ready + delayed;
            if depth >= limit {
                return Err(JobError::QueueSaturated {
                    queue: job.queue.clone(),
                    depth,
                    limit,
                });
            }
        }

        job.status = JobStatus::Queued;
        job.leased_by = None;
        self.save(&mut conn, &job).await?;
        // Not in a ready or delayed set yet, so no worker can lease it.
        on_admit(&job);
        self.schedule(&mut conn, &job).await?;

        debug!(
            job_id = %job.id,
            queue = %job.queue,
            priority = %job.priority,
            "Enqueued job"
        );

        Ok(job.id)
    }

    async fn lease(&self, queue: &str, worker_id: &str, lease_for: Duration) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;

        self.recover_expired(&mut conn, queue).await?;
        self.promote_delayed(&mut conn, queue).await?;

        loop {
            // ZPOPMIN atomically takes the id with the lowest score (highest priority).
            let popped: Vec<(String, f64)> = conn.zpopmin(self.keys.ready(queue), 1).await?;
            let Some((id, _score)) = popped.into_iter().next() else {
                return Ok(None);
            };

            let mut job = match self.load(&mut conn, &id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job_id = %id, queue = %queue, "Skipping ready id without a job record");
                    continue;
                }
                Err(e) => {
                    error!(job_id = %id, error = %e, "Failed to deserialize job record");
                    continue;
                }
            };

            job.status = JobStatus::Active;
            job.leased_by = Some(worker_id.to_string());
            self.save(&mut conn, &job).await?;

            let expires_at = Utc::now().timestamp_millis() + lease_for.as_millis() as i64;
            let _: () = redis::pipe()
                .hset(self.keys.active(queue), &id, worker_id)
                .zadd(self.keys.leases(queue), &id, expires_at as f64)
                .query_async(&mut *conn)
                .await?;

            debug!(job_id = %id, queue = %queue, worker_id = %worker_id, "Leased job");
            return Ok(Some(job));
        }
    }

    async fn ack(&self, job: &Job) -> JobResult<()> {
        let mut conn = self.conn().await?;
        self.release(&mut conn, job).await?;

        let mut record = job.clone();
        record.status = JobStatus::Completed;
        record.leased_by = None;
        let _: () = conn
            .set_ex(self.keys.job(job.id.as_str()), record.to_json()?, COMPLETED_RETENTION.as_secs())
            .await?;

        debug!(job_id = %job.id, "Completed job");
        Ok(())
    }

    async fn reschedule(&self, job: &Job, on_requeue: AdmitHook<'_>) -> JobResult<()> {
        let mut conn = self.conn().await?;
        self.release(&mut conn, job).await?;

        let mut record = job.clone();
        record.status = JobStatus::Queued;
        record.leased_by = None;
        self.save(&mut conn, &record).await?;
        on_requeue(&record);
        self.schedule(&mut conn, &record).await
    }

    async fn dead_letter(&self, job: &Job, entry: &DeadLetterEntry) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.hexists(self.keys.dead_letters(), entry.job_id.as_str()).await?;
        if exists {
            return Ok(false);
        }
        self.release(&mut conn, job).await?;

        let mut record = job.clone();
        record.status = JobStatus::DeadLettered;
        record.leased_by = None;
        // Plain SET clears any TTL, so dead-lettered records never expire.
        let _: () = redis::pipe()
            .atomic()
            .set(self.keys.job(job.id.as_str()), record.to_json()?)
            .hset(self.keys.dead_letters(), entry.job_id.as_str(), serde_json::to_string(entry)?)
            .query_async(&mut *conn)
            .await?;
        Ok(true)
    }

    async fn mark_failed(&self, job: &Job) -> JobResult<()> {
        self.finish(job, JobStatus::Failed).await
    }

    async fn dead_letters(&self) -> JobResult<Vec<DeadLetterEntry>> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = conn.hvals(self.keys.dead_letters()).await?;
        values.iter().map(|json| Self::parse_entry(json)).collect()
    }

    async fn get_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.hget(self.keys.dead_letters(), job_id.as_str()).await?;
        json.as_deref().map(Self::parse_entry).transpose()
    }

    async fn take_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.hget(self.keys.dead_letters(), job_id.as_str()).await?;
        let Some(json) = json else {
            return Ok(None);
        };
        // Only the caller whose HDEL removed the field owns the entry.
        let removed: i64 = conn.hdel(self.keys.dead_letters(), job_id.as_str()).await?;
        if removed == 0 {
            return Ok(None);
        }
        Self::parse_entry(&json).map(Some)
    }

    async fn restore_dead_letter(&self, entry: &DeadLetterEntry) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: bool = conn
            .hset_nx(self.keys.dead_letters(), entry.job_id.as_str(), serde_json::to_string(entry)?)
            .await?;
        Ok(())
    }

    async fn purge_dead_letters(&self, failed_before: DateTime<Utc>) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let all: HashMap<String, String> = conn.hgetall(self.keys.dead_letters()).await?;

        let mut purged = 0u64;
        for (job_id, json) in all {
            let expired = match Self::parse_entry(&json) {
                Ok(entry) => entry.failed_at < failed_before,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Keeping unreadable dead letter entry");
                    false
                }
            };
            if expired {
                let removed: u64 = conn.hdel(self.keys.dead_letters(), &job_id).await?;
                purged += removed;
            }
        }
        Ok(purged)
    }

    async fn get(&self, job_id: &JobId) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, job_id.as_str()).await
    }

    async fn depth(&self, queue: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let ready: u64 = conn.zcard(self.keys.ready(queue)).await?;
        let delayed: u64 = conn.zcard(self.keys.delayed(queue)).await?;
        Ok(ready + delayed)
    }

    async fn active_count(&self, queue: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(self.keys.leases(queue)).await?)
    }

    async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
