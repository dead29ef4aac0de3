//! In-process job store.

use super::{AdmitHook, JobStore, COMPLETED_RETENTION};
use crate::dlq::DeadLetterEntry;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct Lease {
    worker_id: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<JobId>,
    active: HashMap<JobId, Lease>,
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<JobId, Job>,
    queues: HashMap<String, QueueState>,
    /// Completed job ids in completion order.
    completed: VecDeque<(Instant, JobId)>,
    dead_letters: HashMap<JobId, DeadLetterEntry>,
}

impl StoreInner {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    /// Moves a leased job out of its queue's active set.
    ///
    /// Only the worker named in `job.leased_by` may release the lease.
    fn release(&mut self, job: &Job) -> JobResult<()> {
        let queue = self.queue(&job.queue);
        let Some(lease) = queue.active.get(&job.id) else {
            return Err(JobError::invalid_state("active", "not leased"));
        };
        if job.leased_by.as_deref() != Some(lease.worker_id.as_str()) {
            return Err(JobError::invalid_state(
                format!("leased by {}", job.leased_by.as_deref().unwrap_or("nobody")),
                format!("leased by {}", lease.worker_id),
            ));
        }
        queue.active.remove(&job.id);
        Ok(())
    }

    /// Returns jobs whose lease ran out to the pending set.
    fn recover_expired(&mut self, queue_name: &str, now: Instant) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let expired: Vec<JobId> = queue
            .active
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lease) = queue.active.remove(&id) {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.status = JobStatus::Queued;
                    job.leased_by = None;
                    job.last_error = Some(format!("lease held by {} expired", lease.worker_id));
                }
                queue.pending.push(id.clone());
                warn!(job_id = %id, worker_id = %lease.worker_id, queue = %queue_name, "Recovered job with expired lease");
            }
        }
    }

    /// Drops completed records older than `retention`.
    fn prune_completed(&mut self, now: Instant, retention: Duration) {
        while let Some((finished_at, _)) = self.completed.front() {
            if now.duration_since(*finished_at) < retention {
                break;
            }
            if let Some((_, id)) = self.completed.pop_front() {
                if self.jobs.get(&id).is_some_and(|job| job.status == JobStatus::Completed) {
                    self.jobs.remove(&id);
                }
            }
        }
    }

    fn finish(&mut self, job: &Job, status: JobStatus) -> JobResult<()> {
        self.release(job)?;
        let mut record = job.clone();
        record.status = status;
        record.leased_by = None;
        self.jobs.insert(record.id.clone(), record);
        Ok(())
    }
}

/// Job store that keeps everything in process memory.
///
/// All operations take one lock, so leases are exclusive and the saturation
/// check is atomic with the insert. Completed records are dropped after the
/// retention period; dead-lettered and failed records are kept.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: Mutex<StoreInner>,
    retention: Duration,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::with_retention(COMPLETED_RETENTION)
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that keeps completed records for `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            retention,
        }
    }

    /// Number of job records held, in any status.
    pub fn record_count(&self) -> usize {
        self.inner.lock().jobs.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, mut job: Job, max_depth: Option<u64>, on_admit: AdmitHook<'_>) -> JobResult<JobId> {
        let mut inner = self.inner.lock();
        inner.prune_completed(Instant::now(), self.retention);
        let queue = inner.queue(&job.queue);
        let depth = queue.pending.len() as u64;

        if let Some(limit) = max_depth {
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
        on_admit(&job);

        let id = job.id.clone();
        queue.pending.push(id.clone());
        inner.jobs.insert(id.clone(), job);

        Ok(id)
    }

    async fn lease(&self, queue_name: &str, worker_id: &str, lease_for: Duration) -> JobResult<Option<Job>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.recover_expired(queue_name, now);

        let wall_now = Utc::now();
        let StoreInner { jobs, queues, .. } = &mut *inner;
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(None);
        };

        let next = queue
            .pending
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| jobs.get(id).map(|job| (idx, job)))
            .filter(|(_, job)| job.available_at <= wall_now)
            .max_by_key(|(_, job)| (job.priority, Reverse(job.available_at), Reverse(job.created_at)))
            .map(|(idx, _)| idx);

        let Some(idx) = next else {
            return Ok(None);
        };

        let id = queue.pending.swap_remove(idx);
        let Some(job) = jobs.get_mut(&id) else {
            return Err(JobError::Store(format!("pending job {} has no record", id)));
        };
        job.status = JobStatus::Active;
        job.leased_by = Some(worker_id.to_string());
        queue.active.insert(
            id.clone(),
            Lease {
                worker_id: worker_id.to_string(),
                expires_at: now + lease_for,
            },
        );

        debug!(job_id = %id, queue = %queue_name, worker_id = %worker_id, "Leased job");
        Ok(Some(job.clone()))
    }

    async fn ack(&self, job: &Job) -> JobResult<()> {
        let mut inner = self.inner.lock();
        inner.finish(job, JobStatus::Completed)?;
        let now = Instant::now();
        inner.completed.push_back((now, job.id.clone()));
        inner.prune_completed(now, self.retention);
        Ok(())
    }

    async fn reschedule(&self, job: &Job, on_requeue: AdmitHook<'_>) -> JobResult<()> {
        let mut inner = self.inner.lock();
        inner.release(job)?;
        let mut record = job.clone();
        record.status = JobStatus::Queued;
        record.leased_by = None;
        on_requeue(&record);
        inner.queue(&job.queue).pending.push(job.id.clone());
        inner.jobs.insert(record.id.clone(), record);
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, entry: &DeadLetterEntry) -> JobResult<bool> {
        let mut inner = self.inner.lock();
        if inner.dead_letters.contains_key(&entry.job_id) {
            return Ok(false);
        }
        inner.finish(job, JobStatus::DeadLettered)?;
        inner.dead_letters.insert(entry.job_id.clone(), entry.clone());
        Ok(true)
    }

    async fn mark_failed(&self, job: &Job) -> JobResult<()> {
        self.inner.lock().finish(job, JobStatus::Failed)
    }

    async fn dead_letters(&self) -> JobResult<Vec<DeadLetterEntry>> {
        Ok(self.inner.lock().dead_letters.values().cloned().collect())
    }

    async fn get_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        Ok(self.inner.lock().dead_letters.get(job_id).cloned())
    }

    async fn take_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        Ok(self.inner.lock().dead_letters.remove(job_id))
    }

    async fn restore_dead_letter(&self, entry: &DeadLetterEntry) -> JobResult<()> {
        self.inner
            .lock()
            .dead_letters
            .entry(entry.job_id.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn purge_dead_letters(&self, failed_before: DateTime<Utc>) -> JobResult<u64> {
        let mut inner = self.inner.lock();
        let before = inner.dead_letters.len();
        inner.dead_letters.retain(|_, e| e.failed_at >= failed_before);
        Ok((before - inner.dead_letters.len()) as u64)
    }

    async fn get(&self, job_id: &JobId) -> JobResult<Option<Job>> {
        Ok(self.inner.lock().jobs.get(job_id).cloned())
    }

    async fn depth(&self, queue: &str) -> JobResult<u64> {
        Ok(self
            .inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.pending.len() as u64))
    }

    async fn active_count(&self, queue: &str) -> JobResult<u64> {
        Ok(self
            .inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.active.len() as u64))
    }

    async fn health_check(&self) -> JobResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{EmailPayload, JobPayload};
    use crate::queue::{EnqueueOptions, Priority};
    use std::collections::BTreeMap;

    fn job(options: EnqueueOptions) -> Job {
        let payload = JobPayload::Email(EmailPayload {
            to: "user@example.com".into(),
            template: "welcome".into(),
            variables: BTreeMap::new(),
            subject: None,
        });
        Job::new(payload, options, 3).unwrap()
    }

    fn no_hook(_: &Job) {}

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();

        let leased = store.lease("email", "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.status, JobStatus::Active);
        assert_eq!(leased.leased_by.as_deref(), Some("w1"));
        assert!(store.lease("email", "w2", LEASE).await.unwrap().is_none());
        assert_eq!(store.active_count("email").await.unwrap(), 1);
        assert_eq!(store.depth("email").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let store = InMemoryJobStore::new();
        let low = store
            .enqueue(job(EnqueueOptions::new().priority(Priority::Low)), None, &no_hook)
            .await
            .unwrap();
        let first = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let critical = store
            .enqueue(job(EnqueueOptions::new().priority(Priority::Critical)), None, &no_hook)
            .await
            .unwrap();

        let order: Vec<JobId> = {
            let mut ids = Vec::new();
            while let Some(job) = store.lease("email", "w1", LEASE).await.unwrap() {
                ids.push(job.id);
            }
            ids
        };
        assert_eq!(order, vec![critical, first, low]);
    }

    #[tokio::test]
    async fn test_delayed_job_not_leased_early() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(job(EnqueueOptions::new().delay(Duration::from_secs(60))), None, &no_hook)
            .await
            .unwrap();
        assert!(store.lease("email", "w1", LEASE).await.unwrap().is_none());
        assert_eq!(store.depth("email").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_saturation() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(EnqueueOptions::new()), Some(2), &no_hook).await.unwrap();
        store.enqueue(job(EnqueueOptions::new()), Some(2), &no_hook).await.unwrap();
        let err = store
            .enqueue(job(EnqueueOptions::new()), Some(2), &no_hook)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::QueueSaturated { depth: 2, limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_admit_hook_runs_before_job_is_leasable() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let store = InMemoryJobStore::new();
        let admitted = AtomicBool::new(false);
        let hook = |job: &Job| {
            assert_eq!(job.status, JobStatus::Queued);
            admitted.store(true, Ordering::SeqCst);
        };
        store.enqueue(job(EnqueueOptions::new()), None, &hook).await.unwrap();
        assert!(admitted.load(Ordering::SeqCst));

        // A rejected job never reaches the hook.
        let rejected = AtomicBool::new(false);
        let hook = |_: &Job| rejected.store(true, Ordering::SeqCst);
        store.enqueue(job(EnqueueOptions::new()), Some(1), &hook).await.unwrap_err();
        assert!(!rejected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ack_and_terminal_transfers() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let leased = store.lease("email", "w1", LEASE).await.unwrap().unwrap();

        store.ack(&leased).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, JobStatus::Completed);
        let entry = DeadLetterEntry::from_job(&leased, "late", false);
        assert!(store.dead_letter(&leased, &entry).await.is_err());
        assert!(store.get_dead_letter(&id).await.unwrap().is_none());

        let id = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let leased = store.lease("email", "w1", LEASE).await.unwrap().unwrap();
        let entry = DeadLetterEntry::from_job(&leased, "bounced", false);
        assert!(store.dead_letter(&leased, &entry).await.unwrap());
        assert!(!store.dead_letter(&leased, &entry).await.unwrap());
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::DeadLettered);
        assert_eq!(record.leased_by, None);
        assert_eq!(store.active_count("email").await.unwrap(), 0);
        assert_eq!(store.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_take_restore_purge() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let leased = store.lease("email", "w1", LEASE).await.unwrap().unwrap();
        let entry = DeadLetterEntry::from_job(&leased, "bounced", false);
        store.dead_letter(&leased, &entry).await.unwrap();

        let taken = store.take_dead_letter(&id).await.unwrap().unwrap();
        assert!(store.take_dead_letter(&id).await.unwrap().is_none());
        store.restore_dead_letter(&taken).await.unwrap();
        assert_eq!(store.get_dead_letter(&id).await.unwrap(), Some(taken));

        let cutoff = entry.failed_at - chrono::Duration::seconds(1);
        assert_eq!(store.purge_dead_letters(cutoff).await.unwrap(), 0);
        let cutoff = entry.failed_at + chrono::Duration::seconds(1);
        assert_eq!(store.purge_dead_letters(cutoff).await.unwrap(), 1);
        assert!(store.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_returns_job() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let mut leased = store.lease("email", "w1", LEASE).await.unwrap().unwrap();
        leased.attempts = 1;
        store.reschedule(&leased, &no_hook).await.unwrap();

        let again = store.lease("email", "w2", LEASE).await.unwrap().unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(again.leased_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_expired_lease_recovered_without_attempt() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        store.lease("email", "w1", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let recovered = store.lease("email", "w2", LEASE).await.unwrap().unwrap();
        assert_eq!(recovered.id, id);
        assert_eq!(recovered.attempts, 0);
        assert!(recovered.last_error.unwrap().contains("w1"));
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_finish_reassigned_job() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let stale = store
            .lease("email", "w1", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let current = store.lease("email", "w2", LEASE).await.unwrap().unwrap();

        let err = store.ack(&stale).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
        assert!(store.reschedule(&stale, &no_hook).await.is_err());
        assert!(store.mark_failed(&stale).await.is_err());
        assert_eq!(store.active_count("email").await.unwrap(), 1);

        store.ack(&current).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_completed_records_expire_after_retention() {
        let store = InMemoryJobStore::with_retention(Duration::from_millis(20));
        let done = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let leased = store.lease("email", "w1", LEASE).await.unwrap().unwrap();
        store.ack(&leased).await.unwrap();

        let dead = store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();
        let leased = store.lease("email", "w1", LEASE).await.unwrap().unwrap();
        let entry = DeadLetterEntry::from_job(&leased, "bounced", false);
        store.dead_letter(&leased, &entry).await.unwrap();
        assert_eq!(store.record_count(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.enqueue(job(EnqueueOptions::new()), None, &no_hook).await.unwrap();

        assert!(store.get(&done).await.unwrap().is_none());
        assert!(store.get(&dead).await.unwrap().is_some());
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn test_empty_store_is_healthy() {
        let store = InMemoryJobStore::new();
        tokio_test::assert_ok!(tokio_test::block_on(store.health_check()));
        assert_eq!(tokio_test::block_on(store.depth("email")).unwrap(), 0);
        assert!(tokio_test::block_on(store.get(&JobId::new())).unwrap().is_none());
    }
}
