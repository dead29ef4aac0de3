//! Job store abstraction.
//!
//! A store owns durable job records and the primitives the dispatcher drives
//! them through: enqueue, lease, acknowledge, reschedule and terminal
//! transfer. A lease grants one worker exclusive ownership of a job until it
//! is acknowledged, rescheduled or dead-lettered, or until the lease expires.

mod memory;

pub use memory::InMemoryJobStore;

use crate::dlq::DeadLetterEntry;
use crate::error::JobResult;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How long completed job records stay readable.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Callback run once a job is admitted or requeued, before any worker can lease it.
pub type AdmitHook<'a> = &'a (dyn Fn(&Job) + Send + Sync);

/// Job store trait for different backends.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a queued job.
    ///
    /// With `max_depth` set, fails with `QueueSaturated` when the queue
    /// already holds that many pending jobs. `on_admit` runs after the
    /// saturation check and before the job becomes leasable.
    async fn enqueue(&self, job: Job, max_depth: Option<u64>, on_admit: AdmitHook<'_>) -> JobResult<JobId>;

    /// Leases the next available job of `queue`, highest priority first and
    /// then earliest `available_at`. The returned job is `Active`.
    async fn lease(&self, queue: &str, worker_id: &str, lease_for: Duration) -> JobResult<Option<Job>>;

    /// Marks a leased job completed.
    ///
    /// Every transition out of `Active` fails with `InvalidState` unless
    /// `job.leased_by` still holds the lease.
    async fn ack(&self, job: &Job) -> JobResult<()>;

    /// Returns a leased job to its queue. The caller has already updated
    /// `attempts`, `available_at` and `last_error`. `on_requeue` runs after
    /// the lease is released and before the job becomes leasable again.
    async fn reschedule(&self, job: &Job, on_requeue: AdmitHook<'_>) -> JobResult<()>;

    /// Records a leased job as dead-lettered together with its entry.
    ///
    /// Returns false, changing nothing, when an entry for the job id
    /// already exists. Dead-lettered records never expire.
    async fn dead_letter(&self, job: &Job, entry: &DeadLetterEntry) -> JobResult<bool>;

    /// Records a leased job as terminally failed.
    async fn mark_failed(&self, job: &Job) -> JobResult<()>;

    /// Every stored dead letter entry, in no particular order.
    async fn dead_letters(&self) -> JobResult<Vec<DeadLetterEntry>>;

    async fn get_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>>;

    /// Removes and returns a dead letter entry.
    async fn take_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>>;

    /// Puts back an entry removed by `take_dead_letter`. Keeps an existing entry.
    async fn restore_dead_letter(&self, entry: &DeadLetterEntry) -> JobResult<()>;

    /// Deletes entries that failed before `failed_before`; returns how many.
    async fn purge_dead_letters(&self, failed_before: DateTime<Utc>) -> JobResult<u64>;

    /// Fetches a job record.
    async fn get(&self, job_id: &JobId) -> JobResult<Option<Job>>;

    /// Number of pending (queued or delayed) jobs in `queue`.
    async fn depth(&self, queue: &str) -> JobResult<u64>;

    /// Number of leased jobs in `queue`.
    async fn active_count(&self, queue: &str) -> JobResult<u64>;

    /// Health check.
    async fn health_check(&self) -> JobResult<()>;
}
