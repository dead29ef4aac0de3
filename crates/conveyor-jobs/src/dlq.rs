//! Dead letter queue.
//!
//! Holds jobs that failed permanently or exhausted their retries, with the
//! reason they failed. Entries are stored by the job store, so they survive a
//! restart whenever the store does. Entries leave only through an explicit
//! requeue or purge; nothing here expires on its own.

use crate::error::JobResult;
use crate::job::{Job, JobId};
use crate::payload::{JobPayload, JobType};
use crate::queue::{EnqueueOptions, Priority};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A permanently failed job with diagnostic metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    /// False when the processor classified the failure as permanent.
    pub retryable: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependency_keys: Vec<String>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &Job, reason: &str, retryable: bool) -> Self {
        Self {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            job_type: job.job_type,
            payload: job.payload.clone(),
            failure_reason: reason.to_string(),
            failed_at: Utc::now(),
            retryable,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            priority: job.priority,
            correlation_id: job.correlation_id.clone(),
            user_id: job.user_id.clone(),
            tags: job.tags.clone(),
            dependency_keys: job.dependency_keys.clone(),
        }
    }

    /// Builds a fresh job (new id, zero attempts) carrying this entry's work.
    pub fn to_job(&self) -> JobResult<Job> {
        let options = EnqueueOptions {
            priority: self.priority,
            delay: None,
            max_attempts: Some(self.max_attempts),
            user_id: self.user_id.clone(),
            correlation_id: self.correlation_id.clone(),
            tags: self.tags.clone(),
            dependency_keys: self.dependency_keys.clone(),
        };
        Job::new(self.payload.clone(), options, self.max_attempts)
    }
}

/// Filter for [`DeadLetterQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub queue: Option<String>,
    pub job_type: Option<JobType>,
    pub retryable: Option<bool>,
    pub failed_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.queue.as_deref().map_or(true, |q| entry.queue == q)
            && self.job_type.map_or(true, |t| entry.job_type == t)
            && self.retryable.map_or(true, |r| entry.retryable == r)
            && self.failed_after.map_or(true, |t| entry.failed_at > t)
    }
}

/// Aggregate view of the dead letter queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterStats {
    pub enabled: bool,
    pub total: u64,
    pub retryable: u64,
    pub by_queue: BTreeMap<String, u64>,
    pub by_job_type: BTreeMap<JobType, u64>,
    pub oldest_failed_at: Option<DateTime<Utc>>,
}

/// Dead letter queue over the job store's entries.
///
/// Adds idempotent capture, filtering and stats; all state lives in the store.
pub struct DeadLetterQueue {
    enabled: bool,
    store: Arc<dyn JobStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn JobStore>, enabled: bool) -> Self {
        Self { enabled, store }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Moves a leased job to the dead letter queue. Capturing the same job
    /// id twice is a no-op.
    ///
    /// Returns true when a new entry was created.
    pub async fn capture(&self, job: &Job, reason: &str, retryable: bool) -> JobResult<bool> {
        let entry = DeadLetterEntry::from_job(job, reason, retryable);
        let created = self.store.dead_letter(job, &entry).await?;
        if created {
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                attempts = job.attempts,
                retryable,
                reason = %reason,
                "Job dead-lettered"
            );
        }
        Ok(created)
    }

    pub async fn get(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        self.store.get_dead_letter(job_id).await
    }

    pub async fn contains(&self, job_id: &JobId) -> JobResult<bool> {
        Ok(self.get(job_id).await?.is_some())
    }

    pub async fn len(&self) -> JobResult<usize> {
        Ok(self.store.dead_letters().await?.len())
    }

    pub async fn is_empty(&self) -> JobResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Entries matching `filter`, newest failure first.
    pub async fn list(&self, filter: &DeadLetterFilter) -> JobResult<Vec<DeadLetterEntry>> {
        let mut matched: Vec<DeadLetterEntry> = self
            .store
            .dead_letters()
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        matched.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| a.job_id.cmp(&b.job_id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Removes and returns an entry so it can be requeued.
    pub async fn take(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        self.store.take_dead_letter(job_id).await
    }

    /// Puts back an entry whose requeue failed.
    pub async fn restore(&self, entry: &DeadLetterEntry) -> JobResult<()> {
        self.store.restore_dead_letter(entry).await
    }

    /// Deletes entries that failed more than `older_than` ago.
    ///
    /// Returns the number of entries removed.
    pub async fn purge(&self, older_than: Duration) -> JobResult<u64> {
        let threshold = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.purge_dead_letters(threshold).await?;
        if removed > 0 {
            info!(count = removed, "Purged dead letter entries");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> JobResult<DeadLetterStats> {
        let entries = self.store.dead_letters().await?;
        let mut stats = DeadLetterStats {
            enabled: self.enabled,
            total: entries.len() as u64,
            ..DeadLetterStats::default()
        };
        for entry in &entries {
            if entry.retryable {
                stats.retryable += 1;
            }
            *stats.by_queue.entry(entry.queue.clone()).or_default() += 1;
            *stats.by_job_type.entry(entry.job_type).or_default() += 1;
            stats.oldest_failed_at = Some(match stats.oldest_failed_at {
                Some(oldest) => oldest.min(entry.failed_at),
                None => entry.failed_at,
            });
        }
        Ok(stats)
    }
}
