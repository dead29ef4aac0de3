//! Job record and lifecycle status.

use crate::error::{JobError, JobResult};
use crate::payload::{JobPayload, JobType};
use crate::queue::{EnqueueOptions, Priority};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in its queue (possibly delayed until `available_at`).
    Queued,
    /// Leased by a worker.
    Active,
    /// Processed successfully.
    Completed,
    /// Failed terminally with dead-lettering disabled.
    Failed,
    /// Moved to the dead letter queue.
    DeadLettered,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Returns true once the job can no longer change.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLettered
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of deferred work with its retry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub queue: String,
    pub payload: JobPayload,
    pub priority: Priority,

    /// Retries consumed so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,

    /// Earliest time a worker may lease the job.
    pub available_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub status: JobStatus,

    /// Dependency keys gated in addition to the ones the processor declares.
    #[serde(default)]
    pub dependency_keys: Vec<String>,

    pub correlation_id: Option<String>,
    pub user_id: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Worker holding the current lease, set only while `Active`.
    #[serde(default)]
    pub leased_by: Option<String>,
}

impl Job {
    /// Creates a queued job from a payload and enqueue options.
    ///
    /// Fails with `Validation` when the delay cannot be represented as a
    /// point in time.
    pub fn new(payload: JobPayload, options: EnqueueOptions, max_attempts: u32) -> JobResult<Self> {
        let now = Utc::now();
        let job_type = payload.job_type();
        let available_at = match options.delay {
            Some(delay) => ChronoDuration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or_else(|| JobError::Validation(format!("delay of {:?} is out of range", delay)))?,
            None => now,
        };

        Ok(Self {
            id: JobId::new(),
            job_type,
            queue: job_type.queue_name().to_string(),
            payload,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(max_attempts),
            created_at: now,
            available_at,
            last_error: None,
            status: JobStatus::Queued,
            dependency_keys: options.dependency_keys,
            correlation_id: options.correlation_id,
            user_id: options.user_id,
            tags: options.tags,
            leased_by: None,
        })
    }

    /// Returns true if a further transient failure still leaves a retry.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns true once the job may be leased.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at <= now
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::EmailPayload;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn payload() -> JobPayload {
        JobPayload::Email(EmailPayload {
            to: "user@example.com".into(),
            template: "welcome".into(),
            variables: BTreeMap::new(),
            subject: None,
        })
    }

    #[test]
    fn test_job_id_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_eq!(JobId::from("abc").as_str(), "abc");
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(payload(), EnqueueOptions::default(), 3).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.queue, "email");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, Priority::Normal);
        assert!(job.is_available(Utc::now()));
    }

    #[test]
    fn test_delay_and_overrides() {
        let options = EnqueueOptions::default()
            .priority(Priority::High)
            .delay(Duration::from_secs(60))
            .max_attempts(5)
            .user_id("u-1");
        let job = Job::new(payload(), options, 3).unwrap();
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.user_id.as_deref(), Some("u-1"));
        assert!(!job.is_available(Utc::now()));
    }

    #[test]
    fn test_can_retry_until_max() {
        let mut job = Job::new(payload(), EnqueueOptions::default(), 2).unwrap();
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(!job.can_retry());
    }

    #[test]
    fn test_json_round_trip_keeps_status() {
        let mut job = Job::new(payload(), EnqueueOptions::default(), 3).unwrap();
        job.status = JobStatus::DeadLettered;
        let parsed = Job::from_json(&job.to_json().unwrap()).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_unrepresentable_delay_is_validation_error() {
        let options = EnqueueOptions::default().delay(Duration::from_secs(31_536_000_000_000));
        let err = Job::new(payload(), options, 3).unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }
}
