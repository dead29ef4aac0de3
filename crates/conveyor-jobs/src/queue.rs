//! Queue definitions, priorities and enqueue options.

use crate::payload::JobType;
use crate::retry::RetryPolicy;
use conveyor_config::{ProcessorConfig, ProcessorsConfig, QueueConfig, WorkerConfig};
use conveyor_core::rules;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::Validate;

/// Job priority levels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(i8)]
pub enum Priority {
    /// Low priority (background tasks).
    Low = -10,
    /// Normal priority (default).
    #[default]
    Normal = 0,
    /// High priority (important tasks).
    High = 10,
    /// Critical priority (time-sensitive).
    Critical = 20,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<i8> for Priority {
    fn from(value: i8) -> Self {
        match value {
            v if v >= 20 => Priority::Critical,
            v if v >= 10 => Priority::High,
            v if v <= -10 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl From<Priority> for i8 {
    fn from(priority: Priority) -> Self {
        priority as i8
    }
}

/// Longest delay accepted at enqueue time.
pub const MAX_ENQUEUE_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Options accepted alongside a payload at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_delay"))]
pub struct EnqueueOptions {
    pub priority: Priority,

    /// Delay before the job becomes available.
    pub delay: Option<Duration>,

    /// Overrides the queue's retry budget for this job.
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: Option<u32>,

    #[validate(length(min = 1, max = 128))]
    pub user_id: Option<String>,

    #[validate(length(min = 1, max = 128))]
    pub correlation_id: Option<String>,

    #[validate(custom(function = "rules::no_blank_entries"))]
    pub tags: Vec<String>,

    /// Extra dependency keys (`system:instance`) gated for this job.
    #[validate(custom(function = "validate_dependency_keys"))]
    pub dependency_keys: Vec<String>,
}

fn validate_delay(options: &EnqueueOptions) -> Result<(), validator::ValidationError> {
    match options.delay {
        Some(delay) if delay > MAX_ENQUEUE_DELAY => {
            let mut error = validator::ValidationError::new("delay_too_long");
            error.message = Some(format!("delay must not exceed {} seconds", MAX_ENQUEUE_DELAY.as_secs()).into());
            Err(error)
        }
        _ => Ok(()),
    }
}

fn validate_dependency_keys(keys: &[String]) -> Result<(), validator::ValidationError> {
    keys.iter().try_for_each(|key| rules::dependency_key(key))
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a delay before execution.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Set correlation ID for tracing.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Gate the job on an additional dependency key.
    pub fn dependency(mut self, key: impl Into<String>) -> Self {
        self.dependency_keys.push(key.into());
        self
    }
}

/// Static definition of one queue. Built from configuration at startup.
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub name: String,
    pub job_type: JobType,
    /// Number of independent worker loops.
    pub concurrency: usize,
    pub retry_policy: RetryPolicy,
    /// Per-job processing deadline.
    pub job_timeout: Duration,
}

impl QueueDefinition {
    pub fn new(job_type: JobType, concurrency: usize, retry_policy: RetryPolicy) -> Self {
        Self {
            name: job_type.queue_name().to_string(),
            job_type,
            concurrency,
            retry_policy,
            job_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builds the definition for `job_type` from the loaded configuration.
    pub fn from_config(
        job_type: JobType,
        processor: &ProcessorConfig,
        queue: &QueueConfig,
        worker: &WorkerConfig,
    ) -> Self {
        let mut retry_policy = RetryPolicy::from(&queue.retry);
        if let Some(max_attempts) = processor.max_attempts {
            retry_policy.max_attempts = max_attempts;
        }
        let job_timeout = processor
            .job_timeout_secs
            .map_or_else(|| worker.job_timeout(), Duration::from_secs);

        Self::new(job_type, processor.concurrency, retry_policy).with_job_timeout(job_timeout)
    }
}

/// Looks up the processor section for a job type.
pub fn processor_config(processors: &ProcessorsConfig, job_type: JobType) -> &ProcessorConfig {
    match job_type {
        JobType::Email => &processors.email,
        JobType::PushNotification => &processors.push_notification,
        JobType::Media => &processors.media,
        JobType::Moderation => &processors.moderation,
        JobType::Analytics => &processors.analytics,
    }
}
