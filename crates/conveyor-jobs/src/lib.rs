//! Conveyor Jobs - asynchronous job processing core
//!
//! Producers enqueue typed, validated jobs; per-queue dispatchers lease them
//! from a [`JobStore`] and run the matching [`Processor`] under a reliability
//! envelope:
//! - Retries with exponential backoff and jitter
//! - Per-dependency circuit breakers gating every processor call
//! - Dead letter queue for permanent failures and exhausted retries
//! - Append-only event log with periodic snapshots
//! - Per-processor, per-queue and per-breaker metrics
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          JobSystem                               │
//! │                                                                  │
//! │  add_*_job ──validate──▶ JobStore ◀──lease/ack/reschedule──┐     │
//! │                  │        (memory | redis)                 │     │
//! │                  ▼                                         │     │
//! │              EventLog ◀───────────────┐            ┌───────┴───┐ │
//! │            (snapshots)                │            │Dispatcher │ │
//! │                                       │            │ N workers │ │
//! │                                       │            └─────┬─────┘ │
//! │                                       │                  ▼       │
//! │  DeadLetterQueue ◀── permanent / ─────┤       CircuitBreakerRegistry
//! │                      exhausted        │                  ▼       │
//! │                                       └──────────── Processor    │
//! │                                                                  │
//! │  MetricsAggregator ── summary + Prometheus text                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_jobs::{EmailPayload, EmailProcessor, EnqueueOptions, InMemoryJobStore, JobSystem, Priority};
//!
//! let system = JobSystem::new(config, Arc::new(InMemoryJobStore::new()));
//! system.register_processor(Arc::new(EmailProcessor::new(
//!     TemplateCatalog::with_defaults(),
//!     Arc::new(LoggingEmailTransport),
//! )));
//! system.initialize().await?;
//!
//! system
//!     .add_email_job(payload, EnqueueOptions::new().priority(Priority::High))
//!     .await?;
//! ```

pub mod aggregator;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod payload;
pub mod processor;
pub mod queue;
pub mod redis;
pub mod retry;
pub mod service;
pub mod store;

pub use aggregator::{MetricsAggregator, MetricsSummary, QueueMetrics};
pub use dispatcher::{DispatchContext, Dispatcher, QueueCounters, QueueCountersSnapshot, StopReport};
pub use dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterQueue, DeadLetterStats};
pub use error::{JobError, JobResult, ProcessError, ProcessErrorKind};
pub use events::{
    AggregateCounters, EventLog, EventLogEntry, EventLogError, EventMetadata, EventType, Snapshot,
};
pub use job::{Job, JobId, JobStatus};
pub use metrics::{register_metrics, JobMetrics};
pub use payload::{
    AnalyticsPayload, AnalyticsPeriod, ContentKind, DeviceToken, EmailPayload, JobPayload, JobType,
    MediaOperation, MediaPayload, ModerationPayload, PushNotificationPayload, PushPlatform,
};
pub use processor::{
    EmailMessage, EmailProcessor, EmailTemplate, EmailTransport, LoggingEmailTransport, LoggingPushGateway,
    Processor, ProcessorMetrics, ProcessorMetricsSnapshot, PushGateway, PushMessage, PushProcessor,
    TemplateCatalog, TransportError,
};
pub use queue::{EnqueueOptions, Priority, QueueDefinition, MAX_ENQUEUE_DELAY};
pub use crate::redis::{create_pool, RedisJobStore, RedisKeys};
pub use retry::RetryPolicy;
pub use service::JobSystem;
pub use store::{AdmitHook, InMemoryJobStore, JobStore, COMPLETED_RETENTION};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::job::{Job, JobId, JobStatus};
    pub use crate::payload::{JobPayload, JobType};
    pub use crate::processor::Processor;
    pub use crate::queue::{EnqueueOptions, Priority};
    pub use crate::service::JobSystem;
    pub use crate::{JobError, JobResult, ProcessError};
}
