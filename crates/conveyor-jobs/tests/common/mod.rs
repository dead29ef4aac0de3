//! Common test infrastructure for job system integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_config::{AppConfig, ProcessorConfig};
use conveyor_jobs::{
    AdmitHook, DeadLetterEntry, EmailPayload, EventType, InMemoryJobStore, Job, JobId, JobResult,
    JobStore, JobSystem, JobType, ProcessError, Processor, ProcessorMetrics,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Script = Box<dyn Fn(u32) -> Result<(), ProcessError> + Send + Sync>;

/// Processor whose outcome is decided by a script over the call number (1-based).
pub struct ScriptedProcessor {
    job_type: JobType,
    dependency: String,
    script: Script,
    delay: Duration,
    calls: AtomicU32,
    in_flight: AtomicU32,
    peak: AtomicU32,
    metrics: ProcessorMetrics,
}

impl ScriptedProcessor {
    pub fn new(script: impl Fn(u32) -> Result<(), ProcessError> + Send + Sync + 'static) -> Self {
        Self {
            job_type: JobType::Email,
            dependency: "smtp:primary".to_string(),
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            metrics: ProcessorMetrics::new(),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(|_| Ok(()))
    }

    pub fn always_transient() -> Self {
        Self::new(|call| Err(ProcessError::transient(format!("smtp unavailable (call {})", call))))
    }

    /// Fails transiently `n` times, then succeeds.
    pub fn fail_times(n: u32) -> Self {
        Self::new(move |call| {
            if call <= n {
                Err(ProcessError::transient("connection reset"))
            } else {
                Ok(())
            }
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `process` calls observed.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn dependency_keys(&self, _job: &Job) -> Vec<String> {
        vec![self.dependency.clone()]
    }

    async fn process(&self, _job: &Job) -> Result<(), ProcessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.script)(call)
    }

    fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }
}

/// Config with millisecond retry delays and only the email queue enabled.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.poll_interval_ms = 5;
    config.worker.job_timeout_secs = 5;
    config.queue.retry.base_delay_ms = 5;
    config.queue.retry.max_delay_ms = 20;
    config.queue.retry.jitter_ms = 0;
    config.queue.retry.max_attempts = 3;
    config.processors.email = ProcessorConfig::new(true, 1);
    config.processors.push_notification = ProcessorConfig::new(false, 1);
    config
}

pub fn system_with(config: AppConfig, processor: Arc<ScriptedProcessor>) -> JobSystem {
    let system = JobSystem::new(config, Arc::new(InMemoryJobStore::new()));
    system.register_processor(processor);
    system
}

pub fn email_payload() -> EmailPayload {
    EmailPayload {
        to: "reader@example.com".into(),
        template: "welcome".into(),
        variables: BTreeMap::new(),
        subject: None,
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Event types recorded for one job, in log order.
pub fn event_types(system: &JobSystem, job_id: &JobId) -> Vec<EventType> {
    system
        .events()
        .entries_for(job_id)
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// Waits until the job has an event of type `terminal`.
pub async fn wait_for_event(system: &JobSystem, job_id: &JobId, terminal: EventType) -> bool {
    wait_until(Duration::from_secs(5), || event_types(system, job_id).contains(&terminal)).await
}

/// Value of the exposition sample line for `series`, e.g. `name{label="v"}`.
pub fn sample(text: &str, series: &str) -> Option<f64> {
    text.lines()
        .find_map(|line| line.strip_prefix(series)?.strip_prefix(' '))
        .and_then(|value| value.trim().parse().ok())
}

/// In-memory store whose `enqueue` returns only `delay` after the job is
/// committed, like a store behind a slow network round trip.
pub struct SlowAdmitStore {
    inner: InMemoryJobStore,
    delay: Duration,
}

impl SlowAdmitStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl JobStore for SlowAdmitStore {
    async fn enqueue(&self, job: Job, max_depth: Option<u64>, on_admit: AdmitHook<'_>) -> JobResult<JobId> {
        let id = self.inner.enqueue(job, max_depth, on_admit).await?;
        tokio::time::sleep(self.delay).await;
        Ok(id)
    }

    async fn lease(&self, queue: &str, worker_id: &str, lease_for: Duration) -> JobResult<Option<Job>> {
        self.inner.lease(queue, worker_id, lease_for).await
    }

    async fn ack(&self, job: &Job) -> JobResult<()> {
        self.inner.ack(job).await
    }

    async fn reschedule(&self, job: &Job, on_requeue: AdmitHook<'_>) -> JobResult<()> {
        self.inner.reschedule(job, on_requeue).await
    }

    async fn dead_letter(&self, job: &Job, entry: &DeadLetterEntry) -> JobResult<bool> {
        self.inner.dead_letter(job, entry).await
    }

    async fn mark_failed(&self, job: &Job) -> JobResult<()> {
        self.inner.mark_failed(job).await
    }

    async fn dead_letters(&self) -> JobResult<Vec<DeadLetterEntry>> {
        self.inner.dead_letters().await
    }

    async fn get_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        self.inner.get_dead_letter(job_id).await
    }

    async fn take_dead_letter(&self, job_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        self.inner.take_dead_letter(job_id).await
    }

    async fn restore_dead_letter(&self, entry: &DeadLetterEntry) -> JobResult<()> {
        self.inner.restore_dead_letter(entry).await
    }

    async fn purge_dead_letters(&self, failed_before: DateTime<Utc>) -> JobResult<u64> {
        self.inner.purge_dead_letters(failed_before).await
    }

    async fn get(&self, job_id: &JobId) -> JobResult<Option<Job>> {
        self.inner.get(job_id).await
    }

    async fn depth(&self, queue: &str) -> JobResult<u64> {
        self.inner.depth(queue).await
    }

    async fn active_count(&self, queue: &str) -> JobResult<u64> {
        self.inner.active_count(queue).await
    }

    async fn health_check(&self) -> JobResult<()> {
        self.inner.health_check().await
    }
}
