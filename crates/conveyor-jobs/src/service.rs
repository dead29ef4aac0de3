//! Job system facade.
//!
//! Owns the shared reliability state (breakers, dead letter queue, event
//! log) and one dispatcher per enabled queue. Producers enqueue through the
//! typed `add_*_job` methods; operators use the metrics and dead letter
//! methods.

use crate::aggregator::{MetricsAggregator, MetricsSummary, QueueMetrics};
use crate::dispatcher::{DispatchContext, Dispatcher, QueueCounters};
use crate::dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterQueue, DeadLetterStats};
use crate::error::{JobError, JobResult};
use crate::events::{EventLog, EventMetadata, EventType};
use crate::job::{Job, JobId};
use crate::metrics::JobMetrics;
use crate::payload::{
    AnalyticsPayload, EmailPayload, JobPayload, JobType, MediaPayload, ModerationPayload,
    PushNotificationPayload,
};
use crate::processor::{Processor, ProcessorMetricsSnapshot};
use crate::queue::{processor_config, EnqueueOptions, QueueDefinition};
use crate::store::JobStore;
use conveyor_config::AppConfig;
use conveyor_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use validator::Validate;

struct RunningQueue {
    definition: QueueDefinition,
    counters: Arc<QueueCounters>,
}

pub struct JobSystem {
    config: AppConfig,
    store: Arc<dyn JobStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<DeadLetterQueue>,
    events: Arc<EventLog>,
    aggregator: MetricsAggregator,
    processors: RwLock<HashMap<JobType, Arc<dyn Processor>>>,
    queues: RwLock<BTreeMap<JobType, RunningQueue>>,
    dispatchers: Mutex<Vec<Dispatcher>>,
    started: AtomicBool,
    accepting: AtomicBool,
}

impl JobSystem {
    pub fn new(config: AppConfig, store: Arc<dyn JobStore>) -> Self {
        let reliability = &config.reliability;
        let breakers = Arc::new(if reliability.circuit_breaker.enabled {
            let settings = &reliability.circuit_breaker;
            CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: settings.failure_threshold,
                window: settings.window(),
                cooldown: settings.cooldown(),
                half_open_probes: settings.half_open_probes,
            })
        } else {
            CircuitBreakerRegistry::disabled()
        });
        let dlq = Arc::new(DeadLetterQueue::new(
            Arc::clone(&store),
            reliability.dead_letter_queue.enabled,
        ));
        let event_sourcing = &config.event_sourcing;
        let events = Arc::new(if event_sourcing.enabled {
            EventLog::new(event_sourcing.snapshot_frequency)
                .with_retained_snapshots(event_sourcing.retained_snapshots)
                .with_archive_on_compact(event_sourcing.archive_after_compaction)
        } else {
            EventLog::disabled()
        });

        Self {
            aggregator: MetricsAggregator::new(Arc::clone(&breakers), Arc::clone(&dlq)),
            config,
            store,
            breakers,
            dlq,
            events,
            processors: RwLock::new(HashMap::new()),
            queues: RwLock::new(BTreeMap::new()),
            dispatchers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
        }
    }

    /// Registers the processor for its job type, replacing any previous one.
    ///
    /// Must happen before [`JobSystem::initialize`] to take effect.
    pub fn register_processor(&self, processor: Arc<dyn Processor>) {
        let job_type = processor.job_type();
        if self.started.load(Ordering::SeqCst) {
            warn!(job_type = %job_type, "Processor registered after initialize, queue will not be dispatched");
        }
        info!(job_type = %job_type, "Registered processor");
        self.processors.write().insert(job_type, processor);
    }

    /// Starts a dispatcher for every enabled job type that has a processor.
    ///
    /// Returns the number of queues started.
    pub async fn initialize(&self) -> JobResult<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(JobError::invalid_state("not started", "started"));
        }

        if let Err(e) = self.store.health_check().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let context = DispatchContext {
            store: Arc::clone(&self.store),
            breakers: Arc::clone(&self.breakers),
            dlq: Arc::clone(&self.dlq),
            events: Arc::clone(&self.events),
            poll_interval: self.config.worker.poll_interval(),
            lease_margin: self.config.store.lease_timeout(),
        };

        let processors = self.processors.read().clone();
        let mut started = Vec::new();
        for job_type in JobType::ALL {
            let settings = processor_config(&self.config.processors, job_type);
            if !settings.enabled {
                debug!(job_type = %job_type, "Processor disabled, queue not started");
                continue;
            }
            let Some(processor) = processors.get(&job_type) else {
                warn!(job_type = %job_type, "No processor registered, queue not started");
                continue;
            };

            let definition =
                QueueDefinition::from_config(job_type, settings, &self.config.queue, &self.config.worker);
            let counters = Arc::new(QueueCounters::new());
            started.push(Dispatcher::start(
                definition.clone(),
                Arc::clone(processor),
                context.clone(),
                Arc::clone(&counters),
            ));
            self.queues
                .write()
                .insert(job_type, RunningQueue { definition, counters });
        }

        let count = started.len();
        self.dispatchers.lock().extend(started);
        info!(queues = count, "Job system initialized");
        Ok(count)
    }

    /// Stops accepting new jobs and drains every dispatcher within `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let dispatchers: Vec<Dispatcher> = std::mem::take(&mut *self.dispatchers.lock());
        info!(queues = dispatchers.len(), grace_secs = grace.as_secs_f64(), "Shutting down job system...");

        let reports = join_all(dispatchers.into_iter().map(|d| d.stop(grace))).await;
        let aborted: usize = reports.iter().map(|r| r.aborted).sum();
        if aborted > 0 {
            warn!(aborted, "Workers cancelled after grace period");
        }
        info!("Job system stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Validates and enqueues a job, recording an `Enqueued` event.
    pub async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> JobResult<JobId> {
        let job_type = payload.job_type();
        if !self.is_accepting() {
            JobMetrics::job_rejected(job_type.as_str(), "shutting_down");
            return Err(JobError::invalid_state("accepting", "shutting down"));
        }

        if let Err(errors) = payload.validate().and_then(|()| options.validate()) {
            JobMetrics::job_rejected(job_type.as_str(), "validation");
            return Err(errors.into());
        }

        let default_attempts = processor_config(&self.config.processors, job_type)
            .max_attempts
            .unwrap_or(self.config.queue.retry.max_attempts);
        let job = match Job::new(payload, options, default_attempts) {
            Ok(job) => job,
            Err(e) => {
                JobMetrics::job_rejected(job_type.as_str(), "validation");
                return Err(e);
            }
        };
        self.submit(job).await
    }

    /// Stores a job. The `Enqueued` event is appended before any worker can
    /// lease the job.
    async fn submit(&self, job: Job) -> JobResult<JobId> {
        let queue = job.queue.clone();
        let job_type = job.job_type;
        let priority = job.priority;
        let limit = self.config.queue.max_depth;

        let record_enqueued = |job: &Job| {
            self.events.append(
                &job.id,
                EventType::Enqueued,
                EventMetadata::new(job.queue.as_str(), job.attempts),
            );
        };
        let id = match self
            .store
            .enqueue(job, (limit > 0).then_some(limit), &record_enqueued)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if matches!(e, JobError::QueueSaturated { .. }) {
                    JobMetrics::job_rejected(job_type.as_str(), "saturated");
                    warn!(queue = %queue, error = %e, "Enqueue rejected");
                }
                return Err(e);
            }
        };

        JobMetrics::job_enqueued(&queue, job_type.as_str(), priority.as_str());
        debug!(job_id = %id, queue = %queue, priority = %priority, "Job enqueued");
        Ok(id)
    }

    pub async fn add_email_job(&self, payload: EmailPayload, options: EnqueueOptions) -> JobResult<JobId> {
        self.enqueue(payload.into(), options).await
    }

    pub async fn add_push_notification_job(
        &self,
        payload: PushNotificationPayload,
        options: EnqueueOptions,
    ) -> JobResult<JobId> {
        self.enqueue(payload.into(), options).await
    }

    pub async fn add_media_job(&self, payload: MediaPayload, options: EnqueueOptions) -> JobResult<JobId> {
        self.enqueue(payload.into(), options).await
    }

    pub async fn add_moderation_job(&self, payload: ModerationPayload, options: EnqueueOptions) -> JobResult<JobId> {
        self.enqueue(payload.into(), options).await
    }

    pub async fn add_analytics_job(&self, payload: AnalyticsPayload, options: EnqueueOptions) -> JobResult<JobId> {
        self.enqueue(payload.into(), options).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> JobResult<Option<Job>> {
        self.store.get(job_id).await
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Depth and counters of every enabled queue.
    pub async fn get_queue_metrics(&self) -> JobResult<Vec<QueueMetrics>> {
        let running: Vec<(JobType, String, usize, Option<Arc<QueueCounters>>)> = {
            let queues = self.queues.read();
            JobType::ALL
                .into_iter()
                .filter_map(|job_type| match queues.get(&job_type) {
                    Some(q) => Some((
                        job_type,
                        q.definition.name.clone(),
                        q.definition.concurrency,
                        Some(Arc::clone(&q.counters)),
                    )),
                    None if processor_config(&self.config.processors, job_type).enabled => {
                        Some((job_type, job_type.queue_name().to_string(), 0, None))
                    }
                    None => None,
                })
                .collect()
        };

        let mut metrics = Vec::with_capacity(running.len());
        for (job_type, queue, concurrency, counters) in running {
            let depth = self.store.depth(&queue).await?;
            let active = self.store.active_count(&queue).await?;
            JobMetrics::update_queue_sizes(&queue, depth, active);
            metrics.push(QueueMetrics {
                queue,
                job_type,
                concurrency,
                depth,
                active,
                counters: counters.map(|c| c.snapshot()).unwrap_or_default(),
            });
        }
        Ok(metrics)
    }

    pub fn get_processor_metrics(&self) -> Vec<ProcessorMetricsSnapshot> {
        let mut snapshots: Vec<ProcessorMetricsSnapshot> = self
            .processors
            .read()
            .values()
            .map(|p| p.metrics().snapshot(p.job_type()))
            .collect();
        snapshots.sort_by_key(|s| s.job_type);
        snapshots
    }

    pub fn get_circuit_breaker_metrics(&self) -> Vec<CircuitBreakerSnapshot> {
        let snapshots = self.breakers.snapshots();
        for snapshot in &snapshots {
            JobMetrics::circuit_state(&snapshot.dependency_key, f64::from(snapshot.state.as_gauge()));
        }
        snapshots
    }

    pub async fn get_dead_letter_stats(&self) -> JobResult<DeadLetterStats> {
        let stats = self.dlq.stats().await?;
        JobMetrics::update_dead_letter_size(stats.total);
        Ok(stats)
    }

    pub async fn get_metrics_summary(&self) -> JobResult<MetricsSummary> {
        let queues = self.get_queue_metrics().await?;
        self.aggregator.summarize(self.get_processor_metrics(), queues).await
    }

    /// Prometheus text exposition of the current summary.
    pub async fn get_prometheus_metrics(&self) -> JobResult<String> {
        let queues = self.get_queue_metrics().await?;
        self.aggregator
            .render_prometheus(self.get_processor_metrics(), queues)
            .await
    }

    // =========================================================================
    // Dead letter administration
    // =========================================================================

    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> JobResult<Vec<DeadLetterEntry>> {
        self.dlq.list(filter).await
    }

    /// Moves a dead letter entry back onto its queue as a fresh job.
    ///
    /// The entry is restored if the enqueue fails.
    pub async fn requeue_dead_letter(&self, job_id: &JobId) -> JobResult<JobId> {
        if !self.is_accepting() {
            return Err(JobError::invalid_state("accepting", "shutting down"));
        }
        let entry = self
            .dlq
            .take(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let submitted = match entry.to_job() {
            Ok(job) => self.submit(job).await,
            Err(e) => Err(e),
        };
        match submitted {
            Ok(new_id) => {
                info!(job_id = %job_id, new_job_id = %new_id, queue = %entry.queue, "Requeued dead-lettered job");
                Ok(new_id)
            }
            Err(e) => {
                if let Err(restore_err) = self.dlq.restore(&entry).await {
                    error!(job_id = %job_id, error = %restore_err, "Failed to restore dead letter entry");
                }
                Err(e)
            }
        }
    }

    pub async fn purge_dead_letters(&self, older_than: Duration) -> JobResult<u64> {
        self.dlq.purge(older_than).await
    }

    /// Discards the breaker for `dependency_key`; the next use starts closed.
    pub fn reset_circuit_breaker(&self, dependency_key: &str) -> bool {
        self.breakers.reset(dependency_key)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{AnalyticsPeriod, ContentKind};
    use crate::store::InMemoryJobStore;
    use chrono::Utc;

    fn system(max_depth: u64) -> JobSystem {
        let mut config = AppConfig::default();
        config.queue.max_depth = max_depth;
        JobSystem::new(config, Arc::new(InMemoryJobStore::new()))
    }

    fn email(to: &str) -> EmailPayload {
        EmailPayload {
            to: to.into(),
            template: "welcome".into(),
            variables: BTreeMap::new(),
            subject: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_records_event() {
        let system = system(100);
        let id = system
            .add_email_job(email("ada@example.com"), EnqueueOptions::new())
            .await
            .unwrap();

        let events = system.events().entries_for(&id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Enqueued);
        assert_eq!(events[0].metadata.queue, "email");

        let job = system.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_invalid_payload_never_reaches_store() {
        let system = system(100);
        let err = system
            .add_email_job(email("not-an-address"), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert_eq!(system.store().depth("email").await.unwrap(), 0);
        assert!(system.events().entries().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let system = system(100);
        let err = system
            .add_email_job(email("ada@example.com"), EnqueueOptions::new().dependency("no colon"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_saturated_queue_rejects() {
        let system = system(2);
        for _ in 0..2 {
            system
                .add_email_job(email("ada@example.com"), EnqueueOptions::new())
                .await
                .unwrap();
        }
        let err = system
            .add_email_job(email("ada@example.com"), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::QueueSaturated { depth: 2, limit: 2, .. }));

        // Other queues are unaffected.
        let now = Utc::now();
        system
            .add_analytics_job(
                AnalyticsPayload {
                    metric: "signups".into(),
                    period: AnalyticsPeriod::Daily,
                    window_start: now - chrono::Duration::days(1),
                    window_end: now,
                    dimensions: BTreeMap::new(),
                },
                EnqueueOptions::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_moderation_schema_enforced() {
        let system = system(100);
        let err = system
            .add_moderation_job(
                ModerationPayload {
                    content_id: "post-1".into(),
                    content_kind: ContentKind::Post,
                    text: None,
                    media_urls: Vec::new(),
                },
                EnqueueOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let system = system(100);
        assert_eq!(system.initialize().await.unwrap(), 0);
        assert!(matches!(
            system.initialize().await,
            Err(JobError::InvalidState { .. })
        ));
        system.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_enqueue_rejected_after_shutdown() {
        let system = system(100);
        system.shutdown(Duration::from_millis(10)).await;
        let err = system
            .add_email_job(email("ada@example.com"), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_requeue_unknown_dead_letter() {
        let system = system(100);
        let err = system.requeue_dead_letter(&JobId::from("missing")).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_typed_enqueue_routes_to_own_queue() {
        let system = system(100);
        let push = system
            .add_push_notification_job(
                PushNotificationPayload {
                    tokens: vec![crate::payload::DeviceToken {
                        token: "device-1".into(),
                        platform: crate::payload::PushPlatform::Fcm,
                    }],
                    title: "Hello".into(),
                    body: "World".into(),
                    data: BTreeMap::new(),
                },
                EnqueueOptions::new(),
            )
            .await
            .unwrap();
        let media = system
            .add_media_job(
                MediaPayload {
                    media_id: "m-1".into(),
                    source_url: "https://cdn.example.com/a.mp4".into(),
                    operations: vec![crate::payload::MediaOperation::Thumbnail { width: 320, height: 180 }],
                },
                EnqueueOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(system.get_job(&push).await.unwrap().unwrap().queue, "push_notification");
        assert_eq!(system.get_job(&media).await.unwrap().unwrap().queue, "media");
        assert_eq!(system.store().depth("media").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_dead_letters() {
        let system = system(100);
        let id = system
            .add_email_job(email("ada@example.com"), EnqueueOptions::new())
            .await
            .unwrap();
        let job = system
            .store()
            .lease("email", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert!(system.dlq().capture(&job, "bounced", false).await.unwrap());

        assert_eq!(system.purge_dead_letters(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(system.purge_dead_letters(Duration::ZERO).await.unwrap(), 1);
        assert!(system
            .list_dead_letters(&DeadLetterFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_delay_rejected() {
        let system = system(100);
        let err = system
            .add_email_job(
                email("ada@example.com"),
                EnqueueOptions::new().delay(Duration::from_secs(31_536_000_000_000)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert_eq!(system.store().depth("email").await.unwrap(), 0);
        assert!(system.events().entries().is_empty());
    }

    #[tokio::test]
    async fn test_saturated_enqueue_records_no_event() {
        let system = system(1);
        system
            .add_email_job(email("ada@example.com"), EnqueueOptions::new())
            .await
            .unwrap();
        system
            .add_email_job(email("ada@example.com"), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert_eq!(system.events().entries().len(), 1);
    }

    #[test]
    fn test_reset_circuit_breaker() {
        let system = system(100);
        assert!(!system.reset_circuit_breaker("smtp:primary"));

        system.breakers().get("smtp:primary");
        assert!(system.reset_circuit_breaker("smtp:primary"));
        assert!(system.get_circuit_breaker_metrics().is_empty());
    }
}
