//! Queue dispatcher and worker loops.

use crate::dlq::DeadLetterQueue;
use crate::error::ProcessError;
use crate::events::{EventLog, EventMetadata, EventType};
use crate::job::{Job, JobStatus};
use crate::metrics::JobMetrics;
use crate::processor::Processor;
use crate::queue::QueueDefinition;
use crate::store::JobStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conveyor_resilience::{run_with_timeout, CircuitBreakerRegistry, Rejection};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Collaborators shared by every worker loop.
#[derive(Clone)]
pub struct DispatchContext {
    pub store: Arc<dyn JobStore>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    pub events: Arc<EventLog>,
    /// Idle wait between empty lease attempts.
    pub poll_interval: Duration,
    /// Lease margin on top of the job timeout.
    pub lease_margin: Duration,
}

/// Counters of one queue, updated by its workers.
#[derive(Debug)]
pub struct QueueCounters {
    leased: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    failed: AtomicU64,
    circuit_rejected: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    started_at: Instant,
}

impl Default for QueueCounters {
    fn default() -> Self {
        Self {
            leased: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            circuit_rejected: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            peak_in_flight: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

impl QueueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) -> InFlight<'_> {
        self.leased.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    pub fn snapshot(&self) -> QueueCountersSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let uptime = self.started_at.elapsed().as_secs_f64();
        QueueCountersSnapshot {
            leased: self.leased.load(Ordering::Relaxed),
            completed,
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            throughput_per_sec: if uptime > 0.0 { completed as f64 / uptime } else { 0.0 },
        }
    }
}

/// Decrements the in-flight gauge when a job's handling ends.
struct InFlight<'a>(&'a QueueCounters);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time view of a queue's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueCountersSnapshot {
    pub leased: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub failed: u64,
    pub circuit_rejected: u64,
    pub in_flight: u64,
    /// Highest number of simultaneously handled jobs seen.
    pub peak_in_flight: u64,
    pub throughput_per_sec: f64,
}

/// Outcome of [`Dispatcher::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub workers: usize,
    /// Workers cancelled because they outlived the grace period.
    pub aborted: usize,
}

/// Runs `concurrency` independent worker loops for one queue.
pub struct Dispatcher {
    definition: QueueDefinition,
    counters: Arc<QueueCounters>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Launches the worker loops of `definition`, each handling one job at a time.
    pub fn start(
        definition: QueueDefinition,
        processor: Arc<dyn Processor>,
        context: DispatchContext,
        counters: Arc<QueueCounters>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(WorkerShared {
            definition: definition.clone(),
            processor,
            context,
            counters: Arc::clone(&counters),
        });

        info!(
            queue = %definition.name,
            concurrency = definition.concurrency,
            max_attempts = definition.retry_policy.max_attempts,
            "Starting dispatcher"
        );
        JobMetrics::workers_concurrency(&definition.name, definition.concurrency);

        let handles = (0..definition.concurrency)
            .map(|n| {
                let worker_id = format!("{}-{}-{}", definition.name, n, &Uuid::new_v4().simple().to_string()[..8]);
                let span = info_span!("worker", queue = %definition.name, worker_id = %worker_id);
                let worker = Worker {
                    id: worker_id,
                    shared: Arc::clone(&shared),
                };
                tokio::spawn(worker.run(shutdown_tx.subscribe()).instrument(span))
            })
            .collect();

        Self {
            definition,
            counters,
            shutdown_tx,
            handles,
        }
    }

    pub fn queue(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn counters(&self) -> Arc<QueueCounters> {
        Arc::clone(&self.counters)
    }

    /// Stops leasing, waits up to `grace` for in-flight jobs, then cancels the rest.
    ///
    /// A cancelled job keeps its lease until it expires and is then retried.
    pub async fn stop(mut self, grace: Duration) -> StopReport {
        info!(queue = %self.definition.name, grace_secs = grace.as_secs_f64(), "Stopping dispatcher...");
        let _ = self.shutdown_tx.send(());

        let workers = self.handles.len();
        let drained = tokio::time::timeout(grace, join_all(self.handles.iter_mut())).await;

        let mut aborted = 0;
        if drained.is_err() {
            for handle in &self.handles {
                if !handle.is_finished() {
                    handle.abort();
                    aborted += 1;
                }
            }
            warn!(queue = %self.definition.name, aborted, "Grace period elapsed, cancelled in-flight jobs");
        }

        let counters = self.counters.snapshot();
        info!(
            queue = %self.definition.name,
            completed = counters.completed,
            dead_lettered = counters.dead_lettered,
            "Dispatcher stopped"
        );

        StopReport { workers, aborted }
    }
}

struct WorkerShared {
    definition: QueueDefinition,
    processor: Arc<dyn Processor>,
    context: DispatchContext,
    counters: Arc<QueueCounters>,
}

struct Worker {
    id: String,
    shared: Arc<WorkerShared>,
}

impl Worker {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let shared = &self.shared;
        let queue = shared.definition.name.as_str();
        let lease_for = shared.definition.job_timeout + shared.context.lease_margin;
        debug!("Worker started");

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            match shared.context.store.lease(queue, &self.id, lease_for).await {
                Ok(Some(job)) => self.handle(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(shared.context.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to lease job");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(shared.context.poll_interval) => {}
                    }
                }
            }
        }

        debug!("Worker stopped");
    }

    async fn handle(&self, job: Job) {
        let shared = &self.shared;
        let _in_flight = shared.counters.begin();
        let queue = shared.definition.name.as_str();

        JobMetrics::job_started(queue, job.job_type.as_str());
        shared
            .context
            .events
            .append(&job.id, EventType::Started, EventMetadata::new(queue, job.attempts));

        let keys = self.gate_keys(&job);
        let pass = match shared.context.breakers.acquire(&keys) {
            Ok(pass) => pass,
            Err(rejection) => {
                self.defer(job, rejection).await;
                return;
            }
        };

        debug!(job_id = %job.id, attempt = job.attempts, "Processing job");
        let started = Instant::now();
        let outcome = run_with_timeout(shared.definition.job_timeout, shared.processor.process(&job)).await;
        let elapsed = started.elapsed();

        let metrics = shared.processor.metrics();
        let result = match outcome {
            Ok(Ok(())) => {
                metrics.record_success(elapsed);
                Ok(())
            }
            Ok(Err(e)) => {
                metrics.record_failure(&e, elapsed);
                Err(e)
            }
            Err(elapsed_err) => {
                metrics.record_timeout(elapsed);
                JobMetrics::job_timed_out(queue, job.job_type.as_str());
                Err(ProcessError::transient(elapsed_err.to_string()))
            }
        };

        match result {
            Ok(()) => {
                shared.context.breakers.record_success(&keys);
                self.complete(&job, elapsed).await;
            }
            Err(error) if error.is_permanent() => {
                self.terminate(job, &error.to_string(), false).await;
            }
            Err(error) => {
                match &error.dependency {
                    Some(dependency) => shared.context.breakers.record_failure(&[dependency]),
                    None => shared.context.breakers.record_failure(&keys),
                }
                self.retry_or_terminate(job, &error).await;
            }
        }

        shared.context.breakers.release(pass);
    }

    /// Processor-declared keys plus per-job extras, deduplicated.
    fn gate_keys(&self, job: &Job) -> Vec<String> {
        let mut keys = self.shared.processor.dependency_keys(job);
        for key in &job.dependency_keys {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Reschedules a job refused by an open circuit. Attempts are untouched.
    async fn defer(&self, mut job: Job, rejection: Rejection) {
        let shared = &self.shared;
        let queue = shared.definition.name.as_str();

        job.status = JobStatus::Queued;
        job.available_at = available_after(rejection.retry_after);
        job.last_error = Some(rejection.to_string());

        let log_retry = |job: &Job| {
            shared.context.events.append(
                &job.id,
                EventType::Retried,
                EventMetadata::new(queue, job.attempts).with_reason("circuit-open"),
            );
        };
        if let Err(e) = shared.context.store.reschedule(&job, &log_retry).await {
            error!(job_id = %job.id, error = %e, "Failed to reschedule circuit-rejected job");
            return;
        }

        shared.counters.circuit_rejected.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_circuit_rejected(queue, &rejection.dependency_key);

        debug!(
            job_id = %job.id,
            dependency = %rejection.dependency_key,
            retry_after_ms = rejection.retry_after.as_millis() as u64,
            "Circuit open, job deferred"
        );
    }

    async fn complete(&self, job: &Job, elapsed: Duration) {
        let shared = &self.shared;
        let queue = shared.definition.name.as_str();

        if let Err(e) = shared.context.store.ack(job).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job as complete");
            return;
        }

        shared
            .context
            .events
            .append(&job.id, EventType::Completed, EventMetadata::new(queue, job.attempts));
        shared.counters.completed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_completed(queue, job.job_type.as_str(), elapsed);

        debug!(job_id = %job.id, duration_ms = elapsed.as_millis() as u64, "Job completed successfully");
    }

    async fn retry_or_terminate(&self, mut job: Job, error: &ProcessError) {
        if !job.can_retry() {
            self.terminate(job, &error.to_string(), true).await;
            return;
        }

        let shared = &self.shared;
        let queue = shared.definition.name.as_str();

        job.attempts += 1;
        let delay = shared.definition.retry_policy.delay_for_attempt(job.attempts);
        job.available_at = available_after(delay);
        job.last_error = Some(error.to_string());
        job.status = JobStatus::Queued;

        let log_retry = |job: &Job| {
            shared.context.events.append(
                &job.id,
                EventType::Retried,
                EventMetadata::new(queue, job.attempts).with_reason(error.message.clone()),
            );
        };
        if let Err(e) = shared.context.store.reschedule(&job, &log_retry).await {
            error!(job_id = %job.id, error = %e, "Failed to reschedule job");
            return;
        }
        shared.counters.retried.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_retried(queue, job.job_type.as_str());

        warn!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Job failed, retry scheduled"
        );
    }

    /// Dead-letters the job, or marks it failed when dead-lettering is off.
    async fn terminate(&self, mut job: Job, reason: &str, retryable: bool) {
        let shared = &self.shared;
        let queue = shared.definition.name.as_str();
        job.last_error = Some(reason.to_string());

        if shared.context.dlq.is_enabled() {
            match shared.context.dlq.capture(&job, reason, retryable).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, "Job already dead-lettered");
                    return;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to record dead-lettered job");
                    return;
                }
            }
            shared.context.events.append(
                &job.id,
                EventType::DeadLettered,
                EventMetadata::new(queue, job.attempts).with_reason(reason),
            );
            shared.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            JobMetrics::job_dead_lettered(queue, job.job_type.as_str());
        } else {
            if let Err(e) = shared.context.store.mark_failed(&job).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                return;
            }
            shared.context.events.append(
                &job.id,
                EventType::Failed,
                EventMetadata::new(queue, job.attempts).with_reason(reason),
            );
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::job_failed(queue, job.job_type.as_str());
            warn!(job_id = %job.id, reason = %reason, "Job failed terminally, dead letter queue disabled");
        }
    }
}

/// Wall-clock time `delay` from now, saturating at the latest representable instant.
fn available_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
