//! Unified metrics summary and Prometheus exposition.
//!
//! Works from the state objects handed to it. Rendering feeds a private
//! recorder per call, so the global recorder is never touched. Never mutates
//! job or breaker state.

use crate::dispatcher::QueueCountersSnapshot;
use crate::dlq::{DeadLetterQueue, DeadLetterStats};
use crate::error::JobResult;
use crate::payload::JobType;
use crate::processor::ProcessorMetricsSnapshot;
use conveyor_resilience::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::sync::Arc;

/// Per-queue view combining store depth with dispatcher counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub queue: String,
    pub job_type: JobType,
    pub concurrency: usize,
    /// Jobs waiting in the store, ready or delayed.
    pub depth: u64,
    /// Jobs currently leased.
    pub active: u64,
    #[serde(flatten)]
    pub counters: QueueCountersSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub processors: Vec<ProcessorMetricsSnapshot>,
    pub queues: Vec<QueueMetrics>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub dead_letter: DeadLetterStats,
}

pub struct MetricsAggregator {
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<DeadLetterQueue>,
}

impl MetricsAggregator {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, dlq: Arc<DeadLetterQueue>) -> Self {
        Self { breakers, dlq }
    }

    pub async fn summarize(
        &self,
        processors: Vec<ProcessorMetricsSnapshot>,
        mut queues: Vec<QueueMetrics>,
    ) -> JobResult<MetricsSummary> {
        queues.sort_by(|a, b| a.queue.cmp(&b.queue));
        Ok(MetricsSummary {
            processors,
            queues,
            circuit_breakers: self.breakers.snapshots(),
            dead_letter: self.dlq.stats().await?,
        })
    }

    pub async fn render_prometheus(
        &self,
        processors: Vec<ProcessorMetricsSnapshot>,
        queues: Vec<QueueMetrics>,
    ) -> JobResult<String> {
        Ok(render(&self.summarize(processors, queues).await?))
    }
}

/// Renders a summary in the Prometheus text exposition format.
pub fn render(summary: &MetricsSummary) -> String {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        describe_counter!("conveyor_processor_processed_total", "Jobs handled by the processor");
        describe_counter!("conveyor_processor_succeeded_total", "Jobs the processor completed");
        describe_counter!("conveyor_processor_failed_total", "Jobs the processor failed");
        describe_counter!("conveyor_processor_timeouts_total", "Processor calls that hit the job timeout");
        describe_gauge!("conveyor_processor_avg_latency_ms", "Mean processing latency in milliseconds");
        for p in &summary.processors {
            let job_type = p.job_type.as_str();
            counter!("conveyor_processor_processed_total", "job_type" => job_type).absolute(p.processed);
            counter!("conveyor_processor_succeeded_total", "job_type" => job_type).absolute(p.succeeded);
            counter!("conveyor_processor_failed_total", "job_type" => job_type).absolute(p.failed);
            counter!("conveyor_processor_timeouts_total", "job_type" => job_type).absolute(p.timeouts);
            gauge!("conveyor_processor_avg_latency_ms", "job_type" => job_type).set(p.avg_latency_ms);
        }

        describe_gauge!("conveyor_queue_depth", "Jobs waiting in the queue");
        describe_gauge!("conveyor_queue_active", "Jobs currently leased");
        describe_counter!("conveyor_queue_completed_total", "Jobs completed");
        describe_counter!("conveyor_queue_retried_total", "Retries scheduled");
        describe_counter!("conveyor_queue_dead_lettered_total", "Jobs dead-lettered");
        describe_counter!("conveyor_queue_failed_total", "Jobs failed without dead-lettering");
        describe_counter!("conveyor_queue_circuit_rejected_total", "Jobs deferred by an open circuit");
        describe_gauge!("conveyor_queue_throughput_per_second", "Completed jobs per second since start");
        for q in &summary.queues {
            let labels = [("queue", q.queue.clone())];
            gauge!("conveyor_queue_depth", &labels).set(q.depth as f64);
            gauge!("conveyor_queue_active", &labels).set(q.active as f64);
            counter!("conveyor_queue_completed_total", &labels).absolute(q.counters.completed);
            counter!("conveyor_queue_retried_total", &labels).absolute(q.counters.retried);
            counter!("conveyor_queue_dead_lettered_total", &labels).absolute(q.counters.dead_lettered);
            counter!("conveyor_queue_failed_total", &labels).absolute(q.counters.failed);
            counter!("conveyor_queue_circuit_rejected_total", &labels).absolute(q.counters.circuit_rejected);
            gauge!("conveyor_queue_throughput_per_second", &labels).set(q.counters.throughput_per_sec);
        }

        describe_gauge!(
            "conveyor_circuit_breaker_state",
            "Circuit breaker state (0 closed, 1 open, 2 half-open)"
        );
        describe_counter!("conveyor_circuit_breaker_trips_total", "Times the breaker opened");
        for b in &summary.circuit_breakers {
            let labels = [("dependency", b.dependency_key.clone())];
            gauge!("conveyor_circuit_breaker_state", &labels).set(f64::from(b.state.as_gauge()));
            counter!("conveyor_circuit_breaker_trips_total", &labels).absolute(b.trip_count);
        }

        describe_gauge!("conveyor_dead_letter_total", "Entries in the dead letter queue");
        describe_gauge!(
            "conveyor_dead_letter_retryable",
            "Dead letter entries whose last failure was transient"
        );
        gauge!("conveyor_dead_letter_total").set(summary.dead_letter.total as f64);
        gauge!("conveyor_dead_letter_retryable").set(summary.dead_letter.retryable as f64);
    });

    handle.render()
}
