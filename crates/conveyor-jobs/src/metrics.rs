//! Prometheus metrics for job queue monitoring.
//!
//! Recorded through the `metrics` facade; whichever recorder the binary
//! installs decides where they go.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job system.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "conveyor_jobs_enqueued_total";
    pub const JOBS_REJECTED_TOTAL: &str = "conveyor_jobs_rejected_total";
    pub const JOBS_STARTED_TOTAL: &str = "conveyor_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "conveyor_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "conveyor_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "conveyor_jobs_retried_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "conveyor_jobs_dead_lettered_total";
    pub const JOBS_TIMED_OUT_TOTAL: &str = "conveyor_jobs_timed_out_total";
    /// Jobs deferred because a dependency's circuit was open.
    pub const JOBS_CIRCUIT_REJECTED_TOTAL: &str = "conveyor_jobs_circuit_rejected_total";

    pub const JOBS_PENDING: &str = "conveyor_jobs_pending";
    pub const JOBS_ACTIVE: &str = "conveyor_jobs_active";
    pub const JOBS_DEAD_LETTER: &str = "conveyor_jobs_dead_letter";

    pub const JOB_DURATION_SECONDS: &str = "conveyor_job_duration_seconds";

    pub const WORKERS_CONCURRENCY: &str = "conveyor_workers_concurrency";

    /// 0 closed, 1 open, 2 half-open.
    pub const CIRCUIT_BREAKER_STATE: &str = "conveyor_circuit_breaker_state";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_REJECTED_TOTAL,
        "Total number of enqueue attempts rejected by validation or saturation"
    );
    describe_counter!(names::JOBS_STARTED_TOTAL, "Total number of job executions started");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs failed terminally without dead-lettering"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries scheduled");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs sent to the dead letter queue"
    );
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of jobs that timed out");
    describe_counter!(
        names::JOBS_CIRCUIT_REJECTED_TOTAL,
        "Total number of jobs deferred by an open circuit breaker"
    );

    describe_gauge!(names::JOBS_PENDING, "Current number of pending jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of leased jobs");
    describe_gauge!(names::JOBS_DEAD_LETTER, "Current size of the dead letter queue");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");

    describe_gauge!(names::WORKERS_CONCURRENCY, "Worker loops per queue");
    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state per dependency (0 closed, 1 open, 2 half-open)"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn job_enqueued(queue: &str, job_type: &str, priority: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Record an enqueue refused before reaching the store.
    pub fn job_rejected(job_type: &str, reason: &str) {
        counter!(
            names::JOBS_REJECTED_TOTAL,
            "job_type" => job_type.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn job_started(queue: &str, job_type: &str) {
        counter!(
            names::JOBS_STARTED_TOTAL,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn job_completed(queue: &str, job_type: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_failed(queue: &str, job_type: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn job_retried(queue: &str, job_type: &str) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn job_dead_lettered(queue: &str, job_type: &str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn job_timed_out(queue: &str, job_type: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn job_circuit_rejected(queue: &str, dependency: &str) {
        counter!(
            names::JOBS_CIRCUIT_REJECTED_TOTAL,
            "queue" => queue.to_string(),
            "dependency" => dependency.to_string()
        )
        .increment(1);
    }

    pub fn workers_concurrency(queue: &str, concurrency: usize) {
        gauge!(names::WORKERS_CONCURRENCY, "queue" => queue.to_string()).set(concurrency as f64);
    }

    /// Update queue size gauges.
    pub fn update_queue_sizes(queue: &str, pending: u64, active: u64) {
        gauge!(names::JOBS_PENDING, "queue" => queue.to_string()).set(pending as f64);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).set(active as f64);
    }

    pub fn update_dead_letter_size(total: u64) {
        gauge!(names::JOBS_DEAD_LETTER).set(total as f64);
    }

    pub fn circuit_state(dependency: &str, state: f64) {
        gauge!(names::CIRCUIT_BREAKER_STATE, "dependency" => dependency.to_string()).set(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // No recorder installed; calls must still be no-ops.
        register_metrics();
    }

    #[test]
    fn test_job_metrics() {
        JobMetrics::job_enqueued("email", "email", "normal");
        JobMetrics::job_started("email", "email");
        JobMetrics::job_completed("email", "email", Duration::from_millis(40));
        JobMetrics::job_circuit_rejected("email", "smtp:primary");
        JobMetrics::update_queue_sizes("email", 3, 1);
    }
}
