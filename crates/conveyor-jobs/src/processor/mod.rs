//! Processor contract.
//!
//! A processor handles one job type. It receives a job whose payload was
//! validated at enqueue time, declares the dependency keys the dispatcher
//! must gate on, and reports a classified outcome. Processors never retry
//! internally; the dispatcher owns retry and dead-letter decisions.

mod email;
mod push;

pub use email::{EmailMessage, EmailProcessor, EmailTemplate, EmailTransport, LoggingEmailTransport, TemplateCatalog};
pub use push::{LoggingPushGateway, PushGateway, PushMessage, PushProcessor};

use crate::error::ProcessError;
use crate::job::Job;
use crate::payload::JobType;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Handler for one job type.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Job type this processor handles.
    fn job_type(&self) -> JobType;

    /// Dependency keys gated before `process` runs for this job.
    fn dependency_keys(&self, job: &Job) -> Vec<String>;

    /// Processes one job. Must be idempotent on `job.id`.
    async fn process(&self, job: &Job) -> Result<(), ProcessError>;

    /// Counters owned by this processor.
    fn metrics(&self) -> &ProcessorMetrics;
}

/// Error returned by an external transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub message: String,
    /// Whether the same call may succeed later.
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

/// Per-processor counters, updated by the dispatcher after each invocation.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    succeeded: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
    timeouts: AtomicU64,
    total_latency_micros: AtomicU64,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub fn record_failure(&self, error: &ProcessError, latency: Duration) {
        if error.is_permanent() {
            self.permanent_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transient_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.add_latency(latency);
    }

    /// Timeouts also count as transient failures.
    pub fn record_timeout(&self, latency: Duration) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    fn add_latency(&self, latency: Duration) {
        self.total_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, job_type: JobType) -> ProcessorMetricsSnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let transient = self.transient_failures.load(Ordering::Relaxed);
        let permanent = self.permanent_failures.load(Ordering::Relaxed);
        let processed = succeeded + transient + permanent;
        let total_micros = self.total_latency_micros.load(Ordering::Relaxed);

        ProcessorMetricsSnapshot {
            job_type,
            processed,
            succeeded,
            failed: transient + permanent,
            transient_failures: transient,
            permanent_failures: permanent,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_latency_ms: if processed == 0 {
                0.0
            } else {
                total_micros as f64 / processed as f64 / 1000.0
            },
        }
    }
}

/// Point-in-time view of a processor's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorMetricsSnapshot {
    pub job_type: JobType,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = ProcessorMetrics::new();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_failure(&ProcessError::transient("reset"), Duration::from_millis(20));
        metrics.record_failure(&ProcessError::permanent("bad template"), Duration::from_millis(30));
        metrics.record_timeout(Duration::from_millis(40));

        let snapshot = metrics.snapshot(JobType::Email);
        assert_eq!(snapshot.processed, 4);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 3);
        assert_eq!(snapshot.transient_failures, 2);
        assert_eq!(snapshot.permanent_failures, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert!((snapshot.avg_latency_ms - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_metrics_have_zero_latency() {
        let snapshot = ProcessorMetrics::new().snapshot(JobType::Media);
        assert_eq!(snapshot.processed, 0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
    }
}
