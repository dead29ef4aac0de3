//! Application configuration structures.

use conveyor_core::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Job store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker loop tuning shared by every queue.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Per-processor enablement and concurrency.
    #[serde(default)]
    pub processors: ProcessorsConfig,

    /// Queue limits and the default retry policy.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Dead-lettering and circuit breaking.
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Event log and snapshotting.
    #[serde(default)]
    pub event_sourcing: EventSourcingConfig,

    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Environment (development, staging, production).
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_environment(),
        }
    }
}

fn default_app_name() -> String {
    "conveyor".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// Which job store implementation backs the queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store, lost on restart.
    #[default]
    Memory,
    /// Redis-backed durable store.
    Redis,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

/// Job store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis URL (redis backend only).
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long a lease stays exclusive before the job is handed out again.
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
            connect_timeout_secs: default_connect_timeout(),
            lease_timeout_secs: default_lease_timeout(),
        }
    }
}

impl StoreConfig {
    /// Returns the lease timeout as Duration.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Returns the connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "conveyor:jobs".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_lease_timeout() -> u64 {
    600
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Idle wait between empty lease attempts, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Per-job processing timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// How long shutdown waits for in-flight jobs, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            job_timeout_secs: default_job_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns job timeout as Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns shutdown grace as Duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_poll_interval() -> u64 {
    100
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_shutdown_grace() -> u64 {
    30
}

/// Settings for a single processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Whether the processor's queue is drained by this instance.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of worker loops for the queue.
    #[serde(default = "default_processor_concurrency")]
    pub concurrency: usize,

    /// Overrides `queue.retry.max_attempts` for this queue.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Overrides `worker.job_timeout_secs` for this queue.
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

impl ProcessorConfig {
    /// Creates a processor config.
    pub fn new(enabled: bool, concurrency: usize) -> Self {
        Self {
            enabled,
            concurrency,
            max_attempts: None,
            job_timeout_secs: None,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::new(true, default_processor_concurrency())
    }
}

fn default_true() -> bool {
    true
}

fn default_processor_concurrency() -> usize {
    1
}

/// Settings for every processor, keyed by job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorsConfig {
    #[serde(default = "default_email_processor")]
    pub email: ProcessorConfig,

    #[serde(default = "default_push_processor")]
    pub push_notification: ProcessorConfig,

    #[serde(default = "default_media_processor")]
    pub media: ProcessorConfig,

    #[serde(default = "default_moderation_processor")]
    pub moderation: ProcessorConfig,

    #[serde(default = "default_analytics_processor")]
    pub analytics: ProcessorConfig,
}

impl Default for ProcessorsConfig {
    fn default() -> Self {
        Self {
            email: default_email_processor(),
            push_notification: default_push_processor(),
            media: default_media_processor(),
            moderation: default_moderation_processor(),
            analytics: default_analytics_processor(),
        }
    }
}

impl ProcessorsConfig {
    /// Iterates `(name, config)` pairs in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ProcessorConfig)> {
        [
            ("email", &self.email),
            ("push_notification", &self.push_notification),
            ("media", &self.media),
            ("moderation", &self.moderation),
            ("analytics", &self.analytics),
        ]
        .into_iter()
    }
}

fn default_email_processor() -> ProcessorConfig {
    ProcessorConfig::new(true, 5)
}

fn default_push_processor() -> ProcessorConfig {
    ProcessorConfig::new(true, 10)
}

fn default_media_processor() -> ProcessorConfig {
    ProcessorConfig::new(false, 2)
}

fn default_moderation_processor() -> ProcessorConfig {
    ProcessorConfig::new(false, 3)
}

fn default_analytics_processor() -> ProcessorConfig {
    ProcessorConfig::new(false, 2)
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending depth at which enqueue is refused (0 = unlimited).
    #[serde(default = "default_max_depth")]
    pub max_depth: u64,

    /// Default retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_depth() -> u64 {
    10_000
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Number of retries before a job is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound of the random jitter added to each delay, in milliseconds.
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter_ms: default_jitter(),
        }
    }
}

fn default_base_delay() -> u64 {
    1000 // 1 second
}

fn default_max_delay() -> u64 {
    300_000 // 5 minutes
}

fn default_max_attempts() -> u32 {
    3
}

fn default_jitter() -> u64 {
    250
}

/// Reliability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default)]
    pub dead_letter_queue: DeadLetterQueueConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

/// Dead letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterQueueConfig {
    /// Capture permanently failed jobs for inspection and requeue.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DeadLetterQueueConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Circuit breaker configuration applied to every dependency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Gate processor calls through per-dependency breakers.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Failures within the window that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window length in seconds.
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Time an open breaker waits before allowing probes, in seconds.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Probe calls admitted while half-open.
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            window_secs: default_window(),
            cooldown_secs: default_cooldown(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Returns the window as Duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Returns the cooldown as Duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    30
}

fn default_half_open_probes() -> u32 {
    1
}

/// Event sourcing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourcingConfig {
    /// Record job lifecycle events.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Events between snapshots.
    #[serde(default = "default_snapshot_frequency")]
    pub snapshot_frequency: u64,

    /// Snapshots kept in memory; older ones are dropped.
    #[serde(default = "default_retained_snapshots")]
    pub retained_snapshots: usize,

    /// Drop log entries covered by a snapshot as soon as it is written.
    #[serde(default = "default_true")]
    pub archive_after_compaction: bool,
}

impl Default for EventSourcingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_frequency: default_snapshot_frequency(),
            retained_snapshots: default_retained_snapshots(),
            archive_after_compaction: true,
        }
    }
}

fn default_snapshot_frequency() -> u64 {
    1000
}

fn default_retained_snapshots() -> usize {
    8
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics` over HTTP.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter listen address.
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,

    /// Seconds between queue gauge refreshes.
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_addr(),
            report_interval_secs: default_report_interval(),
        }
    }
}

impl MetricsConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_report_interval() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.app.name, "conveyor");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.processors.email.enabled);
        assert!(!config.processors.media.enabled);
        assert_eq!(config.reliability.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.reliability.circuit_breaker.window(), Duration::from_secs(60));
        assert_eq!(config.reliability.circuit_breaker.cooldown(), Duration::from_secs(30));
        assert_eq!(config.event_sourcing.snapshot_frequency, 1000);
        assert_eq!(config.event_sourcing.retained_snapshots, 8);
        assert!(config.event_sourcing.archive_after_compaction);
    }

    #[test]
    fn test_processors_iter_order() {
        let names: Vec<&str> = ProcessorsConfig::default().iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["email", "push_notification", "media", "moderation", "analytics"]
        );
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"store": {"backend": "redis"}, "event_sourcing": {"snapshot_frequency": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "conveyor:jobs");
        assert!(config.event_sourcing.enabled);
        assert_eq!(config.event_sourcing.snapshot_frequency, 10);
    }
}
