//! Configuration validation module.
//!
//! Fails fast on invalid configuration rather than at runtime.

use crate::{AppConfig, StoreBackend};
use std::fmt;
use std::net::SocketAddr;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Enabled processor has no workers.
    ZeroConcurrency { processor: String },
    /// Snapshot frequency must be at least 1 when event sourcing is on.
    ZeroSnapshotFrequency,
    /// At least the latest snapshot must be kept.
    ZeroRetainedSnapshots,
    /// Breaker would open before any failure.
    ZeroFailureThreshold,
    /// Half-open breaker would never admit a probe.
    ZeroHalfOpenProbes,
    /// Retry backoff ceiling below its base.
    InvalidBackoff { base_delay_ms: u64, max_delay_ms: u64 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Timeout value must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// Pool size must be positive.
    ZeroPoolSize,
    /// Socket address does not parse.
    InvalidAddress { name: String, value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroConcurrency { processor } => {
                write!(f, "Processor '{}' is enabled with concurrency 0", processor)
            }
            Self::ZeroSnapshotFrequency => {
                write!(f, "event_sourcing.snapshot_frequency must be at least 1")
            }
            Self::ZeroRetainedSnapshots => {
                write!(f, "event_sourcing.retained_snapshots must be at least 1")
            }
            Self::ZeroFailureThreshold => {
                write!(f, "reliability.circuit_breaker.failure_threshold must be at least 1")
            }
            Self::ZeroHalfOpenProbes => {
                write!(f, "reliability.circuit_breaker.half_open_probes must be at least 1")
            }
            Self::InvalidBackoff {
                base_delay_ms,
                max_delay_ms,
            } => write!(
                f,
                "Invalid retry backoff: base delay {}ms exceeds max delay {}ms",
                base_delay_ms, max_delay_ms
            ),
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::ZeroPoolSize => write!(f, "store.pool_size must be at least 1"),
            Self::InvalidAddress { name, value } => {
                write!(f, "'{}' is not a valid socket address: {}", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_store(config, &mut errors);
        Self::validate_processors(config, &mut errors);
        Self::validate_reliability(config, &mut errors);

        if config.queue.retry.base_delay_ms > config.queue.retry.max_delay_ms {
            errors.push(ConfigValidationError::InvalidBackoff {
                base_delay_ms: config.queue.retry.base_delay_ms,
                max_delay_ms: config.queue.retry.max_delay_ms,
            });
        }

        if config.event_sourcing.enabled && config.event_sourcing.snapshot_frequency == 0 {
            errors.push(ConfigValidationError::ZeroSnapshotFrequency);
        }

        if config.event_sourcing.enabled && config.event_sourcing.retained_snapshots == 0 {
            errors.push(ConfigValidationError::ZeroRetainedSnapshots);
        }

        if config.metrics.enabled && config.metrics.listen_addr.parse::<SocketAddr>().is_err() {
            errors.push(ConfigValidationError::InvalidAddress {
                name: "metrics.listen_addr".to_string(),
                value: config.metrics.listen_addr.clone(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_store(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.store.lease_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "store.lease_timeout_secs".to_string(),
                value: 0,
            });
        }

        if config.store.backend != StoreBackend::Redis {
            return;
        }

        if config.store.pool_size == 0 {
            errors.push(ConfigValidationError::ZeroPoolSize);
        }

        match Url::parse(&config.store.redis_url) {
            Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
            Ok(_) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: "URL must start with redis:// or rediss://".to_string(),
            }),
            Err(e) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn validate_processors(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        for (name, processor) in config.processors.iter() {
            if processor.enabled && processor.concurrency == 0 {
                errors.push(ConfigValidationError::ZeroConcurrency {
                    processor: name.to_string(),
                });
            }
            if processor.job_timeout_secs == Some(0) {
                errors.push(ConfigValidationError::NonPositiveTimeout {
                    name: format!("processors.{}.job_timeout_secs", name),
                    value: 0,
                });
            }
        }

        if config.worker.job_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "worker.job_timeout_secs".to_string(),
                value: 0,
            });
        }
    }

    fn validate_reliability(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let breaker = &config.reliability.circuit_breaker;
        if !breaker.enabled {
            return;
        }
        if breaker.failure_threshold == 0 {
            errors.push(ConfigValidationError::ZeroFailureThreshold);
        }
        if breaker.half_open_probes == 0 {
            errors.push(ConfigValidationError::ZeroHalfOpenProbes);
        }
        if breaker.window_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "reliability.circuit_breaker.window_secs".to_string(),
                value: 0,
            });
        }
    }
}
