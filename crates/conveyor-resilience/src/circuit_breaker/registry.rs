//! Registry of circuit breakers keyed by dependency.

use super::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, Rejection};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Admissions granted for one job attempt across all of its dependency keys.
#[derive(Debug, Default)]
pub struct GatePass {
    admissions: Vec<(String, Admission)>,
}

impl GatePass {
    /// Keys this pass was granted for.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.admissions.iter().map(|(key, _)| key.as_str())
    }

    /// True when at least one key was admitted as a half-open probe.
    pub fn has_probe(&self) -> bool {
        self.admissions.iter().any(|(_, a)| *a == Admission::Probe)
    }
}

/// Lazily creates one breaker per dependency key, all sharing one configuration.
pub struct CircuitBreakerRegistry {
    enabled: bool,
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            enabled: true,
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// A registry that admits everything and tracks nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: CircuitBreakerConfig::default(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the breaker for `key`, creating it closed on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    /// Asks every breaker in `keys` to admit one call.
    ///
    /// All keys must admit; if any rejects, probes already taken from
    /// earlier keys are handed back.
    pub fn acquire<S: AsRef<str>>(&self, keys: &[S]) -> Result<GatePass, Rejection> {
        let mut pass = GatePass::default();
        if !self.enabled {
            return Ok(pass);
        }

        for key in keys {
            let key = key.as_ref();
            match self.get(key).try_acquire() {
                Ok(admission) => pass.admissions.push((key.to_string(), admission)),
                Err(rejection) => {
                    self.release(pass);
                    return Err(rejection);
                }
            }
        }

        Ok(pass)
    }

    /// Hands back any probe slots in `pass` without recording an outcome.
    pub fn release(&self, pass: GatePass) {
        for (key, admission) in pass.admissions {
            self.get(&key).release(admission);
        }
    }

    pub fn record_success<S: AsRef<str>>(&self, keys: &[S]) {
        if !self.enabled {
            return;
        }
        for key in keys {
            self.get(key.as_ref()).record_success();
        }
    }

    pub fn record_failure<S: AsRef<str>>(&self, keys: &[S]) {
        if !self.enabled {
            return;
        }
        for key in keys {
            self.get(key.as_ref()).record_failure();
        }
    }

    /// Snapshots of every known breaker, sorted by key.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.dependency_key.cmp(&b.dependency_key));
        snapshots
    }

    /// Discards the breaker for `key`; the next call re-creates it closed.
    ///
    /// Returns false when no breaker existed for the key.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.breakers.write().remove(key).is_some();
        if removed {
            info!(dependency = %key, "Circuit breaker reset");
        }
        removed
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;
    use std::time::Duration;

    fn registry(threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(30),
            half_open_probes: 1,
        })
    }

    #[test]
    fn test_breakers_created_lazily_and_shared() {
        let registry = registry(5);
        assert!(registry.snapshots().is_empty());
        let a = registry.get("push:fcm");
        let b = registry.get("push:fcm");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshots().len(), 1);
    }

    #[test]
    fn test_open_key_rejects_whole_acquire() {
        let registry = registry(1);
        registry.record_failure(&["push:apns"]);

        let err = registry.acquire(&["push:fcm", "push:apns"]).unwrap_err();
        assert_eq!(err.dependency_key, "push:apns");
        assert_eq!(registry.get("push:fcm").state(), CircuitState::Closed);
    }

    #[test]
    fn test_rejected_acquire_returns_earlier_probes() {
        let registry = registry(1);
        registry.record_failure(&["a:1"]);
        std::thread::sleep(Duration::from_millis(40));
        registry.record_failure(&["b:1"]);

        // a:1 grants its probe, b:1 is still cooling down.
        assert!(registry.acquire(&["a:1", "b:1"]).is_err());
        let pass = registry.acquire(&["a:1"]).unwrap();
        assert!(pass.has_probe());
    }

    #[test]
    fn test_snapshots_sorted() {
        let registry = registry(5);
        registry.record_success(&["smtp:primary", "push:fcm", "push:apns"]);
        let keys: Vec<_> = registry
            .snapshots()
            .into_iter()
            .map(|s| s.dependency_key)
            .collect();
        assert_eq!(keys, vec!["push:apns", "push:fcm", "smtp:primary"]);
    }

    #[test]
    fn test_reset_recreates_closed() {
        let registry = registry(1);
        registry.record_failure(&["smtp:primary"]);
        assert_eq!(registry.get("smtp:primary").state(), CircuitState::Open);

        assert!(registry.reset("smtp:primary"));
        assert!(!registry.reset("smtp:primary"));
        assert_eq!(registry.get("smtp:primary").state(), CircuitState::Closed);
    }

    #[test]
    fn test_disabled_registry_admits_everything() {
        let registry = CircuitBreakerRegistry::disabled();
        registry.record_failure(&["smtp:primary"]);
        registry.record_failure(&["smtp:primary"]);
        assert!(registry.acquire(&["smtp:primary"]).is_ok());
        assert!(registry.snapshots().is_empty());
    }
}
