//! Circuit breaker implementation.
//!
//! One breaker guards one dependency key (`smtp:primary`, `push:fcm`, ...).
//! Failures are counted in a sliding window while closed; crossing the
//! threshold opens the breaker, which rejects calls until the cooldown
//! elapses and a limited number of probes decide whether to close again.

mod registry;

pub use registry::{CircuitBreakerRegistry, GatePass};

use conveyor_core::ConveyorError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed - requests are allowed.
    Closed = 0,
    /// Circuit is open - requests are rejected.
    Open = 1,
    /// Circuit is half-open - limited probe requests are allowed.
    HalfOpen = 2,
}

impl CircuitState {
    /// Returns true when `self -> next` is one of the four legal transitions.
    pub const fn can_transition_to(self, next: CircuitState) -> bool {
        matches!(
            (self, next),
            (Self::Closed, Self::Open)
                | (Self::Open, Self::HalfOpen)
                | (Self::HalfOpen, Self::Closed)
                | (Self::HalfOpen, Self::Open)
        )
    }

    /// Numeric value used in the text exposition.
    pub const fn as_gauge(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the circuit.
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted.
    pub window: Duration,
    /// Time an open circuit waits before admitting probes.
    pub cooldown: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

/// How a call was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call through a closed circuit.
    Allowed,
    /// Probe call through a half-open circuit.
    Probe,
}

/// A call refused by an open (or probe-exhausted half-open) circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Dependency key of the refusing breaker.
    pub dependency_key: String,
    /// Time until the breaker may admit calls again.
    pub retry_after: Duration,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "circuit open for '{}', retry after {:?}",
            self.dependency_key, self.retry_after
        )
    }
}

/// Point-in-time view of a breaker, for metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub dependency_key: String,
    pub state: CircuitState,
    /// Failures inside the current window.
    pub failure_count: u64,
    /// Successes since the circuit last closed.
    pub success_count: u64,
    /// Seconds since the oldest failure in the window.
    pub window_age_secs: Option<f64>,
    /// Seconds since the circuit opened.
    pub open_for_secs: Option<f64>,
    pub half_open_probes_remaining: u32,
    /// Times the circuit has moved to Open.
    pub trip_count: u64,
    /// Calls short-circuited.
    pub rejected_count: u64,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u64,
    opened_at: Option<Instant>,
    half_open_probes_remaining: u32,
}

/// Circuit breaker for protecting against cascading failures.
///
/// The mutex only guards state transitions; it is never held while the
/// protected call runs.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    state: AtomicU8,
    trip_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker in the closed state.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                success_count: 0,
                opened_at: None,
                half_open_probes_remaining: 0,
            }),
            state: AtomicU8::new(CircuitState::Closed as u8),
            trip_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// Creates a new circuit breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Returns the last published state without locking.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Returns the dependency key this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of Closed/HalfOpen -> Open transitions.
    pub fn trip_count(&self) -> u64 {
        self.trip_count.load(Ordering::Relaxed)
    }

    /// Executes a function with circuit breaker protection.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(CircuitBreakerError::Open)?;

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Failure(e))
            }
        }
    }

    /// Asks the breaker to admit one call.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open here,
    /// and the call becomes one of its probes.
    pub fn try_acquire(&self) -> Result<Admission, Rejection> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map_or(self.config.cooldown, |t| t.elapsed());
            if elapsed < self.config.cooldown {
                drop(inner);
                return Err(self.reject(self.config.cooldown - elapsed));
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
            inner.half_open_probes_remaining = self.config.half_open_probes;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(Admission::Allowed),
            CircuitState::HalfOpen if inner.half_open_probes_remaining > 0 => {
                inner.half_open_probes_remaining -= 1;
                debug!(dependency = %self.name, remaining = inner.half_open_probes_remaining, "Admitting half-open probe");
                Ok(Admission::Probe)
            }
            _ => {
                drop(inner);
                // Probes are in flight; check back after a fraction of the cooldown.
                Err(self.reject(self.config.cooldown / 4))
            }
        }
    }

    /// Returns an unused probe slot, for callers that were admitted but never made the call.
    pub fn release(&self, admission: Admission) {
        if admission != Admission::Probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen
            && inner.half_open_probes_remaining < self.config.half_open_probes
        {
            inner.half_open_probes_remaining += 1;
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let state = inner.state;

        match state {
            CircuitState::Closed => {
                inner.success_count += 1;
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Closed);
                inner.failures.clear();
                inner.success_count = 0;
                inner.opened_at = None;
                inner.half_open_probes_remaining = 0;
                debug!(dependency = %self.name, "Circuit breaker closed after successful probe");
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened; it cannot close an open circuit.
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let state = inner.state;

        match state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune_window(&mut inner, now);

                let failures = inner.failures.len() as u64;
                if failures >= u64::from(self.config.failure_threshold) {
                    self.open(&mut inner, now);
                    warn!(
                        dependency = %self.name,
                        failures,
                        window_secs = self.config.window.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut inner, now);
                warn!(dependency = %self.name, "Circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Returns a point-in-time snapshot.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.state == CircuitState::Closed {
            self.prune_window(&mut inner, now);
        }

        CircuitBreakerSnapshot {
            dependency_key: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u64,
            success_count: inner.success_count,
            window_age_secs: inner
                .failures
                .front()
                .map(|t| now.duration_since(*t).as_secs_f64()),
            open_for_secs: inner.opened_at.map(|t| now.duration_since(t).as_secs_f64()),
            half_open_probes_remaining: inner.half_open_probes_remaining,
            trip_count: self.trip_count(),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        self.transition(inner, CircuitState::Open);
        inner.opened_at = Some(now);
        inner.half_open_probes_remaining = 0;
        self.trip_count.fetch_add(1, Ordering::Relaxed);
    }

    fn prune_window(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        debug_assert!(
            inner.state.can_transition_to(next),
            "illegal circuit transition {} -> {}",
            inner.state,
            next
        );
        inner.state = next;
        self.state.store(next as u8, Ordering::SeqCst);
    }

    fn reject(&self, retry_after: Duration) -> Rejection {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
        Rejection {
            dependency_key: self.name.clone(),
            retry_after,
        }
    }
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request was rejected.
    Open(Rejection),
    /// The underlying operation failed.
    Failure(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(rejection) => write!(f, "Circuit breaker '{}' is open", rejection.dependency_key),
            Self::Failure(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(_) => None,
            Self::Failure(e) => Some(e),
        }
    }
}

impl<E> From<CircuitBreakerError<E>> for ConveyorError
where
    E: std::fmt::Display,
{
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open(rejection) => ConveyorError::CircuitBreakerOpen(rejection.dependency_key),
            CircuitBreakerError::Failure(e) => ConveyorError::Internal(e.to_string()),
        }
    }
}
