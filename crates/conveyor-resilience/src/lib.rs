//! # Conveyor Resilience
//!
//! Resilience patterns for Conveyor.
//! Provides per-dependency circuit breakers and timeouts.

pub mod circuit_breaker;
pub mod timeout;

pub use circuit_breaker::*;
pub use timeout::*;
