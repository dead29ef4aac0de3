//! # Conveyor Core
//!
//! Core types shared by every Conveyor crate: the unified error type,
//! validation helpers built on `validator`, and tracing initialisation.

pub mod error;
pub mod result;
pub mod telemetry;
pub mod validation;

pub use error::*;
pub use result::*;
pub use telemetry::{init_tracing, LoggingConfig};
pub use validation::*;
