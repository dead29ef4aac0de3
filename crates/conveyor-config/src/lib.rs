//! # Conveyor Config
//!
//! Configuration management for Conveyor.
//! Supports layered configuration from files and environment variables,
//! validated before the job system starts.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
