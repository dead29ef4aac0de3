//! # Conveyor Server Library
//!
//! Wiring for the worker process: job store selection, processor
//! registration and the run loop used by the `conveyor-server` binary.

pub mod app;
pub mod startup;
