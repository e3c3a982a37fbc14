//! Shared domain types for the Bulkflow batch ingestion engine
//!
//! This crate provides the data shapes used across the Bulkflow workspace:
//! records and their validation errors, batches, job state and its status
//! machine, derived progress/summary values, the lifecycle event union, and
//! the serializable engine configuration. It contains no behavior beyond
//! derivations on these values; the engine crate owns all processing logic.

pub mod config;
pub mod types;

pub use config::ImportConfig;
pub use types::*;
