//! Type definitions for the Bulkflow batch ingestion engine
//!
//! This module provides the core value shapes used across the engine:
//! records, validation errors, batches, job state, derived progress and
//! summary values, and the lifecycle event union.

pub mod events;
pub mod job;
pub mod record;

pub use events::{EngineEvent, EventKind};
pub use job::{
    BatchReservation, BatchStatus, ClaimDenialReason, ClaimOutcome, DistributedJobStatus,
    EngineStatus, ImportBatch, ImportProgress, ImportSummary, JobState, JobStatus,
};
pub use record::{ErrorCode, ErrorSeverity, ImportRecord, RawRecord, RecordStatus, ValidationError};
