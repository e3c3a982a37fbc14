//! Error handling for the ingestion engine
//!
//! Three families of failures cross the engine boundary: configuration and
//! lifecycle errors raised at operation entry (returned to the caller, job
//! state untouched), record-level errors (captured into record state, never
//! surfaced as `Err` while `continue_on_error` holds), and fatal driver
//! errors (the job transitions to `Failed`; the error is reported through
//! `job:failed` rather than re-thrown).

use bulkflow_shared::JobStatus;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error types produced by the ingestion engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid or missing configuration, raised at operation entry
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Job status transition not admitted by the lifecycle state machine
    #[error("Invalid job status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Record-level validation failure escalated because
    /// `continue_on_error` is disabled
    #[error("Validation failed for record {record_index}: {message}")]
    ValidationFailed { record_index: u64, message: String },

    /// Data source failure
    #[error("Source error: {message}")]
    Source { message: String },

    /// Parser failure
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// State store failure
    #[error("State store error: {message}")]
    Store { message: String },

    /// Referenced job does not exist in the state store
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    /// Processor failure escalated because `continue_on_error` is disabled
    #[error("Processing failed for record {record_index}: {message}")]
    Processing { record_index: u64, message: String },

    /// Underlying I/O failure (file-backed store)
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization failure (persisted state)
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition { from, to }
    }

    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    /// Whether this error counts as a lifecycle/configuration entry error
    /// (reported to the caller without touching job state)
    pub fn is_entry_error(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration { .. } | EngineError::InvalidTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_render_both_states() {
        let err = EngineError::invalid_transition(JobStatus::Paused, JobStatus::Completed);
        let message = err.to_string();
        assert!(message.contains("Paused"));
        assert!(message.contains("Completed"));
        assert!(err.is_entry_error());
    }

    #[test]
    fn store_errors_are_not_entry_errors() {
        assert!(!EngineError::store("disk gone").is_entry_error());
    }
}
