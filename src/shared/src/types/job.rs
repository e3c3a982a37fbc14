//! Job-level types: batches, job state, the status machine, and derived
//! progress/summary values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ImportConfig;

use super::record::ImportRecord;

/// Lifecycle status of a batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

/// A contiguous window of records processed together
///
/// Batches are the unit of concurrency, event granularity, and persistence
/// checkpointing. A completed batch clears its `records` vector to release
/// memory; the state store retains the per-record data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportBatch {
    /// Unique batch identifier (v4 UUID)
    pub id: String,
    /// Sequential position within the job
    pub index: u64,
    /// Current lifecycle status
    pub status: BatchStatus,
    /// Records owned by this batch while it is in flight
    #[serde(default)]
    pub records: Vec<ImportRecord>,
    /// Records that reached `Processed`
    pub processed_count: u64,
    /// Records that reached `Failed` or `Invalid`
    pub failed_count: u64,
    /// Worker holding the batch in distributed mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Claim timestamp in distributed mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Source index of the first record in the batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_start_index: Option<u64>,
    /// Source index of the last record in the batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_end_index: Option<u64>,
}

impl ImportBatch {
    /// Create a batch over the given records with a fresh id
    pub fn new(index: u64, records: Vec<ImportRecord>) -> Self {
        let record_start_index = records.first().map(|r| r.index);
        let record_end_index = records.last().map(|r| r.index);
        Self {
            id: Uuid::new_v4().to_string(),
            index,
            status: BatchStatus::Pending,
            records,
            processed_count: 0,
            failed_count: 0,
            worker_id: None,
            claimed_at: None,
            record_start_index,
            record_end_index,
        }
    }
}

/// Lifecycle status of an ingestion job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Previewing,
    Previewed,
    Processing,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl JobStatus {
    /// Whether the transition `self → next` is admitted by the status machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Previewing)
                | (Created, Processing)
                | (Previewing, Previewed)
                | (Previewing, Failed)
                | (Previewed, Processing)
                | (Processing, Paused)
                | (Processing, Completed)
                | (Processing, Aborted)
                | (Processing, Failed)
                | (Paused, Processing)
                | (Paused, Aborted)
        )
    }

    /// Terminal statuses admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Aborted | JobStatus::Failed
        )
    }
}

/// Persisted state of an ingestion job
///
/// This is the shape written to and read from a state store. Batches are
/// persisted with empty `records`; per-record state lives in the store's
/// record collection keyed by `(job_id, record_index)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub id: String,
    /// Serializable snapshot of the engine configuration
    pub config: ImportConfig,
    pub status: JobStatus,
    /// Batches in index order
    pub batches: Vec<ImportBatch>,
    pub total_records: u64,
    pub processed_count: u64,
    pub failed_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub distributed: bool,
}

impl JobState {
    pub fn new(id: impl Into<String>, config: ImportConfig) -> Self {
        Self {
            id: id.into(),
            config,
            status: JobStatus::Created,
            batches: Vec::new(),
            total_records: 0,
            processed_count: 0,
            failed_count: 0,
            started_at: None,
            completed_at: None,
            distributed: false,
        }
    }
}

/// Point-in-time view of job progress, derived and never stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportProgress {
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_records: u64,
    pub pending_records: u64,
    /// `round((processed + failed) / total × 100)`, 0 when total is 0
    pub percentage: u32,
    /// Count of completed batches
    pub current_batch: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}

impl ImportProgress {
    /// Derive a progress value from raw counters
    pub fn derive(
        total: u64,
        processed: u64,
        failed: u64,
        completed_batches: u64,
        elapsed_ms: u64,
    ) -> Self {
        let done = processed + failed;
        let percentage = if total == 0 {
            0
        } else {
            ((done as f64 / total as f64) * 100.0).round() as u32
        };
        let estimated_remaining_ms = if done > 0 && total > done {
            Some((elapsed_ms as f64 / done as f64 * (total - done) as f64) as u64)
        } else {
            None
        };
        Self {
            total_records: total,
            processed_records: processed,
            failed_records: failed,
            pending_records: total.saturating_sub(done),
            percentage,
            current_batch: completed_batches,
            elapsed_ms,
            estimated_remaining_ms,
        }
    }
}

/// Final accounting emitted when a job completes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportSummary {
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_records: u64,
    /// Records neither processed nor failed (e.g. skipped empty rows)
    pub skipped: u64,
    pub elapsed_ms: u64,
}

/// Combined status view returned by the engine's status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub status: JobStatus,
    pub progress: ImportProgress,
    pub batches: Vec<ImportBatch>,
}

/// A successful claim on a pending batch in distributed mode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReservation {
    pub job_id: String,
    pub batch_id: String,
    pub batch_index: u64,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Why a claim attempt returned nothing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimDenialReason {
    NoPendingBatches,
    JobNotFound,
    JobNotProcessing,
}

/// Outcome of a claim attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClaimOutcome {
    Claimed { reservation: BatchReservation },
    Denied { reason: ClaimDenialReason },
}

/// Aggregate batch accounting for a distributed job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedJobStatus {
    pub total_batches: u64,
    pub completed: u64,
    pub failed: u64,
    pub processing: u64,
    pub pending: u64,
    pub is_complete: bool,
}
