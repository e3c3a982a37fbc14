//! Lifecycle event definitions for the ingestion engine
//!
//! Events form a single discriminated union keyed by `type`. Every event
//! carries the job id and an emission timestamp; payloads follow the shape
//! of the lifecycle edge they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{ImportProgress, ImportSummary};
use super::record::ImportRecord;

/// All events emitted by an ingestion job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "job:started")]
    JobStarted {
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "job:completed")]
    JobCompleted {
        job_id: String,
        timestamp: DateTime<Utc>,
        summary: ImportSummary,
    },
    #[serde(rename = "job:paused")]
    JobPaused {
        job_id: String,
        timestamp: DateTime<Utc>,
        progress: ImportProgress,
    },
    #[serde(rename = "job:aborted")]
    JobAborted {
        job_id: String,
        timestamp: DateTime<Utc>,
        progress: ImportProgress,
    },
    #[serde(rename = "job:failed")]
    JobFailed {
        job_id: String,
        timestamp: DateTime<Utc>,
        error: String,
    },
    #[serde(rename = "job:progress")]
    JobProgress {
        job_id: String,
        timestamp: DateTime<Utc>,
        progress: ImportProgress,
    },
    #[serde(rename = "batch:started")]
    BatchStarted {
        job_id: String,
        timestamp: DateTime<Utc>,
        batch_id: String,
        batch_index: u64,
        record_count: u64,
    },
    #[serde(rename = "batch:completed")]
    BatchCompleted {
        job_id: String,
        timestamp: DateTime<Utc>,
        batch_id: String,
        batch_index: u64,
        processed_count: u64,
        failed_count: u64,
        total_count: u64,
    },
    #[serde(rename = "batch:failed")]
    BatchFailed {
        job_id: String,
        timestamp: DateTime<Utc>,
        batch_id: String,
        batch_index: u64,
        error: String,
    },
    #[serde(rename = "record:processed")]
    RecordProcessed {
        job_id: String,
        timestamp: DateTime<Utc>,
        batch_id: String,
        record_index: u64,
    },
    #[serde(rename = "record:failed")]
    RecordFailed {
        job_id: String,
        timestamp: DateTime<Utc>,
        error: String,
        record: ImportRecord,
    },
    #[serde(rename = "record:retried")]
    RecordRetried {
        job_id: String,
        timestamp: DateTime<Utc>,
        record_index: u64,
        /// 1-based attempt number
        attempt: u32,
        max_retries: u32,
        /// Message of the attempt that failed
        error: String,
    },
    #[serde(rename = "chunk:completed")]
    ChunkCompleted {
        job_id: String,
        timestamp: DateTime<Utc>,
        processed_records: u64,
        failed_records: u64,
        done: bool,
    },
    #[serde(rename = "batch:claimed")]
    BatchClaimed {
        job_id: String,
        timestamp: DateTime<Utc>,
        worker_id: String,
        batch_id: String,
        batch_index: u64,
    },
    #[serde(rename = "distributed:prepared")]
    DistributedPrepared {
        job_id: String,
        timestamp: DateTime<Utc>,
        total_records: u64,
        total_batches: u64,
    },
}

impl EngineEvent {
    /// Discriminant of this event, used as the subscription key
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::JobStarted { .. } => EventKind::JobStarted,
            EngineEvent::JobCompleted { .. } => EventKind::JobCompleted,
            EngineEvent::JobPaused { .. } => EventKind::JobPaused,
            EngineEvent::JobAborted { .. } => EventKind::JobAborted,
            EngineEvent::JobFailed { .. } => EventKind::JobFailed,
            EngineEvent::JobProgress { .. } => EventKind::JobProgress,
            EngineEvent::BatchStarted { .. } => EventKind::BatchStarted,
            EngineEvent::BatchCompleted { .. } => EventKind::BatchCompleted,
            EngineEvent::BatchFailed { .. } => EventKind::BatchFailed,
            EngineEvent::RecordProcessed { .. } => EventKind::RecordProcessed,
            EngineEvent::RecordFailed { .. } => EventKind::RecordFailed,
            EngineEvent::RecordRetried { .. } => EventKind::RecordRetried,
            EngineEvent::ChunkCompleted { .. } => EventKind::ChunkCompleted,
            EngineEvent::BatchClaimed { .. } => EventKind::BatchClaimed,
            EngineEvent::DistributedPrepared { .. } => EventKind::DistributedPrepared,
        }
    }

    /// Job the event belongs to
    pub fn job_id(&self) -> &str {
        match self {
            EngineEvent::JobStarted { job_id, .. }
            | EngineEvent::JobCompleted { job_id, .. }
            | EngineEvent::JobPaused { job_id, .. }
            | EngineEvent::JobAborted { job_id, .. }
            | EngineEvent::JobFailed { job_id, .. }
            | EngineEvent::JobProgress { job_id, .. }
            | EngineEvent::BatchStarted { job_id, .. }
            | EngineEvent::BatchCompleted { job_id, .. }
            | EngineEvent::BatchFailed { job_id, .. }
            | EngineEvent::RecordProcessed { job_id, .. }
            | EngineEvent::RecordFailed { job_id, .. }
            | EngineEvent::RecordRetried { job_id, .. }
            | EngineEvent::ChunkCompleted { job_id, .. }
            | EngineEvent::BatchClaimed { job_id, .. }
            | EngineEvent::DistributedPrepared { job_id, .. } => job_id,
        }
    }
}

/// Event discriminants for typed subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    JobStarted,
    JobCompleted,
    JobPaused,
    JobAborted,
    JobFailed,
    JobProgress,
    BatchStarted,
    BatchCompleted,
    BatchFailed,
    RecordProcessed,
    RecordFailed,
    RecordRetried,
    ChunkCompleted,
    BatchClaimed,
    DistributedPrepared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_type_tags() {
        let event = EngineEvent::JobStarted {
            job_id: "job-1".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job:started");
        assert_eq!(json["job_id"], "job-1");
    }

    #[test]
    fn kind_matches_variant() {
        let event = EngineEvent::ChunkCompleted {
            job_id: "job-1".into(),
            timestamp: Utc::now(),
            processed_records: 3,
            failed_records: 1,
            done: false,
        };
        assert_eq!(event.kind(), EventKind::ChunkCompleted);
        assert_eq!(event.job_id(), "job-1");
    }
}
