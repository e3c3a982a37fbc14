//! Per-job mutable state
//!
//! The `JobContext` exclusively owns the runtime state of one job: status,
//! counters, the batch vector and its id→position map, the completed-batch
//! index set, the pause gate, and the cancellation token. All mutation goes
//! through short lock-guarded sections that are never held across an await;
//! persistence works off cloned snapshots.

use std::collections::{HashMap, HashSet};

use bulkflow_shared::{
    BatchStatus, ImportBatch, ImportConfig, ImportProgress, ImportSummary, JobState, JobStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// One-shot synchronization gate awaited by the pipeline at safe points
///
/// `engage` blocks subsequent `wait_ready` callers; `release` lets them
/// continue. Backed by a watch channel so a waiter arriving after the
/// release never blocks.
#[derive(Debug)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn engage(&self) {
        let _ = self.paused.send(true);
    }

    pub fn release(&self) {
        let _ = self.paused.send(false);
    }

    pub fn is_engaged(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open
    pub async fn wait_ready(&self) {
        let mut rx = self.paused.subscribe();
        // The sender lives as long as the gate, so wait_for cannot fail.
        let _ = rx.wait_for(|paused| !paused).await;
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

struct ContextInner {
    status: JobStatus,
    batches: Vec<ImportBatch>,
    batch_pos_by_id: HashMap<String, usize>,
    completed_batch_indices: HashSet<u64>,
    total_records: u64,
    processed_count: u64,
    failed_count: u64,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    distributed: bool,
    /// Set when the context was rebuilt from persisted state; a restored
    /// context keeps its counters and completed set across the next start.
    restored: bool,
}

/// Mutable per-job state with FSM enforcement
pub struct JobContext {
    job_id: String,
    config: ImportConfig,
    inner: RwLock<ContextInner>,
    pause: PauseGate,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: Option<String>, config: ImportConfig) -> Self {
        Self {
            job_id: job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            config,
            inner: RwLock::new(ContextInner {
                status: JobStatus::Created,
                batches: Vec::new(),
                batch_pos_by_id: HashMap::new(),
                completed_batch_indices: HashSet::new(),
                total_records: 0,
                processed_count: 0,
                failed_count: 0,
                started_at: None,
                completed_at: None,
                distributed: false,
                restored: false,
            }),
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Rebuild a context from persisted state
    ///
    /// The runtime status resets to `Created`: the persisted status
    /// describes the previous run, and the state machine requires a
    /// startable state. Counters and the completed-batch set carry over so
    /// the next start skips finished work.
    pub fn from_state(state: JobState, processed: u64, failed: u64) -> Self {
        let completed_batch_indices = state
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .map(|b| b.index)
            .collect();
        let batch_pos_by_id = state
            .batches
            .iter()
            .enumerate()
            .map(|(pos, b)| (b.id.clone(), pos))
            .collect();
        Self {
            job_id: state.id,
            config: state.config,
            inner: RwLock::new(ContextInner {
                status: JobStatus::Created,
                batches: state.batches,
                batch_pos_by_id,
                completed_batch_indices,
                total_records: state.total_records,
                processed_count: processed,
                failed_count: failed,
                started_at: state.started_at,
                completed_at: None,
                distributed: state.distributed,
                restored: true,
            }),
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn status(&self) -> JobStatus {
        self.inner.read().status
    }

    pub fn pause_gate(&self) -> &PauseGate {
        &self.pause
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Apply a status transition, enforcing the lifecycle table
    pub fn transition(&self, to: JobStatus) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.status.can_transition_to(to) {
            return Err(EngineError::invalid_transition(inner.status, to));
        }
        inner.status = to;
        match to {
            JobStatus::Processing if inner.started_at.is_none() => {
                inner.started_at = Some(Utc::now());
            }
            JobStatus::Completed | JobStatus::Aborted | JobStatus::Failed => {
                inner.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Reset runtime state for a fresh start
    ///
    /// A restored context keeps counters, batches, and the completed-batch
    /// set so previously finished batches stay finished.
    pub fn reset_for_start(&self) {
        let mut inner = self.inner.write();
        if inner.restored {
            // One resumed run per restore; a subsequent start is fresh.
            inner.restored = false;
            return;
        }
        inner.batches.clear();
        inner.batch_pos_by_id.clear();
        inner.completed_batch_indices.clear();
        inner.total_records = 0;
        inner.processed_count = 0;
        inner.failed_count = 0;
        inner.started_at = None;
        inner.completed_at = None;
    }

    pub fn mark_distributed(&self) {
        self.inner.write().distributed = true;
    }

    /// Account for a streamed record by index
    ///
    /// `total_records` only ever grows; on a resumed run the re-parsed
    /// prefix carries indices the job has already counted.
    pub fn observe_record_index(&self, index: u64) {
        let mut inner = self.inner.write();
        inner.total_records = inner.total_records.max(index + 1);
    }

    pub fn total_records(&self) -> u64 {
        self.inner.read().total_records
    }

    pub fn completed_batch_indices(&self) -> HashSet<u64> {
        self.inner.read().completed_batch_indices.clone()
    }

    /// Append a batch entering processing
    pub fn begin_batch(&self, batch: ImportBatch) {
        let mut inner = self.inner.write();
        let pos = inner.batches.len();
        inner.batch_pos_by_id.insert(batch.id.clone(), pos);
        inner.batches.push(batch);
    }

    /// Count one processed record against the job and its batch
    pub fn record_processed(&self, batch_id: &str) {
        let mut inner = self.inner.write();
        inner.processed_count += 1;
        if let Some(&pos) = inner.batch_pos_by_id.get(batch_id) {
            inner.batches[pos].processed_count += 1;
        }
    }

    /// Count one failed or invalid record against the job and its batch
    pub fn record_failed(&self, batch_id: &str) {
        let mut inner = self.inner.write();
        inner.failed_count += 1;
        if let Some(&pos) = inner.batch_pos_by_id.get(batch_id) {
            inner.batches[pos].failed_count += 1;
        }
    }

    /// Close out a batch: mark completed, release its record memory, and
    /// remember its index as done. Returns the final counts for events.
    pub fn complete_batch(&self, batch_id: &str) -> Option<(u64, u64, u64)> {
        let mut inner = self.inner.write();
        let pos = *inner.batch_pos_by_id.get(batch_id)?;
        let index = inner.batches[pos].index;
        inner.completed_batch_indices.insert(index);
        let batch = &mut inner.batches[pos];
        batch.status = BatchStatus::Completed;
        let total = batch.records.len() as u64;
        batch.records = Vec::new();
        Some((batch.processed_count, batch.failed_count, total))
    }

    pub fn batches(&self) -> Vec<ImportBatch> {
        self.inner.read().batches.clone()
    }

    /// Derive a progress snapshot from the live counters
    pub fn progress(&self) -> ImportProgress {
        let inner = self.inner.read();
        let completed_batches = inner.completed_batch_indices.len() as u64;
        let elapsed_ms = elapsed_ms(inner.started_at, inner.completed_at);
        ImportProgress::derive(
            inner.total_records,
            inner.processed_count,
            inner.failed_count,
            completed_batches,
            elapsed_ms,
        )
    }

    /// Final accounting for completion events
    pub fn summary(&self) -> ImportSummary {
        let inner = self.inner.read();
        let done = inner.processed_count + inner.failed_count;
        ImportSummary {
            total_records: inner.total_records,
            processed_records: inner.processed_count,
            failed_records: inner.failed_count,
            skipped: inner.total_records.saturating_sub(done),
            elapsed_ms: elapsed_ms(inner.started_at, inner.completed_at),
        }
    }

    /// Clone the persistable job state; batches persist with empty records
    pub fn snapshot(&self) -> JobState {
        let inner = self.inner.read();
        JobState {
            id: self.job_id.clone(),
            config: self.config.clone(),
            status: inner.status,
            batches: inner
                .batches
                .iter()
                .map(|b| ImportBatch {
                    records: Vec::new(),
                    ..b.clone()
                })
                .collect(),
            total_records: inner.total_records,
            processed_count: inner.processed_count,
            failed_count: inner.failed_count,
            started_at: inner.started_at,
            completed_at: inner.completed_at,
            distributed: inner.distributed,
        }
    }
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, completed_at: Option<DateTime<Utc>>) -> u64 {
    match started_at {
        Some(start) => {
            let end = completed_at.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds().max(0) as u64
        }
        None => 0,
    }
}
