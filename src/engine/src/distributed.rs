//! Distributed execution: the batch claim protocol
//!
//! A distributed store extends the base persistence port with atomic batch
//! claiming, stale-claim reclamation, bulk record access for the prepare
//! phase, and a finalize election that picks exactly one worker to close
//! the job. The in-memory implementation keeps the whole claim path under a
//! single mutex, which is the reference semantics a SQL-backed store must
//! reproduce with row locks or an optimistic version column.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bulkflow_shared::{
    BatchReservation, BatchStatus, ClaimDenialReason, ClaimOutcome, DistributedJobStatus,
    ImportProgress, ImportRecord, JobState, JobStatus, RecordStatus,
};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::store::{BatchStateUpdate, StateStore};

/// Persistence port for multi-worker execution
#[async_trait]
pub trait DistributedStateStore: StateStore {
    /// Atomically claim one pending batch for `worker_id`
    ///
    /// Safe against concurrent callers: a given batch is handed to at most
    /// one worker.
    async fn claim_batch(&self, job_id: &str, worker_id: &str) -> Result<ClaimOutcome>;

    /// Return a batch to pending, only if `worker_id` currently holds it
    async fn release_batch(&self, job_id: &str, batch_id: &str, worker_id: &str) -> Result<()>;

    /// Return every batch whose claim is older than `timeout_ms` to pending
    ///
    /// Idempotent and concurrent-safe; returns the number reclaimed.
    async fn reclaim_stale_batches(&self, job_id: &str, timeout_ms: u64) -> Result<u64>;

    /// Bulk-persist the records of one batch (prepare phase)
    async fn save_batch_records(
        &self,
        job_id: &str,
        batch_id: &str,
        records: &[ImportRecord],
    ) -> Result<()>;

    /// Load the records of one batch
    async fn get_batch_records(&self, job_id: &str, batch_id: &str) -> Result<Vec<ImportRecord>>;

    async fn get_distributed_status(&self, job_id: &str) -> Result<DistributedJobStatus>;

    /// Elect the finalizing worker
    ///
    /// Returns `true` to exactly one caller once every batch is terminal;
    /// that caller transitions the job and emits completion.
    async fn try_finalize_job(&self, job_id: &str) -> Result<bool>;
}

struct DistributedJob {
    state: JobState,
    records: BTreeMap<u64, ImportRecord>,
    /// batch id → record indices, written during the prepare phase
    batch_records: HashMap<String, Vec<u64>>,
    finalized: bool,
}

/// Reference in-memory distributed store
///
/// One mutex guards every job, making each claim/release/finalize a single
/// critical section.
#[derive(Default)]
pub struct InMemoryDistributedStore {
    jobs: Mutex<HashMap<String, DistributedJob>>,
}

impl InMemoryDistributedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryDistributedStore {
    async fn save_job_state(&self, state: &JobState) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&state.id) {
            Some(job) => job.state = state.clone(),
            None => {
                jobs.insert(
                    state.id.clone(),
                    DistributedJob {
                        state: state.clone(),
                        records: BTreeMap::new(),
                        batch_records: HashMap::new(),
                        finalized: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>> {
        Ok(self.jobs.lock().await.get(job_id).map(|j| j.state.clone()))
    }

    async fn update_batch_state(
        &self,
        job_id: &str,
        batch_id: &str,
        update: BatchStateUpdate,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let batch = job
            .state
            .batches
            .iter_mut()
            .find(|b| b.id == batch_id)
            .ok_or_else(|| EngineError::store(format!("batch {batch_id} not found")))?;
        batch.status = update.status;
        batch.processed_count = update.processed_count;
        batch.failed_count = update.failed_count;
        Ok(())
    }

    async fn save_processed_record(
        &self,
        job_id: &str,
        _batch_id: &str,
        record: &ImportRecord,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        job.records.insert(record.index, record.clone());
        Ok(())
    }

    async fn get_failed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .get(job_id)
            .map(|job| {
                job.records
                    .values()
                    .filter(|r| matches!(r.status, RecordStatus::Failed | RecordStatus::Invalid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_pending_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .get(job_id)
            .map(|job| {
                job.records
                    .values()
                    .filter(|r| matches!(r.status, RecordStatus::Pending | RecordStatus::Valid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_processed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .get(job_id)
            .map(|job| {
                job.records
                    .values()
                    .filter(|r| r.status == RecordStatus::Processed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_progress(&self, job_id: &str) -> Result<ImportProgress> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let processed = job
            .records
            .values()
            .filter(|r| r.status == RecordStatus::Processed)
            .count() as u64;
        let failed = job
            .records
            .values()
            .filter(|r| matches!(r.status, RecordStatus::Failed | RecordStatus::Invalid))
            .count() as u64;
        let completed_batches = job
            .state
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .count() as u64;
        let elapsed_ms = job
            .state
            .started_at
            .map(|start| {
                let end = job.state.completed_at.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as u64
            })
            .unwrap_or(0);
        Ok(ImportProgress::derive(
            job.state.total_records,
            processed,
            failed,
            completed_batches,
            elapsed_ms,
        ))
    }
}

#[async_trait]
impl DistributedStateStore for InMemoryDistributedStore {
    async fn claim_batch(&self, job_id: &str, worker_id: &str) -> Result<ClaimOutcome> {
        let mut jobs = self.jobs.lock().await;
        let job = match jobs.get_mut(job_id) {
            Some(job) => job,
            None => {
                return Ok(ClaimOutcome::Denied {
                    reason: ClaimDenialReason::JobNotFound,
                })
            }
        };
        if job.state.status != JobStatus::Processing {
            return Ok(ClaimOutcome::Denied {
                reason: ClaimDenialReason::JobNotProcessing,
            });
        }
        let Some(batch) = job
            .state
            .batches
            .iter_mut()
            .find(|b| b.status == BatchStatus::Pending)
        else {
            return Ok(ClaimOutcome::Denied {
                reason: ClaimDenialReason::NoPendingBatches,
            });
        };

        let claimed_at = Utc::now();
        batch.status = BatchStatus::Processing;
        batch.worker_id = Some(worker_id.to_string());
        batch.claimed_at = Some(claimed_at);
        debug!(job_id, worker_id, batch_index = batch.index, "batch claimed");
        Ok(ClaimOutcome::Claimed {
            reservation: BatchReservation {
                job_id: job_id.to_string(),
                batch_id: batch.id.clone(),
                batch_index: batch.index,
                worker_id: worker_id.to_string(),
                claimed_at,
            },
        })
    }

    async fn release_batch(&self, job_id: &str, batch_id: &str, worker_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        if let Some(batch) = job.state.batches.iter_mut().find(|b| b.id == batch_id) {
            if batch.worker_id.as_deref() == Some(worker_id)
                && batch.status == BatchStatus::Processing
            {
                batch.status = BatchStatus::Pending;
                batch.worker_id = None;
                batch.claimed_at = None;
            }
        }
        Ok(())
    }

    async fn reclaim_stale_batches(&self, job_id: &str, timeout_ms: u64) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let cutoff = Utc::now() - ChronoDuration::milliseconds(timeout_ms as i64);
        let mut reclaimed = 0;
        for batch in &mut job.state.batches {
            if batch.status == BatchStatus::Processing
                && batch.claimed_at.is_some_and(|at| at < cutoff)
            {
                batch.status = BatchStatus::Pending;
                batch.worker_id = None;
                batch.claimed_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn save_batch_records(
        &self,
        job_id: &str,
        batch_id: &str,
        records: &[ImportRecord],
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let indices = records.iter().map(|r| r.index).collect();
        for record in records {
            job.records.insert(record.index, record.clone());
        }
        job.batch_records.insert(batch_id.to_string(), indices);
        Ok(())
    }

    async fn get_batch_records(&self, job_id: &str, batch_id: &str) -> Result<Vec<ImportRecord>> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let indices = job
            .batch_records
            .get(batch_id)
            .ok_or_else(|| EngineError::store(format!("no records for batch {batch_id}")))?;
        Ok(indices
            .iter()
            .filter_map(|index| job.records.get(index).cloned())
            .collect())
    }

    async fn get_distributed_status(&self, job_id: &str) -> Result<DistributedJobStatus> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let mut status = DistributedJobStatus {
            total_batches: job.state.batches.len() as u64,
            completed: 0,
            failed: 0,
            processing: 0,
            pending: 0,
            is_complete: false,
        };
        for batch in &job.state.batches {
            match batch.status {
                BatchStatus::Completed => status.completed += 1,
                BatchStatus::Failed => status.failed += 1,
                BatchStatus::Processing => status.processing += 1,
                BatchStatus::Pending | BatchStatus::Paused => status.pending += 1,
            }
        }
        status.is_complete =
            status.total_batches > 0 && status.completed + status.failed == status.total_batches;
        Ok(status)
    }

    async fn try_finalize_job(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        if job.finalized {
            return Ok(false);
        }
        let all_terminal = !job.state.batches.is_empty()
            && job.state.batches.iter().all(|b| b.status.is_terminal());
        if !all_terminal {
            return Ok(false);
        }
        job.finalized = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkflow_shared::{ImportBatch, ImportConfig};
    use std::sync::Arc;

    async fn seeded_store(job_id: &str, batches: usize) -> InMemoryDistributedStore {
        let store = InMemoryDistributedStore::new();
        let mut state = JobState::new(job_id, ImportConfig::default());
        state.status = JobStatus::Processing;
        state.distributed = true;
        for index in 0..batches {
            state.batches.push(ImportBatch::new(index as u64, Vec::new()));
        }
        store.save_job_state(&state).await.unwrap();
        store
    }

    #[tokio::test]
    async fn claim_denials_carry_reasons() {
        let store = InMemoryDistributedStore::new();
        let outcome = store.claim_batch("missing", "w1").await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Denied {
                reason: ClaimDenialReason::JobNotFound
            }
        );

        let mut state = JobState::new("job", ImportConfig::default());
        state.batches.push(ImportBatch::new(0, Vec::new()));
        store.save_job_state(&state).await.unwrap();
        let outcome = store.claim_batch("job", "w1").await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Denied {
                reason: ClaimDenialReason::JobNotProcessing
            }
        );
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_batch() {
        let store = Arc::new(seeded_store("job", 4).await);

        let mut handles = Vec::new();
        for worker in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_batch("job", &format!("worker-{worker}"))
                    .await
                    .unwrap()
            }));
        }

        let mut claimed_ids = Vec::new();
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed { reservation } => claimed_ids.push(reservation.batch_id),
                ClaimOutcome::Denied { reason } => {
                    assert_eq!(reason, ClaimDenialReason::NoPendingBatches);
                    denied += 1;
                }
            }
        }

        claimed_ids.sort();
        claimed_ids.dedup();
        assert_eq!(claimed_ids.len(), 4, "each batch claimed exactly once");
        assert_eq!(denied, 12);
    }

    #[tokio::test]
    async fn release_requires_the_holder() {
        let store = seeded_store("job", 1).await;
        let ClaimOutcome::Claimed { reservation } = store.claim_batch("job", "w1").await.unwrap()
        else {
            panic!("claim should succeed")
        };

        // A non-holder release is ignored.
        store
            .release_batch("job", &reservation.batch_id, "intruder")
            .await
            .unwrap();
        let status = store.get_distributed_status("job").await.unwrap();
        assert_eq!(status.processing, 1);

        store
            .release_batch("job", &reservation.batch_id, "w1")
            .await
            .unwrap();
        let status = store.get_distributed_status("job").await.unwrap();
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimed_idempotently() {
        let store = seeded_store("job", 2).await;
        store.claim_batch("job", "w1").await.unwrap();
        store.claim_batch("job", "w2").await.unwrap();

        // Nothing is stale yet under a generous timeout.
        assert_eq!(store.reclaim_stale_batches("job", 60_000).await.unwrap(), 0);

        // Everything is stale under a zero timeout.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.reclaim_stale_batches("job", 0).await.unwrap(), 2);
        assert_eq!(store.reclaim_stale_batches("job", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn finalize_elects_exactly_one_winner() {
        let store = Arc::new(seeded_store("job", 2).await);
        for batch_index in 0..2u64 {
            let state = store.get_job_state("job").await.unwrap().unwrap();
            let batch_id = state.batches[batch_index as usize].id.clone();
            store
                .update_batch_state(
                    "job",
                    &batch_id,
                    BatchStateUpdate {
                        status: BatchStatus::Completed,
                        processed_count: 0,
                        failed_count: 0,
                    },
                )
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.try_finalize_job("job").await },
            ));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn batch_records_round_trip_in_order() {
        let store = seeded_store("job", 1).await;
        let state = store.get_job_state("job").await.unwrap().unwrap();
        let batch_id = state.batches[0].id.clone();

        let records: Vec<ImportRecord> = (0..3)
            .map(|i| ImportRecord::pending(i, Default::default()))
            .collect();
        store
            .save_batch_records("job", &batch_id, &records)
            .await
            .unwrap();

        let loaded = store.get_batch_records("job", &batch_id).await.unwrap();
        assert_eq!(loaded, records);
    }
}
