//! State persistence port and reference implementations
//!
//! The state store is the sole owner of persisted job state; every write
//! goes through it. Two reference implementations ship with the engine: a
//! DashMap-backed in-memory store and a JSON-file store that lays out two
//! documents per job (`<job_id>.job.json`, `<job_id>.records.json`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bulkflow_shared::{
    BatchStatus, ImportProgress, ImportRecord, JobState, RecordStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

/// Partial batch update applied by `update_batch_state`
#[derive(Debug, Clone)]
pub struct BatchStateUpdate {
    pub status: BatchStatus,
    pub processed_count: u64,
    pub failed_count: u64,
}

/// Persistence port for job state and per-record status
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_job_state(&self, state: &JobState) -> Result<()>;

    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>>;

    async fn update_batch_state(
        &self,
        job_id: &str,
        batch_id: &str,
        update: BatchStateUpdate,
    ) -> Result<()>;

    /// Upsert one record keyed by `(job_id, record_index)`
    async fn save_processed_record(
        &self,
        job_id: &str,
        batch_id: &str,
        record: &ImportRecord,
    ) -> Result<()>;

    /// Records whose terminal status is `Failed` or `Invalid`
    async fn get_failed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>>;

    /// Records still in flight (`Pending` or `Valid`)
    async fn get_pending_records(&self, job_id: &str) -> Result<Vec<ImportRecord>>;

    async fn get_processed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>>;

    /// Derive progress from the stored state and records
    async fn get_progress(&self, job_id: &str) -> Result<ImportProgress>;
}

/// Derive progress from a persisted state plus its record collection
fn derive_progress(state: &JobState, records: &BTreeMap<u64, ImportRecord>) -> ImportProgress {
    let processed = records
        .values()
        .filter(|r| r.status == RecordStatus::Processed)
        .count() as u64;
    let failed = records
        .values()
        .filter(|r| matches!(r.status, RecordStatus::Failed | RecordStatus::Invalid))
        .count() as u64;
    let completed_batches = state
        .batches
        .iter()
        .filter(|b| b.status == BatchStatus::Completed)
        .count() as u64;
    let elapsed_ms = state
        .started_at
        .map(|start| {
            let end = state.completed_at.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds().max(0) as u64
        })
        .unwrap_or(0);
    ImportProgress::derive(
        state.total_records,
        processed,
        failed,
        completed_batches,
        elapsed_ms,
    )
}

fn filter_records(
    records: &BTreeMap<u64, ImportRecord>,
    keep: impl Fn(RecordStatus) -> bool,
) -> Vec<ImportRecord> {
    records
        .values()
        .filter(|r| keep(r.status))
        .cloned()
        .collect()
}

/// In-memory reference store
///
/// DashMap shard locks serialize access per job id, which is all the
/// single-node pipeline requires.
#[derive(Default)]
pub struct InMemoryStateStore {
    jobs: DashMap<String, JobState>,
    records: DashMap<String, BTreeMap<u64, ImportRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_job_state(&self, state: &JobState) -> Result<()> {
        self.jobs.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>> {
        Ok(self.jobs.get(job_id).map(|entry| entry.clone()))
    }

    async fn update_batch_state(
        &self,
        job_id: &str,
        batch_id: &str,
        update: BatchStateUpdate,
    ) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let batch = job
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
        self.records
            .entry(job_id.to_string())
            .or_default()
            .insert(record.index, record.clone());
        Ok(())
    }

    async fn get_failed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        Ok(self
            .records
            .get(job_id)
            .map(|records| {
                filter_records(&records, |s| {
                    matches!(s, RecordStatus::Failed | RecordStatus::Invalid)
                })
            })
            .unwrap_or_default())
    }

    async fn get_pending_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        Ok(self
            .records
            .get(job_id)
            .map(|records| {
                filter_records(&records, |s| {
                    matches!(s, RecordStatus::Pending | RecordStatus::Valid)
                })
            })
            .unwrap_or_default())
    }

    async fn get_processed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        Ok(self
            .records
            .get(job_id)
            .map(|records| filter_records(&records, |s| s == RecordStatus::Processed))
            .unwrap_or_default())
    }

    async fn get_progress(&self, job_id: &str) -> Result<ImportProgress> {
        let state = self
            .jobs
            .get(job_id)
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let records = self.records.get(job_id);
        let empty = BTreeMap::new();
        Ok(derive_progress(
            &state,
            records.as_deref().unwrap_or(&empty),
        ))
    }
}

/// File-backed reference store: two JSON documents per job
///
/// Writes go to a temp file first and are renamed into place. A per-store
/// mutex serializes writers; the record collection is cached in memory so
/// per-record upserts do not re-read the file.
pub struct JsonFileStateStore {
    dir: PathBuf,
    record_cache: DashMap<String, BTreeMap<u64, ImportRecord>>,
    write_lock: Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            record_cache: DashMap::new(),
            write_lock: Mutex::new(()),
        })
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.job.json"))
    }

    fn records_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.records.json"))
    }

    async fn write_atomically(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<JobState>> {
        match tokio::fs::read(self.job_path(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_records(&self, job_id: &str) -> Result<BTreeMap<u64, ImportRecord>> {
        if let Some(cached) = self.record_cache.get(job_id) {
            return Ok(cached.clone());
        }
        let records: Vec<ImportRecord> = match tokio::fs::read(self.records_path(job_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let map: BTreeMap<u64, ImportRecord> =
            records.into_iter().map(|r| (r.index, r)).collect();
        self.record_cache.insert(job_id.to_string(), map.clone());
        Ok(map)
    }

    async fn store_records(&self, job_id: &str, records: &BTreeMap<u64, ImportRecord>) -> Result<()> {
        let list: Vec<&ImportRecord> = records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        self.write_atomically(&self.records_path(job_id), bytes)
            .await
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn save_job_state(&self, state: &JobState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(state)?;
        self.write_atomically(&self.job_path(&state.id), bytes).await
    }

    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>> {
        self.load_job(job_id).await
    }

    async fn update_batch_state(
        &self,
        job_id: &str,
        batch_id: &str,
        update: BatchStateUpdate,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let batch = state
            .batches
            .iter_mut()
            .find(|b| b.id == batch_id)
            .ok_or_else(|| EngineError::store(format!("batch {batch_id} not found")))?;
        batch.status = update.status;
        batch.processed_count = update.processed_count;
        batch.failed_count = update.failed_count;
        let bytes = serde_json::to_vec_pretty(&state)?;
        self.write_atomically(&self.job_path(job_id), bytes).await
    }

    async fn save_processed_record(
        &self,
        job_id: &str,
        _batch_id: &str,
        record: &ImportRecord,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load_records(job_id).await?;
        records.insert(record.index, record.clone());
        self.record_cache
            .insert(job_id.to_string(), records.clone());
        self.store_records(job_id, &records).await
    }

    async fn get_failed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        let records = self.load_records(job_id).await?;
        Ok(filter_records(&records, |s| {
            matches!(s, RecordStatus::Failed | RecordStatus::Invalid)
        }))
    }

    async fn get_pending_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        let records = self.load_records(job_id).await?;
        Ok(filter_records(&records, |s| {
            matches!(s, RecordStatus::Pending | RecordStatus::Valid)
        }))
    }

    async fn get_processed_records(&self, job_id: &str) -> Result<Vec<ImportRecord>> {
        let records = self.load_records(job_id).await?;
        Ok(filter_records(&records, |s| s == RecordStatus::Processed))
    }

    async fn get_progress(&self, job_id: &str) -> Result<ImportProgress> {
        let state = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| EngineError::job_not_found(job_id))?;
        let records = self.load_records(job_id).await?;
        Ok(derive_progress(&state, &records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkflow_shared::{ImportBatch, ImportConfig, JobStatus};
    use pretty_assertions::assert_eq;

    fn seeded_state(job_id: &str) -> JobState {
        let mut state = JobState::new(job_id, ImportConfig::default());
        state.status = JobStatus::Processing;
        state.total_records = 3;
        state.started_at = Some(Utc::now());
        let mut batch = ImportBatch::new(0, Vec::new());
        batch.status = BatchStatus::Completed;
        state.batches.push(batch);
        state
    }

    async fn exercise_store(store: &dyn StateStore) {
        let state = seeded_state("job-1");
        store.save_job_state(&state).await.unwrap();

        let loaded = store.get_job_state("job-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.get_job_state("missing").await.unwrap().is_none());

        let batch_id = state.batches[0].id.clone();
        let processed = ImportRecord::pending(0, Default::default())
            .into_valid(Default::default(), vec![])
            .into_processed(0);
        let failed = ImportRecord::pending(1, Default::default()).into_failed("boom", 2);
        store
            .save_processed_record("job-1", &batch_id, &processed)
            .await
            .unwrap();
        store
            .save_processed_record("job-1", &batch_id, &failed)
            .await
            .unwrap();

        // Upsert: saving the same index again keeps one record, latest wins.
        let failed_then_processed = ImportRecord::pending(1, Default::default())
            .into_valid(Default::default(), vec![])
            .into_processed(1);
        store
            .save_processed_record("job-1", &batch_id, &failed_then_processed)
            .await
            .unwrap();

        let processed_records = store.get_processed_records("job-1").await.unwrap();
        assert_eq!(processed_records.len(), 2);
        assert!(store.get_failed_records("job-1").await.unwrap().is_empty());

        let progress = store.get_progress("job-1").await.unwrap();
        assert_eq!(progress.processed_records, 2);
        assert_eq!(progress.failed_records, 0);
        assert_eq!(progress.total_records, 3);
        assert_eq!(progress.current_batch, 1);
        assert_eq!(progress.percentage, 67);
    }

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        exercise_store(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path()).unwrap();
        exercise_store(&store).await;

        // The layout is two documents per job.
        assert!(dir.path().join("job-1.job.json").exists());
        assert!(dir.path().join("job-1.records.json").exists());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state("job-2");
        {
            let store = JsonFileStateStore::new(dir.path()).unwrap();
            store.save_job_state(&state).await.unwrap();
            let record = ImportRecord::pending(0, Default::default())
                .into_valid(Default::default(), vec![])
                .into_processed(0);
            store
                .save_processed_record("job-2", "batch", &record)
                .await
                .unwrap();
        }

        let reopened = JsonFileStateStore::new(dir.path()).unwrap();
        let loaded = reopened.get_job_state("job-2").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            reopened.get_processed_records("job-2").await.unwrap().len(),
            1
        );
    }
}
