//! Integration tests for distributed multi-worker execution: prepare,
//! claim, process, finalize

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;

use bulkflow_engine::{
    processor_fn, DataSource, DistributedStateStore, InMemoryDistributedStore, IngestionEngine,
    RecordProcessor, Result, SourceChunk, SourceParser, SourceStream, StateStore,
};
use bulkflow_shared::{ClaimDenialReason, ClaimOutcome, EngineEvent, EventKind, ImportConfig, JobStatus};

#[tokio::test]
async fn prepare_materializes_batches_and_records() {
    let store = Arc::new(InMemoryDistributedStore::new());
    let engine = engine_with(10, 3, store.clone());
    let log = EventLog::attach(&engine);

    let status = engine.prepare_distributed().await.unwrap();
    assert_eq!(status.total_batches, 4);
    assert_eq!(status.pending, 4);
    assert!(!status.is_complete);

    let state = store
        .get_job_state(&engine.job_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, JobStatus::Processing);
    assert_eq!(state.total_records, 10);
    assert!(state.distributed);
    assert!(state.batches.iter().all(|b| b.records.is_empty()));
    assert_eq!(state.batches[3].record_start_index, Some(9));

    // Records are reachable through the bulk API, in order.
    let records = store
        .get_batch_records(&engine.job_id(), &state.batches[0].id)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].index, 0);

    assert_eq!(log.count(EventKind::DistributedPrepared), 1);
}

#[tokio::test]
async fn workers_drain_the_job_and_exactly_one_finalizes() {
    let store = Arc::new(InMemoryDistributedStore::new());
    let engine = engine_with(10, 3, store.clone());
    let log = EventLog::attach(&engine);
    engine.prepare_distributed().await.unwrap();

    let calls = Arc::new(AtomicU64::new(0));
    let processor = {
        let calls = calls.clone();
        Arc::new(processor_fn(move |_parsed, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })) as Arc<dyn RecordProcessor>
    };

    // Two workers alternate until the queue runs dry.
    let mut claims = 0;
    loop {
        let worker = if claims % 2 == 0 { "worker-a" } else { "worker-b" };
        match engine
            .process_claimed_batch(worker, processor.clone())
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed { .. } => claims += 1,
            ClaimOutcome::Denied { reason } => {
                // The last completion finalizes the job, so the losing
                // worker sees either an empty queue or a closed job.
                assert!(matches!(
                    reason,
                    ClaimDenialReason::NoPendingBatches | ClaimDenialReason::JobNotProcessing
                ));
                break;
            }
        }
    }

    assert_eq!(claims, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 10);

    let status = engine.distributed_status().await.unwrap();
    assert!(status.is_complete);
    assert_eq!(status.completed, 4);

    let state = store
        .get_job_state(&engine.job_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, JobStatus::Completed);

    assert_eq!(log.count(EventKind::BatchClaimed), 4);
    assert_eq!(log.count(EventKind::BatchCompleted), 4);
    assert_eq!(log.count(EventKind::JobCompleted), 1);

    let progress = store.get_progress(&engine.job_id()).await.unwrap();
    assert_eq!(progress.processed_records, 10);
    assert_eq!(progress.percentage, 100);
}

#[tokio::test]
async fn claimed_batch_records_fail_like_single_node_records() {
    let store = Arc::new(InMemoryDistributedStore::new());
    let engine = engine_with(4, 2, store.clone());
    engine.prepare_distributed().await.unwrap();

    let processor = Arc::new(processor_fn(|parsed, _ctx| async move {
        let id = parsed.get("id").and_then(serde_json::Value::as_str);
        anyhow::ensure!(id != Some("1"), "record 1 always fails");
        Ok(())
    })) as Arc<dyn RecordProcessor>;

    while let ClaimOutcome::Claimed { .. } = engine
        .process_claimed_batch("worker-a", processor.clone())
        .await
        .unwrap()
    {}

    let progress = store.get_progress(&engine.job_id()).await.unwrap();
    assert_eq!(progress.processed_records, 3);
    assert_eq!(progress.failed_records, 1);

    let failed = store.get_failed_records(&engine.job_id()).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].index, 1);

    let status = engine.distributed_status().await.unwrap();
    assert!(status.is_complete);
}

#[tokio::test]
async fn distributed_requires_a_distributed_store() {
    let engine = IngestionEngine::builder()
        .with_source(row_source(3), Box::new(RowParser::default()))
        .build()
        .unwrap();
    assert!(engine.prepare_distributed().await.is_err());
    assert!(engine.reclaim_stale(1000).await.is_err());
}

// --- support -------------------------------------------------------------

struct VecSource {
    chunks: Vec<String>,
}

#[async_trait]
impl DataSource for VecSource {
    async fn read(&mut self) -> Result<SourceStream> {
        let chunks: Vec<Result<SourceChunk>> = self
            .chunks
            .iter()
            .cloned()
            .map(|c| Ok(SourceChunk::Text(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn sample(&mut self, _max_bytes: Option<usize>) -> Result<SourceChunk> {
        Ok(SourceChunk::Text(self.chunks.first().cloned().unwrap_or_default()))
    }
}

#[derive(Default)]
struct RowParser {
    buffer: String,
}

#[async_trait]
impl SourceParser for RowParser {
    async fn parse(&mut self, chunk: SourceChunk) -> Result<Vec<bulkflow_shared::RawRecord>> {
        self.buffer.push_str(&chunk.as_text());
        let mut records = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n');
            if line.trim().is_empty() {
                continue;
            }
            let mut raw = bulkflow_shared::RawRecord::new();
            for pair in line.split(',') {
                if let Some((key, value)) = pair.split_once('=') {
                    raw.insert(key.trim().to_string(), json!(value.trim()));
                }
            }
            records.push(raw);
        }
        Ok(records)
    }
}

fn row_source(n: usize) -> Box<dyn DataSource> {
    let chunks = (0..n).map(|i| format!("id={i},name=row-{i}\n")).collect();
    Box::new(VecSource { chunks })
}

fn engine_with(
    rows: usize,
    batch_size: usize,
    store: Arc<InMemoryDistributedStore>,
) -> IngestionEngine {
    IngestionEngine::builder()
        .with_config(ImportConfig {
            batch_size,
            ..ImportConfig::default()
        })
        .with_distributed_store(store)
        .with_source(row_source(rows), Box::new(RowParser::default()))
        .build()
        .unwrap()
}

#[derive(Clone, Default)]
struct EventLog(Arc<parking_lot::Mutex<Vec<EngineEvent>>>);

impl EventLog {
    fn attach(engine: &IngestionEngine) -> Self {
        let log = Self::default();
        let sink = log.clone();
        engine.on_any(move |event| sink.0.lock().push(event.clone()));
        log
    }

    fn count(&self, kind: EventKind) -> usize {
        self.0.lock().iter().filter(|e| e.kind() == kind).count()
    }
}
