//! The public ingestion engine
//!
//! `IngestionEngine` wires the job context, event bus, validator, stores,
//! and drivers into one handle. It is cheaply clonable; every clone shares
//! the same job, so `pause`/`resume`/`abort` issued from one clone steer a
//! `start` running on another.

use std::sync::Arc;

use bulkflow_shared::{
    ClaimOutcome, EngineEvent, EngineStatus, EventKind, ImportBatch, ImportConfig, ImportRecord,
    ImportSummary, JobStatus,
};
use bulkflow_shared::{BatchStatus, DistributedJobStatus};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chunked::{run_chunk, ChunkCursor, ChunkOptions, ChunkResult};
use crate::context::JobContext;
use crate::distributed::DistributedStateStore;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, HandlerId};
use crate::pipeline::{run_streaming_job, RecordFeed, RecordPipeline};
use crate::ports::{
    DataSource, DuplicateChecker, ImportHooks, RecordContext, RecordProcessor, SourceParser,
};
use crate::preview::{run_preview, PreviewResult};
use crate::retry::RetryController;
use crate::schema::{ImportSchema, SchemaValidator};
use crate::splitter::BatchSplitter;
use crate::store::{BatchStateUpdate, InMemoryStateStore, StateStore};

/// Sample size used when `preview` is called without an explicit bound
pub const DEFAULT_PREVIEW_RECORDS: u64 = 10;

/// Builder for [`IngestionEngine`]
pub struct IngestionEngineBuilder {
    config: ImportConfig,
    job_id: Option<String>,
    schema: Option<ImportSchema>,
    store: Option<Arc<dyn StateStore>>,
    distributed_store: Option<Arc<dyn DistributedStateStore>>,
    hooks: Option<Arc<dyn ImportHooks>>,
    duplicate_checker: Option<Arc<dyn DuplicateChecker>>,
    source: Option<Box<dyn DataSource>>,
    parser: Option<Box<dyn SourceParser>>,
}

impl IngestionEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: ImportConfig::default(),
            job_id: None,
            schema: None,
            store: None,
            distributed_store: None,
            hooks: None,
            duplicate_checker: None,
            source: None,
            parser: None,
        }
    }

    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_schema(mut self, schema: ImportSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a distributed store for both persistence and the claim protocol
    pub fn with_distributed_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: DistributedStateStore + 'static,
    {
        self.store = Some(store.clone());
        self.distributed_store = Some(store);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ImportHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_duplicate_checker(mut self, checker: Arc<dyn DuplicateChecker>) -> Self {
        self.duplicate_checker = Some(checker);
        self
    }

    /// Attach the data source and its parser
    pub fn with_source(mut self, source: Box<dyn DataSource>, parser: Box<dyn SourceParser>) -> Self {
        self.source = Some(source);
        self.parser = Some(parser);
        self
    }

    /// Build a fresh engine around a new job
    pub fn build(self) -> Result<IngestionEngine> {
        self.config
            .validate()
            .map_err(EngineError::configuration)?;
        let context = Arc::new(JobContext::new(self.job_id, self.config));
        Ok(IngestionEngine::assemble(
            context,
            self.schema,
            self.store,
            self.distributed_store,
            self.hooks,
            self.duplicate_checker,
            self.source,
            self.parser,
        ))
    }

    /// Re-hydrate an engine from persisted state
    ///
    /// Returns `Ok(None)` when the store has no job under `job_id`. The
    /// persisted config snapshot wins over the builder's config; schema,
    /// hooks, source, and parser are taken from the builder since they
    /// cannot be persisted.
    pub async fn restore(self, job_id: &str) -> Result<Option<IngestionEngine>> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| EngineError::configuration("restore requires a state store"))?;
        let Some(state) = store.get_job_state(job_id).await? else {
            return Ok(None);
        };
        let progress = store.get_progress(job_id).await?;
        info!(
            job_id,
            processed = progress.processed_records,
            failed = progress.failed_records,
            "restoring job from persisted state"
        );
        let context = Arc::new(JobContext::from_state(
            state,
            progress.processed_records,
            progress.failed_records,
        ));
        Ok(IngestionEngine::assemble(
            context,
            self.schema,
            self.store,
            self.distributed_store,
            self.hooks,
            self.duplicate_checker,
            self.source,
            self.parser,
        ))
        .map(Some)
    }
}

impl Default for IngestionEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch ingestion engine for one job
#[derive(Clone)]
pub struct IngestionEngine {
    context: Arc<JobContext>,
    events: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    distributed_store: Option<Arc<dyn DistributedStateStore>>,
    validator: Option<Arc<SchemaValidator>>,
    hooks: Option<Arc<dyn ImportHooks>>,
    duplicate_checker: Option<Arc<dyn DuplicateChecker>>,
    source: Arc<Mutex<Option<Box<dyn DataSource>>>>,
    parser: Arc<Mutex<Option<Box<dyn SourceParser>>>>,
    cursor: Arc<Mutex<Option<ChunkCursor>>>,
}

impl IngestionEngine {
    /// Start building an engine
    pub fn builder() -> IngestionEngineBuilder {
        IngestionEngineBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        context: Arc<JobContext>,
        schema: Option<ImportSchema>,
        store: Option<Arc<dyn StateStore>>,
        distributed_store: Option<Arc<dyn DistributedStateStore>>,
        hooks: Option<Arc<dyn ImportHooks>>,
        duplicate_checker: Option<Arc<dyn DuplicateChecker>>,
        source: Option<Box<dyn DataSource>>,
        parser: Option<Box<dyn SourceParser>>,
    ) -> Self {
        Self {
            context,
            events: Arc::new(EventBus::new()),
            store: store.unwrap_or_else(|| Arc::new(InMemoryStateStore::new())),
            distributed_store,
            validator: schema.map(|s| Arc::new(SchemaValidator::new(s))),
            hooks,
            duplicate_checker,
            source: Arc::new(Mutex::new(source)),
            parser: Arc::new(Mutex::new(parser)),
            cursor: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach (or replace) the data source and parser
    pub async fn from(&self, source: Box<dyn DataSource>, parser: Box<dyn SourceParser>) {
        *self.source.lock().await = Some(source);
        *self.parser.lock().await = Some(parser);
        *self.cursor.lock().await = None;
    }

    pub fn job_id(&self) -> String {
        self.context.job_id().to_string()
    }

    /// Subscribe to one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    /// Subscribe to every event
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.on_any(handler)
    }

    pub fn off(&self, id: HandlerId) {
        self.events.off(id);
    }

    pub fn off_any(&self, id: HandlerId) {
        self.events.off_any(id);
    }

    /// Current status, derived progress, and batch list
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            status: self.context.status(),
            progress: self.context.progress(),
            batches: self.context.batches(),
        }
    }

    /// Records whose terminal status is failed or invalid
    pub async fn failed_records(&self) -> Result<Vec<ImportRecord>> {
        self.store.get_failed_records(self.context.job_id()).await
    }

    /// Validate a bounded sample without processing or state mutation
    pub async fn preview(&self, max_records: u64) -> Result<PreviewResult> {
        let status = self.context.status();
        if status != JobStatus::Created {
            return Err(EngineError::invalid_transition(
                status,
                JobStatus::Previewing,
            ));
        }
        self.context.transition(JobStatus::Previewing)?;

        let result = async {
            let mut feed = self.open_feed().await?;
            let outcome =
                run_preview(&mut feed, self.validator.as_deref(), max_records).await;
            self.return_parser(feed).await;
            outcome
        }
        .await;

        match result {
            Ok(preview) => {
                self.context.transition(JobStatus::Previewed)?;
                debug!(
                    sampled = preview.total_sampled,
                    valid = preview.valid_records.len(),
                    invalid = preview.invalid_records.len(),
                    "preview finished"
                );
                Ok(preview)
            }
            Err(error) => {
                let _ = self.context.transition(JobStatus::Failed);
                Err(error)
            }
        }
    }

    /// Count the records the source yields, without processing them
    ///
    /// Whether a source can be re-read afterwards is the source's own
    /// capability; the engine just streams and counts.
    pub async fn count(&self) -> Result<u64> {
        let mut feed = self.open_feed().await?;
        let mut total = 0u64;
        let outcome = async {
            while feed.next_record().await?.is_some() {
                total += 1;
            }
            Ok(total)
        }
        .await;
        self.return_parser(feed).await;
        outcome
    }

    /// Run the job to completion (or pause/abort/failure)
    ///
    /// Configuration and lifecycle errors return `Err` without touching job
    /// state. Once the pipeline is running, every outcome (completed,
    /// aborted, failed) returns `Ok` with the final summary; failures are
    /// observable through `job:failed` and `status()`.
    pub async fn start(&self, processor: Arc<dyn RecordProcessor>) -> Result<ImportSummary> {
        let status = self.context.status();
        if !matches!(status, JobStatus::Created | JobStatus::Previewed) {
            return Err(EngineError::invalid_transition(
                status,
                JobStatus::Processing,
            ));
        }
        let mut feed = self.open_feed().await?;

        self.context.reset_for_start();
        self.context.transition(JobStatus::Processing)?;
        info!(job_id = self.context.job_id(), "job started");
        self.events.emit(EngineEvent::JobStarted {
            job_id: self.job_id(),
            timestamp: Utc::now(),
        });

        let pipeline = self.build_pipeline(processor);
        let run = async {
            self.store.save_job_state(&self.context.snapshot()).await?;
            run_streaming_job(pipeline, &mut feed).await
        }
        .await;
        self.return_parser(feed).await;

        match run {
            Ok(()) => {
                // A pause that landed after the last record must be resumed
                // or aborted before the job can complete.
                self.context.pause_gate().wait_ready().await;
                if self.context.is_cancelled() {
                    return Ok(self.context.summary());
                }
                self.context.transition(JobStatus::Completed)?;
                let summary = self.context.summary();
                info!(
                    job_id = self.context.job_id(),
                    processed = summary.processed_records,
                    failed = summary.failed_records,
                    "job completed"
                );
                self.events.emit(EngineEvent::JobCompleted {
                    job_id: self.job_id(),
                    timestamp: Utc::now(),
                    summary: summary.clone(),
                });
                self.store.save_job_state(&self.context.snapshot()).await?;
                Ok(summary)
            }
            Err(error) => {
                self.fail_job(error.to_string()).await;
                Ok(self.context.summary())
            }
        }
    }

    /// Process up to the given quotas, then return control to the host
    pub async fn process_chunk(
        &self,
        processor: Arc<dyn RecordProcessor>,
        options: ChunkOptions,
    ) -> Result<ChunkResult> {
        match self.context.status() {
            JobStatus::Created | JobStatus::Previewed => {
                // First call: open the cursor and start the job.
                let feed = self.open_feed().await?;
                let cursor = ChunkCursor::new(feed, self.context.config().batch_size)?;
                *self.cursor.lock().await = Some(cursor);

                self.context.reset_for_start();
                self.context.transition(JobStatus::Processing)?;
                self.events.emit(EngineEvent::JobStarted {
                    job_id: self.job_id(),
                    timestamp: Utc::now(),
                });
                self.store.save_job_state(&self.context.snapshot()).await?;
            }
            JobStatus::Paused => {
                self.context.transition(JobStatus::Processing)?;
                self.context.pause_gate().release();
            }
            other => {
                return Err(EngineError::invalid_transition(
                    other,
                    JobStatus::Processing,
                ));
            }
        }

        let mut cursor_slot = self.cursor.lock().await;
        let cursor = cursor_slot
            .as_mut()
            .ok_or_else(|| EngineError::configuration("chunk cursor lost; re-attach the source"))?;

        let pipeline = self.build_pipeline(processor);
        let tick = run_chunk(&pipeline, cursor, &options).await;

        let result = match tick {
            Ok(result) => result,
            Err(error) => {
                let partial = ChunkResult {
                    processed_records: 0,
                    failed_records: 0,
                    done: false,
                };
                drop(cursor_slot);
                self.fail_job(error.to_string()).await;
                return Ok(partial);
            }
        };

        if self.context.is_cancelled() {
            return Ok(result);
        }

        if result.done {
            *cursor_slot = None;
            drop(cursor_slot);
            self.context.transition(JobStatus::Completed)?;
            let summary = self.context.summary();
            self.events.emit(EngineEvent::JobCompleted {
                job_id: self.job_id(),
                timestamp: Utc::now(),
                summary,
            });
        } else {
            drop(cursor_slot);
            if self.context.status() == JobStatus::Processing {
                self.context.transition(JobStatus::Paused)?;
            }
        }
        self.store.save_job_state(&self.context.snapshot()).await?;

        self.events.emit(EngineEvent::ChunkCompleted {
            job_id: self.job_id(),
            timestamp: Utc::now(),
            processed_records: result.processed_records,
            failed_records: result.failed_records,
            done: result.done,
        });
        Ok(result)
    }

    /// Pause the job; valid only while processing
    pub async fn pause(&self) -> Result<()> {
        self.context.transition(JobStatus::Paused)?;
        self.context.pause_gate().engage();
        info!(job_id = self.context.job_id(), "job paused");
        self.events.emit(EngineEvent::JobPaused {
            job_id: self.job_id(),
            timestamp: Utc::now(),
            progress: self.context.progress(),
        });
        self.store.save_job_state(&self.context.snapshot()).await?;
        Ok(())
    }

    /// Resume a paused job; rejected from any other status
    pub fn resume(&self) -> Result<()> {
        self.context.transition(JobStatus::Processing)?;
        self.context.pause_gate().release();
        info!(job_id = self.context.job_id(), "job resumed");
        Ok(())
    }

    /// Abort the job; in-flight record work finishes, then the pipeline
    /// exits at its next suspension point
    pub async fn abort(&self) -> Result<()> {
        let status = self.context.status();
        if !matches!(status, JobStatus::Processing | JobStatus::Paused) {
            return Err(EngineError::invalid_transition(status, JobStatus::Aborted));
        }
        self.context.transition(JobStatus::Aborted)?;
        self.context.cancel_token().cancel();
        self.context.pause_gate().release();
        info!(job_id = self.context.job_id(), "job aborted");
        self.events.emit(EngineEvent::JobAborted {
            job_id: self.job_id(),
            timestamp: Utc::now(),
            progress: self.context.progress(),
        });
        self.store.save_job_state(&self.context.snapshot()).await?;
        Ok(())
    }

    // --- distributed operations -----------------------------------------

    /// Materialize every record and batch up front for multi-worker pickup
    pub async fn prepare_distributed(&self) -> Result<DistributedJobStatus> {
        let store = self.require_distributed()?;
        let status = self.context.status();
        if !matches!(status, JobStatus::Created | JobStatus::Previewed) {
            return Err(EngineError::invalid_transition(
                status,
                JobStatus::Processing,
            ));
        }
        let mut feed = self.open_feed().await?;

        self.context.reset_for_start();
        self.context.mark_distributed();
        self.context.transition(JobStatus::Processing)?;

        let mut splitter = BatchSplitter::new(self.context.config().batch_size, 0)?;
        let mut staged: Vec<(ImportBatch, Vec<ImportRecord>)> = Vec::new();
        let fill: Result<()> = async {
            while let Some(record) = feed.next_record().await? {
                self.context.observe_record_index(record.index);
                if let Some((index, records)) = splitter.push(record) {
                    staged.push(stage_batch(index, records));
                }
            }
            if let Some((index, records)) = splitter.flush() {
                staged.push(stage_batch(index, records));
            }
            Ok(())
        }
        .await;
        self.return_parser(feed).await;
        fill?;

        let total_batches = staged.len() as u64;
        for (batch, _) in &staged {
            self.context.begin_batch(batch.clone());
        }
        self.store.save_job_state(&self.context.snapshot()).await?;
        for (batch, records) in &staged {
            store
                .save_batch_records(self.context.job_id(), &batch.id, records)
                .await?;
        }

        let total_records = self.context.total_records();
        info!(
            job_id = self.context.job_id(),
            total_records, total_batches, "distributed job prepared"
        );
        self.events.emit(EngineEvent::DistributedPrepared {
            job_id: self.job_id(),
            timestamp: Utc::now(),
            total_records,
            total_batches,
        });
        store.get_distributed_status(self.context.job_id()).await
    }

    /// Claim one pending batch and process it as `worker_id`
    ///
    /// Returns the claim outcome; a denial with `NoPendingBatches` is the
    /// worker's signal to poll `distributed_status` or back off.
    pub async fn process_claimed_batch(
        &self,
        worker_id: &str,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<ClaimOutcome> {
        let store = self.require_distributed()?;
        let job_id = self.context.job_id().to_string();

        let outcome = store.claim_batch(&job_id, worker_id).await?;
        let reservation = match &outcome {
            ClaimOutcome::Claimed { reservation } => reservation.clone(),
            ClaimOutcome::Denied { .. } => return Ok(outcome),
        };

        self.events.emit(EngineEvent::BatchClaimed {
            job_id: job_id.clone(),
            timestamp: Utc::now(),
            worker_id: worker_id.to_string(),
            batch_id: reservation.batch_id.clone(),
            batch_index: reservation.batch_index,
        });

        let records = store
            .get_batch_records(&job_id, &reservation.batch_id)
            .await?;
        let record_total = records.len() as u64;
        let total_records = store
            .get_job_state(&job_id)
            .await?
            .map(|state| state.total_records)
            .unwrap_or(records.len() as u64);

        // Local mirror so per-record accounting has a batch to land in.
        let mut mirror = ImportBatch::new(reservation.batch_index, Vec::new());
        mirror.id = reservation.batch_id.clone();
        mirror.status = BatchStatus::Processing;
        mirror.worker_id = Some(worker_id.to_string());
        mirror.claimed_at = Some(reservation.claimed_at);
        self.context.begin_batch(mirror);

        let pipeline = self.build_pipeline(processor);
        let cancel = self.context.cancel_token();
        let mut interrupted = false;

        for record in records {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let ctx = RecordContext {
                job_id: job_id.clone(),
                batch_id: reservation.batch_id.clone(),
                batch_index: reservation.batch_index,
                record_index: record.index,
                total_records,
                cancellation: cancel.clone(),
            };
            match pipeline.process_record(record, &ctx).await {
                Ok(crate::pipeline::RecordFate::Cancelled) => {
                    interrupted = true;
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        batch_index = reservation.batch_index,
                        "claimed batch failed: {error}"
                    );
                    let (processed, failed) = self.mirror_counts(&reservation.batch_id);
                    store
                        .update_batch_state(
                            &job_id,
                            &reservation.batch_id,
                            BatchStateUpdate {
                                status: BatchStatus::Failed,
                                processed_count: processed,
                                failed_count: failed,
                            },
                        )
                        .await?;
                    self.events.emit(EngineEvent::BatchFailed {
                        job_id: job_id.clone(),
                        timestamp: Utc::now(),
                        batch_id: reservation.batch_id.clone(),
                        batch_index: reservation.batch_index,
                        error: error.to_string(),
                    });
                    self.try_finalize(store.as_ref(), &job_id).await?;
                    return Err(error);
                }
            }
        }

        if interrupted {
            // Hand the batch back so another worker can pick it up.
            store
                .release_batch(&job_id, &reservation.batch_id, worker_id)
                .await?;
            return Ok(outcome);
        }

        let (processed, failed, _) = self
            .context
            .complete_batch(&reservation.batch_id)
            .unwrap_or((0, 0, 0));
        store
            .update_batch_state(
                &job_id,
                &reservation.batch_id,
                BatchStateUpdate {
                    status: BatchStatus::Completed,
                    processed_count: processed,
                    failed_count: failed,
                },
            )
            .await?;
        self.events.emit(EngineEvent::BatchCompleted {
            job_id: job_id.clone(),
            timestamp: Utc::now(),
            batch_id: reservation.batch_id.clone(),
            batch_index: reservation.batch_index,
            processed_count: processed,
            failed_count: failed,
            total_count: record_total,
        });

        self.try_finalize(store.as_ref(), &job_id).await?;
        Ok(outcome)
    }

    /// Return stale claims to the pending pool
    pub async fn reclaim_stale(&self, timeout_ms: u64) -> Result<u64> {
        let store = self.require_distributed()?;
        store
            .reclaim_stale_batches(self.context.job_id(), timeout_ms)
            .await
    }

    /// Aggregate batch accounting for the distributed job
    pub async fn distributed_status(&self) -> Result<DistributedJobStatus> {
        let store = self.require_distributed()?;
        store.get_distributed_status(self.context.job_id()).await
    }

    // --- internals -------------------------------------------------------

    fn build_pipeline(&self, processor: Arc<dyn RecordProcessor>) -> Arc<RecordPipeline> {
        let config = self.context.config();
        Arc::new(RecordPipeline {
            context: self.context.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            validator: self.validator.clone(),
            hooks: self.hooks.clone(),
            duplicate_checker: self.duplicate_checker.clone(),
            processor,
            retry: RetryController::new(config.max_retries, config.retry_delay_ms),
        })
    }

    async fn open_feed(&self) -> Result<RecordFeed> {
        let mut source_slot = self.source.lock().await;
        let source = source_slot
            .as_mut()
            .ok_or_else(|| EngineError::configuration("no data source configured"))?;
        let stream = source.read().await?;
        drop(source_slot);

        let parser = self
            .parser
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::configuration("no source parser configured"))?;
        Ok(RecordFeed::new(stream, parser))
    }

    async fn return_parser(&self, feed: RecordFeed) {
        *self.parser.lock().await = Some(feed.into_parser());
    }

    fn require_distributed(&self) -> Result<Arc<dyn DistributedStateStore>> {
        self.distributed_store
            .clone()
            .ok_or_else(|| EngineError::configuration("no distributed state store configured"))
    }

    fn mirror_counts(&self, batch_id: &str) -> (u64, u64) {
        self.context
            .batches()
            .into_iter()
            .find(|b| b.id == batch_id)
            .map(|b| (b.processed_count, b.failed_count))
            .unwrap_or((0, 0))
    }

    /// Fatal path: transition to Failed, emit `job:failed`, persist
    async fn fail_job(&self, message: String) {
        warn!(job_id = self.context.job_id(), "job failed: {message}");
        match self.context.status() {
            JobStatus::Processing => {
                let _ = self.context.transition(JobStatus::Failed);
            }
            JobStatus::Paused => {
                self.context.pause_gate().release();
                let _ = self.context.transition(JobStatus::Processing);
                let _ = self.context.transition(JobStatus::Failed);
            }
            _ => {}
        }
        self.events.emit(EngineEvent::JobFailed {
            job_id: self.job_id(),
            timestamp: Utc::now(),
            error: message,
        });
        if let Err(store_error) = self.store.save_job_state(&self.context.snapshot()).await {
            warn!("failed to persist failed job state: {store_error}");
        }
    }

    /// Run the finalize election; the single winner closes the job
    async fn try_finalize(
        &self,
        store: &dyn DistributedStateStore,
        job_id: &str,
    ) -> Result<()> {
        if !store.try_finalize_job(job_id).await? {
            return Ok(());
        }
        let Some(mut state) = store.get_job_state(job_id).await? else {
            return Ok(());
        };
        state.status = JobStatus::Completed;
        state.completed_at = Some(Utc::now());
        store.save_job_state(&state).await?;

        let progress = store.get_progress(job_id).await?;
        let summary = ImportSummary {
            total_records: progress.total_records,
            processed_records: progress.processed_records,
            failed_records: progress.failed_records,
            skipped: progress.pending_records,
            elapsed_ms: progress.elapsed_ms,
        };
        info!(job_id, "distributed job finalized");
        self.events.emit(EngineEvent::JobCompleted {
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            summary,
        });
        Ok(())
    }
}

/// Keep the record range on the batch shell while the records themselves go
/// to the store's bulk API
fn stage_batch(index: u64, records: Vec<ImportRecord>) -> (ImportBatch, Vec<ImportRecord>) {
    let mut batch = ImportBatch::new(index, records);
    let records = std::mem::take(&mut batch.records);
    (batch, records)
}
