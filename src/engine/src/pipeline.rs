//! The streaming pipeline: per-record processing, batch lifecycle, and the
//! sequential and bounded-parallel drivers
//!
//! Data flows source → parser → pending record → alias/transform →
//! validation → uniqueness → hooks → processor → state store + events.
//! Control (pause, abort) enters through the job context; backpressure in
//! the parallel driver comes from a semaphore sized to
//! `max_concurrent_batches`.

use std::collections::VecDeque;
use std::sync::Arc;

use bulkflow_shared::{
    BatchStatus, EngineEvent, ErrorCode, ImportBatch, ImportRecord, RawRecord, RecordStatus,
    ValidationError,
};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::context::JobContext;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::ports::{
    DuplicateChecker, ImportHooks, RecordContext, RecordProcessor, SourceParser, SourceStream,
};
use crate::retry::{RetryController, RetryOutcome};
use crate::schema::SchemaValidator;
use crate::splitter::BatchSplitter;
use crate::store::{BatchStateUpdate, StateStore};

/// What happened to one record
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RecordFate {
    Processed,
    Failed,
    Skipped,
    Cancelled,
}

/// Pulls raw records out of the source/parser pair one at a time, wrapping
/// them as pending records with monotonic indices
pub(crate) struct RecordFeed {
    stream: SourceStream,
    parser: Box<dyn SourceParser>,
    pending: VecDeque<RawRecord>,
    next_index: u64,
    exhausted: bool,
}

impl RecordFeed {
    pub fn new(stream: SourceStream, parser: Box<dyn SourceParser>) -> Self {
        Self {
            stream,
            parser,
            pending: VecDeque::new(),
            next_index: 0,
            exhausted: false,
        }
    }

    /// Next record, or `None` once the source and parser are drained
    pub async fn next_record(&mut self) -> Result<Option<ImportRecord>> {
        loop {
            if let Some(raw) = self.pending.pop_front() {
                let record = ImportRecord::pending(self.next_index, raw);
                self.next_index += 1;
                return Ok(Some(record));
            }
            if self.exhausted {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.pending.extend(self.parser.parse(chunk).await?);
                }
                Some(Err(err)) => return Err(err),
                None => {
                    self.exhausted = true;
                    self.pending.extend(self.parser.finish().await?);
                }
            }
        }
    }

    /// Whether the underlying stream has been fully consumed
    pub fn is_drained(&self) -> bool {
        self.exhausted && self.pending.is_empty()
    }

    /// Give the parser back once the run is over
    pub fn into_parser(self) -> Box<dyn SourceParser> {
        self.parser
    }
}

/// Everything the per-record procedure needs, shared across batches
pub(crate) struct RecordPipeline {
    pub context: Arc<JobContext>,
    pub store: Arc<dyn StateStore>,
    pub events: Arc<EventBus>,
    pub validator: Option<Arc<SchemaValidator>>,
    pub hooks: Option<Arc<dyn ImportHooks>>,
    pub duplicate_checker: Option<Arc<dyn DuplicateChecker>>,
    pub processor: Arc<dyn RecordProcessor>,
    pub retry: RetryController,
}

impl RecordPipeline {
    /// Run one batch to completion: entry protocol, records in order, exit
    /// protocol
    ///
    /// Returns `Err` only for escalated record errors
    /// (`continue_on_error = false`) and store failures; the interrupted
    /// batch is left in `Processing` for the caller's fatal handling.
    pub async fn run_batch(&self, batch_index: u64, records: Vec<ImportRecord>) -> Result<()> {
        let mut batch = ImportBatch::new(batch_index, records);
        batch.status = BatchStatus::Processing;
        let batch_id = batch.id.clone();
        let work = batch.records.clone();
        let record_count = work.len() as u64;

        self.context.begin_batch(batch);
        self.store.save_job_state(&self.context.snapshot()).await?;
        self.events.emit(EngineEvent::BatchStarted {
            job_id: self.context.job_id().to_string(),
            timestamp: Utc::now(),
            batch_id: batch_id.clone(),
            batch_index,
            record_count,
        });
        debug!(batch_index, record_count, "batch started");

        let cancel = self.context.cancel_token();
        let mut interrupted = false;
        for record in work {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                _ = self.context.pause_gate().wait_ready() => {}
            }

            let ctx = RecordContext {
                job_id: self.context.job_id().to_string(),
                batch_id: batch_id.clone(),
                batch_index,
                record_index: record.index,
                total_records: self.context.total_records(),
                cancellation: cancel.clone(),
            };
            if self.process_record(record, &ctx).await? == RecordFate::Cancelled {
                interrupted = true;
                break;
            }
        }

        if interrupted {
            // Abort in flight: the batch stays Processing; the job-level
            // abort path owns status and events from here.
            return Ok(());
        }

        if let Some((processed, failed, total)) = self.context.complete_batch(&batch_id) {
            self.store
                .update_batch_state(
                    self.context.job_id(),
                    &batch_id,
                    BatchStateUpdate {
                        status: BatchStatus::Completed,
                        processed_count: processed,
                        failed_count: failed,
                    },
                )
                .await?;
            self.events.emit(EngineEvent::BatchCompleted {
                job_id: self.context.job_id().to_string(),
                timestamp: Utc::now(),
                batch_id: batch_id.clone(),
                batch_index,
                processed_count: processed,
                failed_count: failed,
                total_count: total,
            });
            self.events.emit(EngineEvent::JobProgress {
                job_id: self.context.job_id().to_string(),
                timestamp: Utc::now(),
                progress: self.context.progress(),
            });
            self.store.save_job_state(&self.context.snapshot()).await?;
            debug!(batch_index, processed, failed, "batch completed");
        }
        Ok(())
    }

    /// The per-record procedure: skip → prepare → validate → uniqueness →
    /// hooks → duplicate check → process with retries → persist + events
    pub async fn process_record(
        &self,
        record: ImportRecord,
        ctx: &RecordContext,
    ) -> Result<RecordFate> {
        if let Some(validator) = &self.validator {
            if validator.schema().skip_empty_rows && record.is_empty_row() {
                return Ok(RecordFate::Skipped);
            }
        }

        let mut candidate = match &self.validator {
            Some(validator) => {
                let mut resolved = validator.resolve_aliases(&record.raw);
                if let Some(hooks) = &self.hooks {
                    match hooks.before_validate(resolved, ctx).await {
                        Ok(raw) => resolved = raw,
                        Err(err) => {
                            let invalid = record.into_invalid(vec![ValidationError::new(
                                "record",
                                format!("before_validate hook failed: {err:#}"),
                                ErrorCode::CustomValidation,
                            )]);
                            return self.settle_invalid(invalid, ctx).await;
                        }
                    }
                }
                let prepared = validator.apply_transforms(resolved);
                let outcome = validator.validate(&prepared);
                let mut errors = outcome.errors;
                errors.extend(validator.check_unique(&prepared));

                if errors.iter().any(ValidationError::is_blocking) {
                    record.into_invalid(errors)
                } else {
                    record.into_valid(outcome.parsed, errors)
                }
            }
            None => {
                let parsed = record.raw.clone();
                record.into_valid(parsed, Vec::new())
            }
        };

        if let Some(hooks) = &self.hooks {
            match hooks.after_validate(candidate.clone(), ctx).await {
                Ok(adjusted) => candidate = adjusted,
                Err(err) => {
                    let mut errors = candidate.errors.clone();
                    errors.push(ValidationError::new(
                        "record",
                        format!("after_validate hook failed: {err:#}"),
                        ErrorCode::CustomValidation,
                    ));
                    return self.settle_invalid(candidate.into_invalid(errors), ctx).await;
                }
            }
        }

        let mut still_valid =
            candidate.status == RecordStatus::Valid && !candidate.has_blocking_errors();

        if still_valid {
            if let Some(checker) = &self.duplicate_checker {
                let fields = candidate.parsed.clone().unwrap_or_default();
                match checker.check(&fields, ctx).await {
                    Ok(outcome) if outcome.is_duplicate => {
                        let message = match &outcome.existing_id {
                            Some(id) => format!("Record duplicates existing entry {id}"),
                            None => "Record duplicates an existing entry".to_string(),
                        };
                        let mut errors = candidate.errors.clone();
                        errors.push(ValidationError::new(
                            "record",
                            message,
                            ErrorCode::ExternalDuplicate,
                        ));
                        candidate = candidate.into_invalid(errors);
                        still_valid = false;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let mut errors = candidate.errors.clone();
                        errors.push(ValidationError::new(
                            "record",
                            format!("duplicate check failed: {err:#}"),
                            ErrorCode::ExternalDuplicate,
                        ));
                        candidate = candidate.into_invalid(errors);
                        still_valid = false;
                    }
                }
            }
        }

        if !still_valid {
            return self.settle_invalid(candidate, ctx).await;
        }

        let mut payload = candidate.parsed.clone().unwrap_or_default();
        if let Some(hooks) = &self.hooks {
            match hooks.before_process(payload, ctx).await {
                Ok(adjusted) => payload = adjusted,
                Err(err) => {
                    let failed = candidate
                        .into_failed(format!("before_process hook failed: {err:#}"), 0);
                    return self.settle_processing_failure(failed, ctx).await;
                }
            }
        }

        match self
            .retry
            .execute(&self.processor, &payload, ctx, &self.events, &ctx.cancellation)
            .await
        {
            RetryOutcome::Processed { retry_count } => {
                let processed = candidate.into_processed(retry_count);
                if let Some(hooks) = &self.hooks {
                    if let Err(err) = hooks.after_process(&processed, ctx).await {
                        let failed = processed
                            .into_failed(format!("after_process hook failed: {err:#}"), retry_count);
                        return self.settle_processing_failure(failed, ctx).await;
                    }
                }
                self.store
                    .save_processed_record(self.context.job_id(), &ctx.batch_id, &processed)
                    .await?;
                self.context.record_processed(&ctx.batch_id);
                self.events.emit(EngineEvent::RecordProcessed {
                    job_id: ctx.job_id.clone(),
                    timestamp: Utc::now(),
                    batch_id: ctx.batch_id.clone(),
                    record_index: ctx.record_index,
                });
                Ok(RecordFate::Processed)
            }
            RetryOutcome::Failed { error, retry_count } => {
                let failed = candidate.into_failed(error, retry_count);
                self.settle_processing_failure(failed, ctx).await
            }
            RetryOutcome::Cancelled => Ok(RecordFate::Cancelled),
        }
    }

    /// Persist an invalid record, count it, emit `record:failed`, and
    /// escalate when `continue_on_error` is off
    async fn settle_invalid(
        &self,
        record: ImportRecord,
        ctx: &RecordContext,
    ) -> Result<RecordFate> {
        let message = join_error_messages(&record.errors);
        self.store
            .save_processed_record(self.context.job_id(), &ctx.batch_id, &record)
            .await?;
        self.context.record_failed(&ctx.batch_id);
        self.events.emit(EngineEvent::RecordFailed {
            job_id: ctx.job_id.clone(),
            timestamp: Utc::now(),
            error: message.clone(),
            record,
        });

        if self.context.config().continue_on_error {
            Ok(RecordFate::Failed)
        } else {
            Err(EngineError::ValidationFailed {
                record_index: ctx.record_index,
                message,
            })
        }
    }

    /// Persist a processor-failed record, count it, emit `record:failed`,
    /// and escalate when `continue_on_error` is off
    async fn settle_processing_failure(
        &self,
        record: ImportRecord,
        ctx: &RecordContext,
    ) -> Result<RecordFate> {
        let message = record
            .processing_error
            .clone()
            .unwrap_or_else(|| "processing failed".to_string());
        self.store
            .save_processed_record(self.context.job_id(), &ctx.batch_id, &record)
            .await?;
        self.context.record_failed(&ctx.batch_id);
        self.events.emit(EngineEvent::RecordFailed {
            job_id: ctx.job_id.clone(),
            timestamp: Utc::now(),
            error: message.clone(),
            record,
        });

        if self.context.config().continue_on_error {
            Ok(RecordFate::Failed)
        } else {
            Err(EngineError::Processing {
                record_index: ctx.record_index,
                message,
            })
        }
    }
}

fn join_error_messages(errors: &[ValidationError]) -> String {
    if errors.is_empty() {
        return "validation failed".to_string();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Drive a record feed through the splitter and batch processing until the
/// source drains, cancellation fires, or a fatal error escalates
///
/// Batches whose index is already in the context's completed set are
/// skipped without re-entering them; their records still advance the feed
/// so record indices stay aligned.
pub(crate) async fn run_streaming_job(
    pipeline: Arc<RecordPipeline>,
    feed: &mut RecordFeed,
) -> Result<()> {
    let config = pipeline.context.config().clone();
    let mut splitter = BatchSplitter::new(config.batch_size, 0)?;
    let completed = pipeline.context.completed_batch_indices();
    let cancel = pipeline.context.cancel_token();

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_batches));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let fatal: Arc<parking_lot::Mutex<Option<EngineError>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let parallel = config.max_concurrent_batches > 1;

    let record_fatal = |error: EngineError| {
        let mut slot = fatal.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    };

    'stream: loop {
        if cancel.is_cancelled() || fatal.lock().is_some() {
            break 'stream;
        }
        tokio::select! {
            _ = cancel.cancelled() => break 'stream,
            _ = pipeline.context.pause_gate().wait_ready() => {}
        }

        let record = match feed.next_record().await {
            Ok(Some(record)) => record,
            Ok(None) => break 'stream,
            Err(error) => {
                record_fatal(error);
                break 'stream;
            }
        };
        pipeline.context.observe_record_index(record.index);

        if let Some((index, records)) = splitter.push(record) {
            if let Err(error) = dispatch_batch(
                &pipeline,
                &completed,
                parallel,
                &semaphore,
                &mut in_flight,
                &fatal,
                index,
                records,
            )
            .await
            {
                record_fatal(error);
                break 'stream;
            }
        }
    }

    // Tail batch, unless we're bailing out.
    if !cancel.is_cancelled() && fatal.lock().is_none() {
        if let Some((index, records)) = splitter.flush() {
            if let Err(error) = dispatch_batch(
                &pipeline,
                &completed,
                parallel,
                &semaphore,
                &mut in_flight,
                &fatal,
                index,
                records,
            )
            .await
            {
                record_fatal(error);
            }
        }
    }

    // Await in-flight batches regardless of how the loop ended.
    while let Some(joined) = in_flight.join_next().await {
        if let Err(join_error) = joined {
            warn!("batch task aborted: {join_error}");
            let mut slot = fatal.lock();
            if slot.is_none() {
                *slot = Some(EngineError::store(format!(
                    "batch task aborted: {join_error}"
                )));
            }
        }
    }

    let fatal = fatal.lock().take();
    match fatal {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_batch(
    pipeline: &Arc<RecordPipeline>,
    completed: &std::collections::HashSet<u64>,
    parallel: bool,
    semaphore: &Arc<Semaphore>,
    in_flight: &mut JoinSet<()>,
    fatal: &Arc<parking_lot::Mutex<Option<EngineError>>>,
    index: u64,
    records: Vec<ImportRecord>,
) -> Result<()> {
    if completed.contains(&index) {
        debug!(batch_index = index, "skipping already-completed batch");
        return Ok(());
    }

    if !parallel {
        return pipeline.run_batch(index, records).await;
    }

    // Backpressure: wait for pool capacity before accepting the batch.
    let permit = semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("semaphore is never closed");
    let pipeline = pipeline.clone();
    let fatal = fatal.clone();
    in_flight.spawn(async move {
        let _permit = permit;
        if let Err(error) = pipeline.run_batch(index, records).await {
            let mut slot = fatal.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    struct LineParser;

    #[async_trait::async_trait]
    impl SourceParser for LineParser {
        async fn parse(&mut self, chunk: crate::ports::SourceChunk) -> Result<Vec<RawRecord>> {
            Ok(chunk
                .as_text()
                .lines()
                .filter(|l| !l.is_empty())
                .map(|line| {
                    let mut raw = RawRecord::new();
                    raw.insert("line".into(), json!(line));
                    raw
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn feed_assigns_monotonic_indices_across_chunks() {
        let chunks = vec![
            Ok(crate::ports::SourceChunk::Text("a\nb".into())),
            Ok(crate::ports::SourceChunk::Text("c".into())),
        ];
        let mut feed = RecordFeed::new(stream::iter(chunks).boxed(), Box::new(LineParser));

        let mut indices = Vec::new();
        while let Some(record) = feed.next_record().await.unwrap() {
            indices.push(record.index);
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(feed.is_drained());
    }
}
