//! Chunk-limited driver
//!
//! Hosts with bounded execution windows (serverless functions, cron ticks)
//! process a slice of the source per call: up to `max_records`, up to
//! `max_batches`, or until `max_duration_ms` elapses. The engine keeps a
//! live cursor (source stream, parser, splitter) across calls, so each
//! call picks up exactly where the previous one stopped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::pipeline::{RecordFeed, RecordPipeline};
use crate::splitter::BatchSplitter;

/// Quotas for one `process_chunk` call; absent limits do not bind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkOptions {
    pub max_records: Option<u64>,
    pub max_batches: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

/// Outcome of one `process_chunk` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    /// Records processed successfully during this call
    pub processed_records: u64,
    /// Records failed or invalid during this call
    pub failed_records: u64,
    /// True when the source is exhausted and nothing is buffered
    pub done: bool,
}

/// Live position in the source, held by the engine between calls
pub(crate) struct ChunkCursor {
    pub feed: RecordFeed,
    pub splitter: BatchSplitter,
}

impl ChunkCursor {
    pub fn new(feed: RecordFeed, batch_size: usize) -> Result<Self> {
        Ok(Self {
            feed,
            splitter: BatchSplitter::new(batch_size, 0)?,
        })
    }

    pub fn is_drained(&self) -> bool {
        self.feed.is_drained() && self.splitter.buffered() == 0
    }
}

/// Drive the cursor until a quota trips, the source drains, cancellation
/// fires, or a fatal record error escalates
///
/// Returns the per-call record deltas; job status transitions and events
/// belong to the engine wrapper.
pub(crate) async fn run_chunk(
    pipeline: &Arc<RecordPipeline>,
    cursor: &mut ChunkCursor,
    options: &ChunkOptions,
) -> Result<ChunkResult> {
    let started = Instant::now();
    let deadline = options.max_duration_ms.map(Duration::from_millis);
    let batch_size = pipeline.context.config().batch_size as u64;
    let completed = pipeline.context.completed_batch_indices();
    let cancel = pipeline.context.cancel_token();

    let before = pipeline.context.progress();
    let mut records_taken = 0u64;
    let mut batches_run = 0u64;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            debug!("chunk duration quota reached");
            break;
        }
        if options.max_batches.is_some_and(|limit| batches_run >= limit) {
            debug!("chunk batch quota reached");
            break;
        }
        let record_budget = match options.max_records {
            Some(limit) => {
                if records_taken >= limit {
                    debug!("chunk record quota reached");
                    break;
                }
                limit - records_taken
            }
            None => u64::MAX,
        };

        // Cap the fill so a record quota is never overshot.
        let target = batch_size.min(record_budget) as usize;
        let mut batch = None;
        while batch.is_none() && cursor.splitter.buffered() < target {
            match cursor.feed.next_record().await? {
                Some(record) => {
                    pipeline.context.observe_record_index(record.index);
                    batch = cursor.splitter.push(record);
                }
                None => break,
            }
        }
        if batch.is_none() && cursor.splitter.buffered() >= target {
            batch = cursor.splitter.flush();
        }
        if batch.is_none() && cursor.feed.is_drained() {
            batch = cursor.splitter.flush();
        }

        let Some((index, records)) = batch else {
            break;
        };
        records_taken += records.len() as u64;

        if completed.contains(&index) {
            debug!(batch_index = index, "skipping already-completed batch");
            continue;
        }
        pipeline.run_batch(index, records).await?;
        batches_run += 1;
    }

    let after = pipeline.context.progress();
    Ok(ChunkResult {
        processed_records: after
            .processed_records
            .saturating_sub(before.processed_records),
        failed_records: after.failed_records.saturating_sub(before.failed_records),
        done: cursor.is_drained(),
    })
}
