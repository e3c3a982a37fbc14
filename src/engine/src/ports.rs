//! External collaborator ports
//!
//! The engine consumes data through two ports (`DataSource`, `SourceParser`)
//! and hands work out through three more (`RecordProcessor`,
//! `DuplicateChecker`, `ImportHooks`). Concrete adapters (file and network
//! sources, CSV/JSON parsers, database-backed checkers) live outside the
//! engine; everything here is a trait seam.
//!
//! User-supplied code (processor, hooks, checker) reports failure through
//! `anyhow::Result`; the engine captures the rendered message into
//! record-level state and never lets it escape as a driver error unless
//! `continue_on_error` is disabled.

use std::future::Future;

use async_trait::async_trait;
use bulkflow_shared::{ImportRecord, RawRecord};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A chunk of bytes or text yielded by a data source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChunk {
    Text(String),
    Bytes(Vec<u8>),
}

impl SourceChunk {
    /// Length of the chunk in bytes
    pub fn len(&self) -> usize {
        match self {
            SourceChunk::Text(s) => s.len(),
            SourceChunk::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the chunk as text, lossily for byte chunks
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            SourceChunk::Text(s) => std::borrow::Cow::Borrowed(s),
            SourceChunk::Bytes(b) => String::from_utf8_lossy(b),
        }
    }
}

/// Descriptive metadata a source knows about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
}

/// Format hints a parser can derive from a sample chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatHints {
    pub delimiter: Option<char>,
    pub encoding: Option<String>,
    pub has_header: Option<bool>,
}

/// Lazy chunk sequence produced by [`DataSource::read`]
pub type SourceStream = BoxStream<'static, Result<SourceChunk>>;

/// A streaming byte/text source
///
/// `read` opens a fresh pass over the data; sources that cannot be re-read
/// may return an error on the second call.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Open a lazy sequence of chunks
    async fn read(&mut self) -> Result<SourceStream>;

    /// Read a bounded sample for format detection
    async fn sample(&mut self, max_bytes: Option<usize>) -> Result<SourceChunk>;

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata::default()
    }
}

/// A format parser turning chunks into raw records
#[async_trait]
pub trait SourceParser: Send + Sync {
    /// Parse one chunk into zero or more raw records
    ///
    /// Parsers buffer partial trailing records internally across calls.
    async fn parse(&mut self, chunk: SourceChunk) -> Result<Vec<RawRecord>>;

    /// Flush any buffered partial record at end of stream
    async fn finish(&mut self) -> Result<Vec<RawRecord>> {
        Ok(Vec::new())
    }

    /// Inspect a sample chunk for format hints
    fn detect(&self, _sample: &SourceChunk) -> Option<FormatHints> {
        None
    }
}

/// Per-record context handed to processors, hooks, and checkers
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub job_id: String,
    pub batch_id: String,
    pub batch_index: u64,
    pub record_index: u64,
    pub total_records: u64,
    /// Signalled on abort; cooperative user code should observe it
    pub cancellation: CancellationToken,
}

/// User-supplied record processor
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, parsed: &RawRecord, ctx: &RecordContext) -> anyhow::Result<()>;
}

/// Wrap an async closure as a [`RecordProcessor`]
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(RawRecord, RecordContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnProcessor { f }
}

/// Closure-backed processor returned by [`processor_fn`]
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RecordProcessor for FnProcessor<F>
where
    F: Fn(RawRecord, RecordContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, parsed: &RawRecord, ctx: &RecordContext) -> anyhow::Result<()> {
        (self.f)(parsed.clone(), ctx.clone()).await
    }
}

/// Result of an external duplicate lookup
#[derive(Debug, Clone, Default)]
pub struct DuplicateCheckOutcome {
    pub is_duplicate: bool,
    pub existing_id: Option<String>,
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl DuplicateCheckOutcome {
    pub fn unique() -> Self {
        Self::default()
    }

    pub fn duplicate_of(existing_id: impl Into<String>) -> Self {
        Self {
            is_duplicate: true,
            existing_id: Some(existing_id.into()),
            metadata: None,
        }
    }
}

/// External duplicate detection, e.g. against an already-populated database
#[async_trait]
pub trait DuplicateChecker: Send + Sync {
    async fn check(
        &self,
        fields: &RawRecord,
        ctx: &RecordContext,
    ) -> anyhow::Result<DuplicateCheckOutcome>;

    /// Check many records at once, results in input order
    async fn check_batch(
        &self,
        records: &[RawRecord],
        ctx: &RecordContext,
    ) -> anyhow::Result<Vec<DuplicateCheckOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.check(record, ctx).await?);
        }
        Ok(outcomes)
    }
}

/// Interception points around validation and processing
///
/// Every hook defaults to pass-through. A hook error is captured and coerced
/// to a record-level failure; it never aborts the job while
/// `continue_on_error` holds.
#[async_trait]
pub trait ImportHooks: Send + Sync {
    async fn before_validate(
        &self,
        raw: RawRecord,
        _ctx: &RecordContext,
    ) -> anyhow::Result<RawRecord> {
        Ok(raw)
    }

    async fn after_validate(
        &self,
        record: ImportRecord,
        _ctx: &RecordContext,
    ) -> anyhow::Result<ImportRecord> {
        Ok(record)
    }

    async fn before_process(
        &self,
        parsed: RawRecord,
        _ctx: &RecordContext,
    ) -> anyhow::Result<RawRecord> {
        Ok(parsed)
    }

    async fn after_process(
        &self,
        _record: &ImportRecord,
        _ctx: &RecordContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn processor_fn_wraps_closures() {
        let processor = processor_fn(|parsed: RawRecord, _ctx| async move {
            anyhow::ensure!(parsed.contains_key("id"), "missing id");
            Ok(())
        });

        let ctx = RecordContext {
            job_id: "job".into(),
            batch_id: "batch".into(),
            batch_index: 0,
            record_index: 0,
            total_records: 1,
            cancellation: CancellationToken::new(),
        };

        let mut record = RawRecord::new();
        record.insert("id".into(), json!(1));
        assert!(processor.process(&record, &ctx).await.is_ok());
        assert!(processor.process(&RawRecord::new(), &ctx).await.is_err());
    }

    #[test]
    fn chunk_text_view() {
        let chunk = SourceChunk::Bytes(b"a,b".to_vec());
        assert_eq!(chunk.as_text(), "a,b");
        assert_eq!(chunk.len(), 3);
    }
}
