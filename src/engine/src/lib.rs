//! # Bulkflow Engine
//!
//! A batch ingestion engine for record-oriented data. The engine consumes a
//! streaming byte source, parses it into records, validates and transforms
//! each record against a schema, and dispatches valid records through a
//! user-supplied processor, grouped into fixed-size batches with bounded
//! concurrency, pause/resume/abort control, retries with exponential
//! backoff, lifecycle events, and pluggable persistence for crash recovery
//! and distributed multi-worker execution.
//!
//! ## Pipeline
//!
//! ```text
//! source bytes → parser → raw record → alias + transform → validation
//!   → uniqueness → hooks → processor (with retries) → state store + events
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bulkflow_engine::{IngestionEngine, processor_fn};
//! use bulkflow_shared::ImportConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = IngestionEngine::builder()
//!         .with_config(ImportConfig { batch_size: 100, ..Default::default() })
//!         .with_source(source, parser)
//!         .build()?;
//!
//!     let summary = engine
//!         .start(std::sync::Arc::new(processor_fn(|record, _ctx| async move {
//!             // hand the record to your system
//!             Ok(())
//!         })))
//!         .await?;
//!     println!("processed {} records", summary.processed_records);
//!     Ok(())
//! }
//! ```
//!
//! Concrete sources, parsers, and store backends are ports; see
//! [`ports::DataSource`], [`ports::SourceParser`], [`store::StateStore`],
//! and [`distributed::DistributedStateStore`].

pub mod chunked;
pub mod context;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod ports;
pub mod preview;
pub mod retry;
pub mod schema;
pub mod splitter;
pub mod store;

// Re-exports for convenience
pub use chunked::{ChunkOptions, ChunkResult};
pub use distributed::{DistributedStateStore, InMemoryDistributedStore};
pub use engine::{IngestionEngine, IngestionEngineBuilder, DEFAULT_PREVIEW_RECORDS};
pub use error::{EngineError, Result};
pub use events::{EventBus, HandlerId};
pub use ports::{
    processor_fn, DataSource, DuplicateCheckOutcome, DuplicateChecker, FormatHints, ImportHooks,
    RecordContext, RecordProcessor, SourceChunk, SourceMetadata, SourceParser, SourceStream,
};
pub use preview::PreviewResult;
pub use schema::{CustomCheck, FieldDef, FieldType, ImportSchema, SchemaValidator};
pub use store::{BatchStateUpdate, InMemoryStateStore, JsonFileStateStore, StateStore};

pub use bulkflow_shared as shared;
