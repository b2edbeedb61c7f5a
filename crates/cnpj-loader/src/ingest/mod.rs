//! Ingestion stages, from raw source file to committed rows

pub mod batch;
pub mod encoding;
pub mod loader;
pub mod pipeline;
pub mod record_type;
pub mod schema;
pub mod strategy;
pub mod tracker;

pub use batch::{Batch, BatchReader, Row};
pub use encoding::{ConvertedFile, EncodingNormalizer, SourceEncoding};
pub use loader::{BulkLoader, LoadError, LoadOutcome, LoadTactic, LoadThresholds, PgBulkLoader};
pub use pipeline::{FileFailure, FileReport, FileStatus, IngestPipeline, RunSummary};
pub use record_type::{order_by_dependency, RecordType, SourceFile};
pub use schema::SchemaMapper;
pub use strategy::{
    FileTactic, HostResources, PreparedFile, ProcessingPreset, StrategyChoice, StrategySelector,
};
pub use tracker::{PgProcessedFileTracker, ProcessedFileTracker};
