//! CNPJ Loader Library
//!
//! Loads the decompressed files of a CNPJ open-data release into
//! PostgreSQL. Each file is converted to UTF-8, mapped onto its table's
//! column names, and merged into the destination with a tactic chosen from
//! the table's primary key and the batch size. Files that finish loading
//! are recorded, so re-running a release only touches what is missing.
//!
//! # Example
//!
//! ```no_run
//! use cnpj_common::DatasetVersion;
//! use cnpj_loader::config::LoaderConfig;
//! use cnpj_loader::db::Destination;
//! use cnpj_loader::ingest::{
//!     EncodingNormalizer, HostResources, IngestPipeline, PgBulkLoader, PgProcessedFileTracker,
//!     StrategySelector,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoaderConfig::load()?;
//!     let destination = Destination::connect_lazy(&config.database, config.retry)?;
//!     let selector = StrategySelector::new(
//!         config.processing.max_file_size_mb,
//!         config.processing.chunk_rows,
//!         config.processing.strategy,
//!         &HostResources::probe(),
//!     );
//!     let normalizer = EncodingNormalizer::new(
//!         config.processing.source_encoding,
//!         config.processing.encoding_chunk_bytes,
//!         config.processing.temp_dir.clone(),
//!     );
//!     let pipeline = IngestPipeline::new(
//!         PgBulkLoader::new(destination.clone()),
//!         PgProcessedFileTracker::new(destination),
//!         selector,
//!         normalizer,
//!     );
//!
//!     let version = DatasetVersion::parse("2024-05")?;
//!     let files: Vec<std::path::PathBuf> = vec!["data/2024-05/K3241.K03200Y0.D40511.EMPRECSV".into()];
//!     let summary = pipeline.run(&version, &files, &CancellationToken::new()).await?;
//!     println!("{}", summary.summary());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod retry;

pub use error::{IngestError, IngestResult};
