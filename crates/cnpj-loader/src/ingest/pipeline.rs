//! File-at-a-time ingestion run for one dataset version
//!
//! Files already recorded for the version are skipped. Each remaining file
//! is converted, mapped and loaded, then recorded. A failing file is logged
//! and left unrecorded while the run moves on; only an unreachable
//! destination stops the run early.

use super::encoding::EncodingNormalizer;
use super::loader::{BulkLoader, LoadTactic};
use super::record_type::{file_name, RecordType, SourceFile};
use super::strategy::{FileTactic, StrategySelector};
use super::tracker::ProcessedFileTracker;
use crate::error::{IngestError, IngestResult};
use chrono::{DateTime, Utc};
use cnpj_common::DatasetVersion;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub filename: String,
    pub record_type: Option<RecordType>,
    pub status: FileStatus,
    pub file_tactic: Option<FileTactic>,
    pub load_tactic: Option<LoadTactic>,
    pub rows: u64,
    pub elapsed_ms: u64,
}

/// Enough context to re-run a single file.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub filename: String,
    pub tactic: Option<LoadTactic>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub attempted: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: Vec<FileFailure>,
    pub rows_loaded: u64,
    pub elapsed_ms: u64,
    /// Stopped between files by a cancellation request
    pub cancelled: bool,
    /// Stopped because the destination became unreachable
    pub aborted: bool,
    pub files: Vec<FileReport>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.aborted && !self.cancelled
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "version {}: {} attempted, {} completed, {} skipped, {} failed, {} rows loaded in {:.1}s",
            self.version,
            self.attempted,
            self.completed,
            self.skipped,
            self.failed.len(),
            self.rows_loaded,
            self.elapsed_ms as f64 / 1000.0
        );
        if self.aborted {
            line.push_str(" (aborted: destination unavailable)");
        } else if self.cancelled {
            line.push_str(" (cancelled)");
        }
        line
    }
}

pub struct IngestPipeline<L, T> {
    loader: L,
    tracker: T,
    selector: StrategySelector,
    normalizer: EncodingNormalizer,
}

impl<L, T> IngestPipeline<L, T>
where
    L: BulkLoader,
    T: ProcessedFileTracker,
{
    pub fn new(loader: L, tracker: T, selector: StrategySelector, normalizer: EncodingNormalizer) -> Self {
        Self {
            loader,
            tracker,
            selector,
            normalizer,
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Process `files` in the given order. Returns `Err` only when tracking
    /// storage cannot be prepared; per-file problems are in the summary.
    pub async fn run(
        &self,
        version: &DatasetVersion,
        files: &[PathBuf],
        cancel: &CancellationToken,
    ) -> IngestResult<RunSummary> {
        let started = Instant::now();
        self.tracker.ensure_storage().await?;
        let recorded = self.tracker.list_recorded(version.as_str()).await?;

        info!(
            version = %version,
            files = files.len(),
            already_processed = recorded.len(),
            "Starting ingestion run"
        );

        let mut summary = RunSummary {
            version: version.to_string(),
            started_at: Utc::now(),
            ..Default::default()
        };

        for path in files {
            if cancel.is_cancelled() {
                warn!(version = %version, "Cancellation requested, stopping before next file");
                summary.cancelled = true;
                break;
            }

            let filename = file_name(path);
            if recorded.contains(&filename) {
                info!(file = %filename, "Already processed, skipping");
                summary.skipped += 1;
                summary.files.push(FileReport {
                    record_type: RecordType::detect(&filename),
                    filename,
                    status: FileStatus::Skipped,
                    file_tactic: None,
                    load_tactic: None,
                    rows: 0,
                    elapsed_ms: 0,
                });
                continue;
            }

            summary.attempted += 1;
            let file_started = Instant::now();
            let result = self.process_file(path, version).await;
            let elapsed_ms = file_started.elapsed().as_millis() as u64;

            match result {
                Ok(report) => {
                    summary.completed += 1;
                    summary.rows_loaded += report.rows;
                    summary.files.push(FileReport { elapsed_ms, ..report });
                },
                Err(FailedFile { file_tactic, error: err }) => {
                    error!(
                        file = %filename,
                        tactic = ?err.tactic(),
                        error = %err,
                        "File failed"
                    );
                    summary.failed.push(FileFailure {
                        filename: filename.clone(),
                        tactic: err.tactic(),
                        error: err.to_string(),
                    });
                    summary.files.push(FileReport {
                        record_type: RecordType::detect(&filename),
                        filename,
                        status: FileStatus::Failed,
                        file_tactic,
                        load_tactic: err.tactic(),
                        rows: 0,
                        elapsed_ms,
                    });

                    if err.is_fatal() {
                        error!(version = %version, "Destination unavailable, aborting run");
                        summary.aborted = true;
                        break;
                    }
                },
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            version = %version,
            attempted = summary.attempted,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            rows = summary.rows_loaded,
            elapsed_ms = summary.elapsed_ms,
            "Ingestion run finished"
        );

        Ok(summary)
    }

    async fn process_file(&self, path: &Path, version: &DatasetVersion) -> Result<FileReport, FailedFile> {
        let source = SourceFile::resolve(path, version).map_err(FailedFile::before_tactic)?;
        let prepared = self
            .selector
            .prepare_file(&self.normalizer, &source)
            .await
            .map_err(FailedFile::before_tactic)?;
        let file_tactic = Some(prepared.file_tactic());

        let outcome = self
            .selector
            .load_prepared(&self.loader, &source, prepared)
            .await
            .map_err(|error| FailedFile { file_tactic, error })?;

        self.tracker
            .record(version.as_str(), &source.filename)
            .await
            .map_err(|e| FailedFile {
                file_tactic,
                error: IngestError::Tracker(e),
            })?;

        Ok(FileReport {
            filename: source.filename,
            record_type: Some(source.record_type),
            status: FileStatus::Completed,
            file_tactic: Some(outcome.file_tactic),
            load_tactic: outcome.load_tactic,
            rows: outcome.rows,
            elapsed_ms: 0,
        })
    }
}

/// A file error with the tactic chosen before it happened, if any.
struct FailedFile {
    file_tactic: Option<FileTactic>,
    error: IngestError,
}

impl FailedFile {
    /// Failure before the converted size was known.
    fn before_tactic(error: IngestError) -> Self {
        Self {
            file_tactic: None,
            error,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::DbError;
    use crate::ingest::batch::Batch;
    use crate::ingest::encoding::SourceEncoding;
    use crate::ingest::loader::{LoadError, LoadOutcome};
    use crate::ingest::strategy::{HostResources, StrategyChoice};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Loader that fails for tables listed in `failing` and counts rows per table.
    #[derive(Default)]
    struct FakeLoader {
        failing: HashSet<&'static str>,
        unavailable: bool,
        loaded: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl BulkLoader for FakeLoader {
        async fn prepare(&self, _table: &str) -> Result<(), LoadError> {
            if self.unavailable {
                return Err(LoadError::Connection(DbError::Unavailable {
                    attempts: 4,
                    source: sqlx::Error::PoolTimedOut,
                }));
            }
            Ok(())
        }

        async fn load(&self, table: &str, batch: Batch) -> Result<LoadOutcome, LoadError> {
            if self.failing.contains(table) {
                return Err(LoadError::Statement {
                    tactic: LoadTactic::DirectUpsert,
                    source: sqlx::Error::Protocol("duplicate key".into()),
                });
            }
            self.loaded.lock().unwrap().push((table.to_string(), batch.len()));
            Ok(LoadOutcome {
                tactic: Some(LoadTactic::DirectUpsert),
                rows_submitted: batch.len() as u64,
                rows_written: batch.len() as u64,
                windows: 1,
            })
        }
    }

    #[derive(Default)]
    struct MemoryTracker {
        records: Mutex<HashSet<(String, String)>>,
    }

    impl MemoryTracker {
        fn with(version: &str, names: &[&str]) -> Self {
            let tracker = Self::default();
            for name in names {
                tracker
                    .records
                    .lock()
                    .unwrap()
                    .insert((version.to_string(), name.to_string()));
            }
            tracker
        }
    }

    #[async_trait]
    impl ProcessedFileTracker for MemoryTracker {
        async fn ensure_storage(&self) -> Result<(), DbError> {
            Ok(())
        }

        async fn record_exists(&self, version: &str, filename: &str) -> Result<bool, DbError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .contains(&(version.to_string(), filename.to_string())))
        }

        async fn record(&self, version: &str, filename: &str) -> Result<(), DbError> {
            self.records
                .lock()
                .unwrap()
                .insert((version.to_string(), filename.to_string()));
            Ok(())
        }

        async fn list_recorded(&self, version: &str) -> Result<HashSet<String>, DbError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|(v, _)| v == version)
                .map(|(_, f)| f.clone())
                .collect())
        }
    }

    const FILES: [&str; 5] = [
        "F.K03200$Z.D40511.CNAECSV",
        "F.K03200$Z.D40511.MOTICSV",
        "F.K03200$Z.D40511.PAISCSV",
        "F.K03200$Z.D40511.MUNICCSV",
        "F.K03200$Z.D40511.NATJUCSV",
    ];

    fn write_inputs(dir: &Path) -> Vec<PathBuf> {
        FILES
            .iter()
            .map(|name| {
                let path = dir.join(name);
                std::fs::write(&path, "\"01\";\"UM\"\n\"02\";\"DOIS\"\n").unwrap();
                path
            })
            .collect()
    }

    fn pipeline<T: ProcessedFileTracker>(
        loader: FakeLoader,
        tracker: T,
        dir: &Path,
    ) -> IngestPipeline<FakeLoader, T> {
        let host = HostResources {
            total_memory_bytes: 16 << 30,
            available_memory_bytes: 8 << 30,
            cpu_count: 8,
        };
        let selector = StrategySelector::new(500, None, StrategyChoice::Auto, &host);
        let normalizer = EncodingNormalizer::new(SourceEncoding::Latin1, 1024, dir.join("tmp"));
        IngestPipeline::new(loader, tracker, selector, normalizer)
    }

    fn version() -> DatasetVersion {
        DatasetVersion::parse("2024-05").unwrap()
    }

    #[tokio::test]
    async fn test_skips_already_processed_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_inputs(dir.path());
        let tracker = MemoryTracker::with("2024-05", &[FILES[0], FILES[3]]);
        let pipeline = pipeline(FakeLoader::default(), tracker, dir.path());

        let summary = pipeline
            .run(&version(), &files, &CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.rows_loaded, 6);

        let tables: Vec<String> = pipeline
            .loader()
            .loaded
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect();
        assert_eq!(tables, vec!["motivos", "paises", "naturezas_juridicas"]);
        assert_eq!(pipeline.tracker().list_recorded("2024-05").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_failure_is_contained_to_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_inputs(dir.path());
        let loader = FakeLoader {
            failing: HashSet::from(["paises"]),
            ..Default::default()
        };
        let pipeline = pipeline(loader, MemoryTracker::default(), dir.path());

        let summary = pipeline
            .run(&version(), &files, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!summary.is_success());
        assert_eq!(summary.attempted, 5);
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].filename, FILES[2]);
        assert_eq!(summary.failed[0].tactic, Some(LoadTactic::DirectUpsert));
        assert!(summary.failed[0].error.contains("paises"));

        let report = summary.files.iter().find(|r| r.filename == FILES[2]).unwrap();
        assert_eq!(report.status, FileStatus::Failed);
        assert_eq!(report.file_tactic, Some(FileTactic::Direct));
        assert_eq!(report.load_tactic, Some(LoadTactic::DirectUpsert));

        let tracker = pipeline.tracker();
        for (i, name) in FILES.iter().enumerate() {
            assert_eq!(tracker.record_exists("2024-05", name).await.unwrap(), i != 2, "{name}");
        }
    }

    #[tokio::test]
    async fn test_unknown_file_fails_without_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LEIAME.txt");
        std::fs::write(&path, "readme").unwrap();
        let pipeline = pipeline(FakeLoader::default(), MemoryTracker::default(), dir.path());

        let summary = pipeline
            .run(&version(), &[path], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].error.contains("Unrecognized file type"));
        assert_eq!(summary.files[0].file_tactic, None);
        assert!(pipeline.tracker().list_recorded("2024-05").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_destination_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_inputs(dir.path());
        let loader = FakeLoader {
            unavailable: true,
            ..Default::default()
        };
        let pipeline = pipeline(loader, MemoryTracker::default(), dir.path());

        let summary = pipeline
            .run(&version(), &files, &CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_checked_before_each_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_inputs(dir.path());
        let pipeline = pipeline(FakeLoader::default(), MemoryTracker::default(), dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = pipeline.run(&version(), &files, &cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 0);
        assert!(summary.summary().contains("cancelled"));
    }
}
