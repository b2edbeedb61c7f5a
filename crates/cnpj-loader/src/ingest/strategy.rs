//! Per-file and per-host processing decisions
//!
//! A converted file larger than the ceiling is streamed through the loader
//! in fixed-size row windows; anything else is loaded as a single batch.
//! The host preset, sampled once at startup, only sizes the default window.

use super::batch::BatchReader;
use super::encoding::{ConvertedFile, EncodingNormalizer};
use super::loader::{BulkLoader, LoadOutcome, LoadTactic};
use super::record_type::SourceFile;
use super::schema::SchemaMapper;
use crate::error::{IngestError, IngestResult};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use sysinfo::System;
use tracing::{debug, info};

/// Files above this converted size are chunked
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 500;

/// Upper bound for rows per chunk window
pub const DEFAULT_CHUNK_ROWS: usize = 1_000_000;

const GIB: u64 = 1024 * 1024 * 1024;

/// A file converted to UTF-8 with its tactic chosen, ready to load.
#[derive(Debug)]
pub struct PreparedFile {
    converted: ConvertedFile,
    file_tactic: FileTactic,
}

impl PreparedFile {
    pub fn file_tactic(&self) -> FileTactic {
        self.file_tactic
    }
}

/// Load one whole file at once or stream it in windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FileTactic {
    Direct,
    Chunked { chunk_rows: usize },
}

impl FileTactic {
    /// Strictly above the ceiling is chunked; exactly at it is direct.
    pub fn for_size(converted_bytes: u64, ceiling_bytes: u64, chunk_rows: usize) -> Self {
        if converted_bytes > ceiling_bytes {
            FileTactic::Chunked { chunk_rows }
        } else {
            FileTactic::Direct
        }
    }
}

impl fmt::Display for FileTactic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileTactic::Direct => f.write_str("direct"),
            FileTactic::Chunked { chunk_rows } => write!(f, "chunked({chunk_rows})"),
        }
    }
}

/// Memory and CPU of the machine running the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostResources {
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub cpu_count: usize,
}

impl HostResources {
    pub fn probe() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        Self {
            total_memory_bytes: system.total_memory(),
            available_memory_bytes: system.available_memory(),
            cpu_count: num_cpus::get(),
        }
    }

    pub fn total_memory_gib(&self) -> f64 {
        self.total_memory_bytes as f64 / GIB as f64
    }
}

/// Log current memory use at debug level.
pub fn log_memory(stage: &str) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let mut system = System::new();
    system.refresh_memory();
    debug!(
        stage,
        used_mib = system.used_memory() / (1024 * 1024),
        available_mib = system.available_memory() / (1024 * 1024),
        "Memory snapshot"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPreset {
    MemoryConstrained,
    HighMemory,
    Distributed,
}

impl ProcessingPreset {
    pub fn detect(host: &HostResources) -> Self {
        if host.total_memory_bytes < 8 * GIB {
            ProcessingPreset::MemoryConstrained
        } else if host.total_memory_bytes < 32 * GIB || host.cpu_count < 8 {
            ProcessingPreset::HighMemory
        } else {
            ProcessingPreset::Distributed
        }
    }

    /// Rows per batch this preset is comfortable holding in memory.
    pub fn target_batch_rows(self, host: &HostResources) -> usize {
        match self {
            ProcessingPreset::MemoryConstrained if host.total_memory_bytes < 4 * GIB => 100_000,
            ProcessingPreset::MemoryConstrained if host.total_memory_bytes < 8 * GIB => 250_000,
            ProcessingPreset::MemoryConstrained => 500_000,
            ProcessingPreset::HighMemory => 2_000_000,
            ProcessingPreset::Distributed => 5_000_000,
        }
    }
}

impl fmt::Display for ProcessingPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingPreset::MemoryConstrained => "memory_constrained",
            ProcessingPreset::HighMemory => "high_memory",
            ProcessingPreset::Distributed => "distributed",
        };
        f.write_str(name)
    }
}

/// `PROCESSING_STRATEGY`: detect from the host, or force a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyChoice {
    #[default]
    Auto,
    Forced(ProcessingPreset),
}

impl FromStr for StrategyChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "" => Ok(StrategyChoice::Auto),
            "memory_constrained" => Ok(StrategyChoice::Forced(ProcessingPreset::MemoryConstrained)),
            "high_memory" => Ok(StrategyChoice::Forced(ProcessingPreset::HighMemory)),
            "distributed" => Ok(StrategyChoice::Forced(ProcessingPreset::Distributed)),
            other => Err(format!(
                "unknown processing strategy '{other}' (auto, memory_constrained, high_memory, distributed)"
            )),
        }
    }
}

impl StrategyChoice {
    pub fn resolve(self, host: &HostResources) -> ProcessingPreset {
        match self {
            StrategyChoice::Auto => ProcessingPreset::detect(host),
            StrategyChoice::Forced(preset) => preset,
        }
    }
}

/// Result of loading one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub file_tactic: FileTactic,
    /// Tactic of the last committed batch
    pub load_tactic: Option<LoadTactic>,
    pub rows: u64,
    pub batches: usize,
}

#[derive(Debug, Clone)]
pub struct StrategySelector {
    ceiling_bytes: u64,
    chunk_rows: usize,
    preset: ProcessingPreset,
}

impl StrategySelector {
    /// `chunk_rows_override` wins over the preset; otherwise the window is
    /// the smaller of [`DEFAULT_CHUNK_ROWS`] and the preset target.
    pub fn new(
        max_file_size_mb: u64,
        chunk_rows_override: Option<usize>,
        choice: StrategyChoice,
        host: &HostResources,
    ) -> Self {
        let preset = choice.resolve(host);
        let chunk_rows = chunk_rows_override
            .unwrap_or_else(|| DEFAULT_CHUNK_ROWS.min(preset.target_batch_rows(host)))
            .max(1);

        info!(
            preset = %preset,
            memory_gib = %format!("{:.1}", host.total_memory_gib()),
            cpus = host.cpu_count,
            chunk_rows,
            max_file_size_mb,
            "Processing strategy selected"
        );

        Self {
            ceiling_bytes: max_file_size_mb.saturating_mul(1024 * 1024),
            chunk_rows,
            preset,
        }
    }

    pub fn preset(&self) -> ProcessingPreset {
        self.preset
    }

    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    pub fn tactic_for(&self, converted_bytes: u64) -> FileTactic {
        FileTactic::for_size(converted_bytes, self.ceiling_bytes, self.chunk_rows)
    }

    /// Convert, map and load one file, returning once every batch is
    /// committed. Chunks go to the loader one at a time and are never
    /// accumulated.
    pub async fn load_file<L>(
        &self,
        loader: &L,
        normalizer: &EncodingNormalizer,
        source: &SourceFile,
    ) -> IngestResult<FileOutcome>
    where
        L: BulkLoader + ?Sized,
    {
        let prepared = self.prepare_file(normalizer, source).await?;
        self.load_prepared(loader, source, prepared).await
    }

    /// Convert `source` to UTF-8 and choose its tactic from the converted size.
    pub async fn prepare_file(
        &self,
        normalizer: &EncodingNormalizer,
        source: &SourceFile,
    ) -> IngestResult<PreparedFile> {
        log_memory("before_conversion");
        let converted = normalizer.convert(&source.path).await?;
        log_memory("after_conversion");

        let file_tactic = self.tactic_for(converted.len());
        info!(
            file = %source.filename,
            table = source.record_type.table(),
            bytes = converted.len(),
            tactic = %file_tactic,
            "Processing file"
        );

        Ok(PreparedFile {
            converted,
            file_tactic,
        })
    }

    /// Map and load a prepared file. The converted copy is removed when
    /// this returns.
    pub async fn load_prepared<L>(
        &self,
        loader: &L,
        source: &SourceFile,
        prepared: PreparedFile,
    ) -> IngestResult<FileOutcome>
    where
        L: BulkLoader + ?Sized,
    {
        let table = source.record_type.table();
        let PreparedFile {
            converted,
            file_tactic,
        } = prepared;

        let mut reader = BatchReader::open(converted.path(), &source.filename).await?;
        let width = reader.sample().await?;
        if width == 0 {
            info!(file = %source.filename, table, "File has no rows");
            return Ok(FileOutcome {
                file_tactic,
                load_tactic: None,
                rows: 0,
                batches: 0,
            });
        }
        let mapper = SchemaMapper::for_width(source.record_type, width, &source.filename)?;

        loader.prepare(table).await.map_err(|e| load_error(table, e))?;

        let window = match file_tactic {
            FileTactic::Direct => usize::MAX,
            FileTactic::Chunked { chunk_rows } => chunk_rows,
        };

        let started = Instant::now();
        let mut outcome = FileOutcome {
            file_tactic,
            load_tactic: None,
            rows: 0,
            batches: 0,
        };

        while let Some(rows) = reader.next_window(window).await? {
            let batch = mapper.apply(rows);
            let loaded: LoadOutcome = loader
                .load(table, batch)
                .await
                .map_err(|e| load_error(table, e))?;

            outcome.rows += loaded.rows_submitted;
            outcome.batches += 1;
            outcome.load_tactic = loaded.tactic.or(outcome.load_tactic);

            if matches!(file_tactic, FileTactic::Chunked { .. }) {
                log_memory("after_chunk");
                info!(
                    file = %source.filename,
                    chunk = outcome.batches,
                    rows_so_far = outcome.rows,
                    "Chunk committed"
                );
            }
        }

        info!(
            file = %source.filename,
            table,
            rows = outcome.rows,
            batches = outcome.batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "File loaded"
        );

        Ok(outcome)
    }
}

fn load_error(table: &str, source: super::loader::LoadError) -> IngestError {
    IngestError::Load {
        table: table.to_string(),
        source,
    }
}
