//! CNPJ Loader - load a CNPJ open-data release into PostgreSQL

use anyhow::{Context, Result};
use clap::Parser;
use cnpj_common::logging::{init_logging, LogConfig, LogLevel};
use cnpj_common::DatasetVersion;
use cnpj_loader::config::LoaderConfig;
use cnpj_loader::db::Destination;
use cnpj_loader::ingest::{
    order_by_dependency, EncodingNormalizer, HostResources, IngestPipeline, PgBulkLoader,
    PgProcessedFileTracker, StrategyChoice, StrategySelector,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cnpj-loader")]
#[command(author, version, about = "Load decompressed CNPJ open-data files into PostgreSQL")]
struct Cli {
    /// Decompressed files, or directories holding them
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Dataset version (YYYY-MM); defaults to the name of the input directory
    #[arg(short = 'd', long, env = "DATASET_VERSION")]
    dataset_version: Option<String>,

    /// Apply schema migrations before loading
    #[arg(long)]
    migrate: bool,

    /// Rows per chunk for files above the size ceiling
    #[arg(long, env = "CHUNK_ROWS")]
    chunk_rows: Option<usize>,

    /// Processing preset: auto, memory_constrained, high_memory, distributed
    #[arg(long)]
    strategy: Option<StrategyChoice>,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cnpj-loader")
        .build()
        .merge_env()?;

    let _logging = init_logging(&log_config)?;

    let mut config = LoaderConfig::load()?;
    if let Some(rows) = cli.chunk_rows {
        config.processing.chunk_rows = Some(rows);
    }
    if let Some(strategy) = cli.strategy {
        config.processing.strategy = strategy;
    }
    config.validate()?;

    let version = resolve_version(cli.dataset_version.as_deref(), &cli.inputs)?;
    let files = order_by_dependency(collect_files(&cli.inputs).await?);
    info!(version = %version, files = files.len(), "Input files resolved");

    let destination = Destination::connect_lazy(&config.database, config.retry)?;
    destination
        .health_check()
        .await
        .context("Destination database is unreachable")?;

    if cli.migrate {
        destination.run_migrations().await?;
    }

    let selector = StrategySelector::new(
        config.processing.max_file_size_mb,
        config.processing.chunk_rows,
        config.processing.strategy,
        &HostResources::probe(),
    );
    let normalizer = EncodingNormalizer::new(
        config.processing.source_encoding,
        config.processing.encoding_chunk_bytes,
        config.processing.temp_dir.clone(),
    );
    let loader = PgBulkLoader::new(destination.clone())
        .with_thresholds(config.thresholds)
        .with_last_updated_column(config.last_updated_column.clone());
    let tracker = PgProcessedFileTracker::new(destination);
    let pipeline = IngestPipeline::new(loader, tracker, selector, normalizer);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current file before stopping");
            signal_token.cancel();
        }
    });

    let summary = pipeline.run(&version, &files, &cancel).await?;

    for failure in &summary.failed {
        warn!(
            file = %failure.filename,
            tactic = ?failure.tactic,
            error = %failure.error,
            "File not loaded"
        );
    }
    info!("{}", summary.summary());

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Explicit version, else the name of the first directory input, else the
/// parent directory of the first file input.
fn resolve_version(explicit: Option<&str>, inputs: &[PathBuf]) -> Result<DatasetVersion> {
    if let Some(raw) = explicit {
        return Ok(DatasetVersion::parse(raw)?);
    }

    let candidate = inputs
        .iter()
        .find_map(|input| {
            let dir = if input.is_dir() {
                input.as_path()
            } else {
                input.parent()?
            };
            dir.file_name().map(|n| n.to_string_lossy().into_owned())
        })
        .context("Cannot infer the dataset version; pass --dataset-version")?;

    DatasetVersion::parse(&candidate)
        .with_context(|| format!("Directory '{candidate}' is not a dataset version; pass --dataset-version"))
}

/// Expand directories one level deep into the regular files they contain.
async fn collect_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries = tokio::fs::read_dir(input)
                .await
                .with_context(|| format!("Failed to read directory {}", input.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_file() && !is_hidden(&path) {
                    files.push(path);
                }
            }
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
}
