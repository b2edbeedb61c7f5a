//! Configuration management

use crate::db::DbConfig;
use crate::ingest::encoding::{SourceEncoding, DEFAULT_ENCODING_CHUNK_BYTES};
use crate::ingest::loader::{LoadThresholds, DEFAULT_LAST_UPDATED_COLUMN};
use crate::ingest::strategy::{StrategyChoice, DEFAULT_MAX_FILE_SIZE_MB};
use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use std::path::PathBuf;
use std::time::Duration;

/// Default directory for converted files.
pub const DEFAULT_TEMP_DIR: &str = "./temp";

/// Default encoding of the published files.
pub const DEFAULT_SOURCE_ENCODING: &str = "iso-8859-1";

/// Loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub database: DbConfig,
    pub retry: RetryPolicy,
    pub processing: ProcessingConfig,
    pub thresholds: LoadThresholds,
    /// Column stamped on upsert; `None` disables stamping
    pub last_updated_column: Option<String>,
}

/// File conversion and chunking settings
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub max_file_size_mb: u64,
    pub encoding_chunk_bytes: usize,
    /// Rows per chunk window; `None` derives it from the host preset
    pub chunk_rows: Option<usize>,
    pub strategy: StrategyChoice,
    pub source_encoding: SourceEncoding,
    pub temp_dir: PathBuf,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
            encoding_chunk_bytes: DEFAULT_ENCODING_CHUNK_BYTES,
            chunk_rows: None,
            strategy: StrategyChoice::Auto,
            source_encoding: SourceEncoding::Latin1,
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            retry: RetryPolicy::default(),
            processing: ProcessingConfig::default(),
            thresholds: LoadThresholds::default(),
            last_updated_column: Some(DEFAULT_LAST_UPDATED_COLUMN.to_string()),
        }
    }
}

impl LoaderConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read the environment without touching `.env` or validating.
    pub fn from_env() -> anyhow::Result<Self> {
        let database = DbConfig::from_env()?;

        let retry = RetryPolicy::new(
            std::env::var("DB_RETRY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            std::env::var("DB_RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BASE_DELAY),
        );

        // Invalid enumerated values are errors rather than silent defaults
        let strategy: StrategyChoice = match std::env::var("PROCESSING_STRATEGY") {
            Ok(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            Err(_) => StrategyChoice::Auto,
        };
        let source_encoding: SourceEncoding = std::env::var("SOURCE_ENCODING")
            .unwrap_or_else(|_| DEFAULT_SOURCE_ENCODING.to_string())
            .parse()
            .map_err(anyhow::Error::msg)?;

        let processing = ProcessingConfig {
            max_file_size_mb: std::env::var("MAX_FILE_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_FILE_SIZE_MB),
            encoding_chunk_bytes: std::env::var("ENCODING_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_ENCODING_CHUNK_BYTES),
            chunk_rows: std::env::var("CHUNK_ROWS").ok().and_then(|s| s.parse().ok()),
            strategy,
            source_encoding,
            temp_dir: std::env::var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_TEMP_DIR)),
        };

        let last_updated_column = match std::env::var("LAST_UPDATED_COLUMN") {
            Ok(raw) if raw.trim().is_empty() => None,
            Ok(raw) => Some(raw.trim().to_string()),
            Err(_) => Some(DEFAULT_LAST_UPDATED_COLUMN.to_string()),
        };

        Ok(Self {
            database,
            retry,
            processing,
            thresholds: LoadThresholds::default(),
            last_updated_column,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be greater than 0");
        }

        if self.processing.encoding_chunk_bytes == 0 {
            anyhow::bail!("ENCODING_CHUNK_SIZE must be greater than 0");
        }

        if self.processing.chunk_rows == Some(0) {
            anyhow::bail!("CHUNK_ROWS must be greater than 0");
        }

        if self.thresholds.staged_window_rows == 0 {
            anyhow::bail!("Staged merge window must be greater than 0");
        }

        if self.processing.max_file_size_mb == 0 {
            tracing::warn!("MAX_FILE_SIZE_MB is 0 - every non-empty file will be chunked");
        }

        Ok(())
    }
}
