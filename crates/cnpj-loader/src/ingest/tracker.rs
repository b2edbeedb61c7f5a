//! Durable record of files already loaded
//!
//! A file is recorded only after all of its rows are committed, so a file
//! interrupted midway is retried in full by the next run.

use crate::db::{DbError, Destination};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

const CREATE_PROCESSED_FILES: &str = r#"
CREATE TABLE IF NOT EXISTS processed_files (
    directory VARCHAR(50) NOT NULL,
    filename VARCHAR(255) NOT NULL,
    processed_at TIMESTAMP NOT NULL DEFAULT NOW(),
    PRIMARY KEY (directory, filename)
)
"#;

#[async_trait]
pub trait ProcessedFileTracker: Send + Sync {
    /// Create the backing store when it does not exist.
    async fn ensure_storage(&self) -> Result<(), DbError>;

    async fn record_exists(&self, version: &str, filename: &str) -> Result<bool, DbError>;

    /// Idempotent: recording an already recorded pair is a no-op.
    async fn record(&self, version: &str, filename: &str) -> Result<(), DbError>;

    async fn list_recorded(&self, version: &str) -> Result<HashSet<String>, DbError>;
}

#[derive(Debug, Clone)]
pub struct PgProcessedFileTracker {
    destination: Destination,
}

impl PgProcessedFileTracker {
    pub fn new(destination: Destination) -> Self {
        Self { destination }
    }
}

#[async_trait]
impl ProcessedFileTracker for PgProcessedFileTracker {
    async fn ensure_storage(&self) -> Result<(), DbError> {
        let mut conn = self.destination.acquire().await?;
        sqlx::query(CREATE_PROCESSED_FILES).execute(&mut *conn).await?;
        Ok(())
    }

    async fn record_exists(&self, version: &str, filename: &str) -> Result<bool, DbError> {
        let mut conn = self.destination.acquire().await?;
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM processed_files WHERE directory = $1 AND filename = $2",
        )
        .bind(version)
        .bind(filename)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(found.is_some())
    }

    async fn record(&self, version: &str, filename: &str) -> Result<(), DbError> {
        let mut conn = self.destination.acquire().await?;
        let result = sqlx::query(
            "INSERT INTO processed_files (directory, filename) VALUES ($1, $2) \
             ON CONFLICT (directory, filename) DO NOTHING",
        )
        .bind(version)
        .bind(filename)
        .execute(&mut *conn)
        .await?;

        debug!(
            version,
            filename,
            inserted = result.rows_affected(),
            "Recorded processed file"
        );
        Ok(())
    }

    async fn list_recorded(&self, version: &str) -> Result<HashSet<String>, DbError> {
        let mut conn = self.destination.acquire().await?;
        let names: Vec<String> =
            sqlx::query_scalar("SELECT filename FROM processed_files WHERE directory = $1")
                .bind(version)
                .fetch_all(&mut *conn)
                .await?;
        Ok(names.into_iter().collect())
    }
}
