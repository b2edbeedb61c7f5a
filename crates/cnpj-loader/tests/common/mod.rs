//! Shared PostgreSQL harness for cnpj-loader integration tests
//!
//! These tests require Docker. Run with:
//!
//! ```bash
//! cargo test -p cnpj-loader -- --ignored --nocapture
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use cnpj_loader::db::Destination;
use cnpj_loader::retry::RetryPolicy;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// PostgreSQL container with the loader schema migrated
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let destination = Destination::new(pool.clone(), RetryPolicy::no_retry());
        destination
            .run_migrations()
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Destination over the container pool that does not retry.
    pub fn destination(&self) -> Destination {
        Destination::new(self.pool.clone(), RetryPolicy::no_retry())
    }

    /// Pool limited to one connection, so session-local temp tables are
    /// visible to the caller's catalog queries.
    pub async fn single_connection_pool(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&self.connection_string)
            .await
            .context("Failed to connect to PostgreSQL")
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count {table}"))?;
        Ok(count)
    }
}

/// Session-local staging tables still present on the pool's connection.
pub async fn leftover_staging(pool: &PgPool) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT count(*) FROM pg_class WHERE relpersistence = 't' AND starts_with(relname, '_staging_')",
    )
    .fetch_one(pool)
    .await
    .context("Failed to query pg_class")?;
    Ok(count)
}

/// Write a `;`-delimited, quoted, Latin-1 file the way the publisher does.
pub fn write_latin1(dir: &Path, name: &str, rows: &[Vec<&str>]) -> PathBuf {
    let mut bytes = Vec::new();
    for row in rows {
        let line = row
            .iter()
            .map(|v| format!("\"{v}\""))
            .collect::<Vec<_>>()
            .join(";");
        // Every char used in fixtures is below U+0100
        bytes.extend(line.chars().map(|c| c as u32 as u8));
        bytes.push(b'\n');
    }
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write fixture");
    path
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,cnpj_loader=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
