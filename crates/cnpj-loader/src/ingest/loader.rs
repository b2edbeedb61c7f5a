//! Bulk loading into the destination tables
//!
//! A batch is committed with one of four tactics, picked from the table's
//! primary key and the batch size:
//!
//! | key | rows                     | tactic                                        |
//! |-----|--------------------------|-----------------------------------------------|
//! | no  | any                      | `COPY` straight into the table                |
//! | yes | < 10 000                 | single `INSERT .. ON CONFLICT` statement      |
//! | yes | staged <= 1 000 000      | `COPY` into a temp table, one merge           |
//! | yes | staged >  1 000 000      | `COPY` into a temp table, merge in windows    |
//!
//! Duplicate keys inside one batch resolve differently per tactic. The
//! single-statement and single-merge tactics keep the first row of each key.
//! The windowed merge keeps the last row of each key within a window, and
//! because windows are applied in file order a later window overwrites an
//! earlier one.

use super::batch::{Batch, Row};
use crate::db::{DbError, Destination};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Batches below this size with a key use the single-statement upsert.
pub const DIRECT_UPSERT_MAX_ROWS: usize = 10_000;

/// Staged rows merged per transaction.
pub const STAGED_WINDOW_ROWS: usize = 1_000_000;

/// Default column stamped on every overwrite.
pub const DEFAULT_LAST_UPDATED_COLUMN: &str = "data_atualizacao";

/// Rows encoded per `COPY` message.
const COPY_SLICE_ROWS: usize = 10_000;

/// Insertion-order column added to staging tables.
const ROW_SEQ: &str = "__row_seq";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTactic {
    Append,
    DirectUpsert,
    StagedSingle,
    StagedBatched,
}

impl fmt::Display for LoadTactic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadTactic::Append => "append",
            LoadTactic::DirectUpsert => "direct_upsert",
            LoadTactic::StagedSingle => "staged_single",
            LoadTactic::StagedBatched => "staged_batched",
        };
        f.write_str(name)
    }
}

/// Size limits that select between tactics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadThresholds {
    pub direct_upsert_max_rows: usize,
    pub staged_window_rows: usize,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            direct_upsert_max_rows: DIRECT_UPSERT_MAX_ROWS,
            staged_window_rows: STAGED_WINDOW_ROWS,
        }
    }
}

impl LoadThresholds {
    /// Choose the tactic for a batch of `rows` into a table keyed by `key`.
    pub fn plan(&self, key: &[String], rows: usize) -> LoadTactic {
        if key.is_empty() {
            LoadTactic::Append
        } else if rows < self.direct_upsert_max_rows {
            LoadTactic::DirectUpsert
        } else if rows <= self.staged_window_rows {
            LoadTactic::StagedSingle
        } else {
            LoadTactic::StagedBatched
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    /// `None` for an empty batch
    pub tactic: Option<LoadTactic>,
    pub rows_submitted: u64,
    /// Rows inserted or updated in the destination
    pub rows_written: u64,
    pub windows: usize,
}

impl LoadOutcome {
    fn empty() -> Self {
        Self {
            tactic: None,
            rows_submitted: 0,
            rows_written: 0,
            windows: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Connection(#[from] DbError),

    #[error("primary key lookup for {table} failed: {source}")]
    KeyLookup {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("{tactic} failed: {source}")]
    Statement {
        tactic: LoadTactic,
        #[source]
        source: sqlx::Error,
    },

    #[error("{tactic} could not encode COPY payload: {source}")]
    Payload {
        tactic: LoadTactic,
        #[source]
        source: csv::Error,
    },
}

impl LoadError {
    fn statement(tactic: LoadTactic) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| LoadError::Statement { tactic, source }
    }

    pub fn tactic(&self) -> Option<LoadTactic> {
        match self {
            LoadError::Statement { tactic, .. } | LoadError::Payload { tactic, .. } => Some(*tactic),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, LoadError::Connection(db) if db.is_unavailable())
    }
}

/// Destination capable of committing batches into named tables.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Resolve and cache the table's key ahead of its first batch.
    async fn prepare(&self, table: &str) -> Result<(), LoadError>;

    /// Commit `batch` into `table`. An empty batch is a no-op.
    async fn load(&self, table: &str, batch: Batch) -> Result<LoadOutcome, LoadError>;
}

/// [`BulkLoader`] over PostgreSQL.
pub struct PgBulkLoader {
    destination: Destination,
    thresholds: LoadThresholds,
    last_updated_column: Option<String>,
    keys: Mutex<HashMap<String, Arc<[String]>>>,
}

impl PgBulkLoader {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            thresholds: LoadThresholds::default(),
            last_updated_column: Some(DEFAULT_LAST_UPDATED_COLUMN.to_string()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_thresholds(mut self, thresholds: LoadThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Column set to `CURRENT_TIMESTAMP` on every overwrite; `None` disables it.
    pub fn with_last_updated_column(mut self, column: Option<String>) -> Self {
        self.last_updated_column = column.filter(|c| !c.trim().is_empty());
        self
    }

    /// Primary-key columns of `table` in key order, cached for the life of
    /// the loader. A table without a key caches an empty list.
    pub async fn primary_key(&self, table: &str) -> Result<Arc<[String]>, LoadError> {
        if let Some(key) = self.cached_key(table) {
            return Ok(key);
        }

        let mut conn = self.destination.acquire().await?;
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT a.attname::text
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            WHERE i.indrelid = $1::text::regclass AND i.indisprimary
            ORDER BY array_position(i.indkey::int2[], a.attnum)
            "#,
        )
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(|source| LoadError::KeyLookup {
            table: table.to_string(),
            source,
        })?;

        debug!(table, key = ?columns, "Resolved primary key");

        let key: Arc<[String]> = columns.into();
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(table.to_string(), key.clone());
        Ok(key)
    }

    fn cached_key(&self, table: &str) -> Option<Arc<[String]>> {
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(table)
            .cloned()
    }

    async fn append(&self, conn: &mut PgConnection, table: &str, batch: &Batch) -> Result<u64, LoadError> {
        let tactic = LoadTactic::Append;
        let mut tx = conn.begin().await.map_err(LoadError::statement(tactic))?;
        let copied = copy_rows(&mut tx, tactic, table, &batch.columns, &batch.rows).await?;
        tx.commit().await.map_err(LoadError::statement(tactic))?;
        Ok(copied)
    }

    async fn direct_upsert(
        &self,
        conn: &mut PgConnection,
        table: &str,
        key: &[String],
        batch: &Batch,
    ) -> Result<u64, LoadError> {
        let tactic = LoadTactic::DirectUpsert;
        let sql = direct_upsert_sql(table, &batch.columns, key, self.last_updated_column.as_deref());
        let payload = rows_as_json(&batch.columns, &batch.rows);

        let mut tx = conn.begin().await.map_err(LoadError::statement(tactic))?;
        let written = sqlx::query(&sql)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(LoadError::statement(tactic))?
            .rows_affected();
        tx.commit().await.map_err(LoadError::statement(tactic))?;
        Ok(written)
    }

    /// Stage the batch and merge it; the staging table is dropped whatever
    /// the outcome.
    async fn staged(
        &self,
        conn: &mut PgConnection,
        table: &str,
        key: &[String],
        batch: &Batch,
    ) -> Result<(LoadTactic, u64, usize), LoadError> {
        let staging = staging_name(table);
        let result = self.staged_merge(conn, table, &staging, key, batch).await;

        let drop_sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&staging));
        if let Err(e) = sqlx::query(&drop_sql).execute(&mut *conn).await {
            warn!(table, staging = %staging, error = %e, "Failed to drop staging table");
        }

        result
    }

    async fn staged_merge(
        &self,
        conn: &mut PgConnection,
        table: &str,
        staging: &str,
        key: &[String],
        batch: &Batch,
    ) -> Result<(LoadTactic, u64, usize), LoadError> {
        let planned = self.thresholds.plan(key, batch.len());
        let create = format!(
            "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS INCLUDING STORAGE)",
            quote_ident(staging),
            quote_ident(table)
        );
        let add_seq = format!(
            "ALTER TABLE {} ADD COLUMN {} BIGINT GENERATED ALWAYS AS IDENTITY",
            quote_ident(staging),
            quote_ident(ROW_SEQ)
        );

        let mut tx = conn.begin().await.map_err(LoadError::statement(planned))?;
        sqlx::query(&create)
            .execute(&mut *tx)
            .await
            .map_err(LoadError::statement(planned))?;
        sqlx::query(&add_seq)
            .execute(&mut *tx)
            .await
            .map_err(LoadError::statement(planned))?;
        copy_rows(&mut tx, planned, staging, &batch.columns, &batch.rows).await?;

        let staged: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", quote_ident(staging)))
            .fetch_one(&mut *tx)
            .await
            .map_err(LoadError::statement(planned))?;
        let staged = staged.max(0) as usize;

        if staged <= self.thresholds.staged_window_rows {
            let tactic = LoadTactic::StagedSingle;
            let sql = staged_single_sql(
                table,
                staging,
                &batch.columns,
                key,
                self.last_updated_column.as_deref(),
            );
            let written = sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(LoadError::statement(tactic))?
                .rows_affected();
            tx.commit().await.map_err(LoadError::statement(tactic))?;
            return Ok((tactic, written, 1));
        }

        // Commit the staged rows so each window can commit on its own.
        let tactic = LoadTactic::StagedBatched;
        tx.commit().await.map_err(LoadError::statement(tactic))?;

        let sql = staged_window_sql(
            table,
            staging,
            &batch.columns,
            key,
            self.last_updated_column.as_deref(),
        );
        let window = self.thresholds.staged_window_rows.max(1);
        let mut written = 0;
        let mut windows = 0;

        for low in (0..staged).step_by(window) {
            let high = (low + window).min(staged);
            let mut tx = conn.begin().await.map_err(LoadError::statement(tactic))?;
            written += sqlx::query(&sql)
                .bind(low as i64)
                .bind(high as i64)
                .execute(&mut *tx)
                .await
                .map_err(LoadError::statement(tactic))?
                .rows_affected();
            tx.commit().await.map_err(LoadError::statement(tactic))?;
            windows += 1;

            debug!(table, window = windows, low, high, staged, "Merged staging window");
        }

        Ok((tactic, written, windows))
    }
}

#[async_trait]
impl BulkLoader for PgBulkLoader {
    async fn prepare(&self, table: &str) -> Result<(), LoadError> {
        self.primary_key(table).await.map(|_| ())
    }

    async fn load(&self, table: &str, batch: Batch) -> Result<LoadOutcome, LoadError> {
        if batch.is_empty() {
            info!(table, "Empty batch, nothing to load");
            return Ok(LoadOutcome::empty());
        }

        let key = self.primary_key(table).await?;
        let planned = self.thresholds.plan(&key, batch.len());
        let started = Instant::now();
        let mut conn = self.destination.acquire().await?;

        let (tactic, written, windows) = match planned {
            LoadTactic::Append => (planned, self.append(&mut conn, table, &batch).await?, 1),
            LoadTactic::DirectUpsert => {
                (planned, self.direct_upsert(&mut conn, table, &key, &batch).await?, 1)
            },
            LoadTactic::StagedSingle | LoadTactic::StagedBatched => {
                self.staged(&mut conn, table, &key, &batch).await?
            },
        };

        info!(
            table,
            tactic = %tactic,
            rows = batch.len(),
            written,
            windows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch committed"
        );

        Ok(LoadOutcome {
            tactic: Some(tactic),
            rows_submitted: batch.len() as u64,
            rows_written: written,
            windows,
        })
    }
}

async fn copy_rows(
    conn: &mut PgConnection,
    tactic: LoadTactic,
    table: &str,
    columns: &[String],
    rows: &[Row],
) -> Result<u64, LoadError> {
    let statement = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        quote_ident(table),
        column_list(columns)
    );
    let mut copy = conn
        .copy_in_raw(&statement)
        .await
        .map_err(LoadError::statement(tactic))?;

    for slice in rows.chunks(COPY_SLICE_ROWS) {
        let payload = match encode_csv(slice) {
            Ok(payload) => payload,
            Err(source) => {
                let _ = copy.abort(source.to_string()).await;
                return Err(LoadError::Payload { tactic, source });
            },
        };
        copy.send(payload).await.map_err(LoadError::statement(tactic))?;
    }

    copy.finish().await.map_err(LoadError::statement(tactic))
}

/// CSV body for `COPY .. WITH (FORMAT csv)`; `None` is an unquoted empty
/// field, which COPY reads as NULL.
fn encode_csv(rows: &[Row]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(rows.len() * 128));
    for row in rows {
        writer.write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

fn rows_as_json(columns: &[String], rows: &[Row]) -> serde_json::Value {
    let records = rows
        .iter()
        .map(|row| {
            let object = columns
                .iter()
                .zip(row)
                .map(|(name, value)| {
                    let json = value
                        .as_ref()
                        .map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.clone()));
                    (name.clone(), json)
                })
                .collect();
            serde_json::Value::Object(object)
        })
        .collect();
    serde_json::Value::Array(records)
}

fn staging_name(table: &str) -> String {
    let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("_staging_{}_{}_{}", table, std::process::id(), n)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

fn qualified_list(alias: &str, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{alias}.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `ON CONFLICT` clause overwriting every non-key column.
pub fn conflict_clause(columns: &[String], key: &[String], last_updated: Option<&str>) -> String {
    let mut assignments: Vec<String> = columns
        .iter()
        .filter(|c| !key.contains(*c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();

    if assignments.is_empty() {
        return format!("ON CONFLICT ({}) DO NOTHING", column_list(key));
    }
    if let Some(stamp) = last_updated.filter(|s| !columns.iter().any(|c| c.as_str() == *s)) {
        assignments.push(format!("{} = CURRENT_TIMESTAMP", quote_ident(stamp)));
    }

    format!(
        "ON CONFLICT ({}) DO UPDATE SET {}",
        column_list(key),
        assignments.join(", ")
    )
}

/// Upsert from a JSON array bound as `$1`, first row per key wins.
pub fn direct_upsert_sql(
    table: &str,
    columns: &[String],
    key: &[String],
    last_updated: Option<&str>,
) -> String {
    format!(
        "INSERT INTO {table} ({cols}) \
         SELECT DISTINCT ON ({src_key}) {src_cols} \
         FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb) WITH ORDINALITY AS src \
         ORDER BY {src_key}, src.ordinality \
         {conflict}",
        table = quote_ident(table),
        cols = column_list(columns),
        src_cols = qualified_list("src", columns),
        src_key = qualified_list("src", key),
        conflict = conflict_clause(columns, key, last_updated),
    )
}

/// Merge the whole staging table, first staged row per key wins.
pub fn staged_single_sql(
    table: &str,
    staging: &str,
    columns: &[String],
    key: &[String],
    last_updated: Option<&str>,
) -> String {
    format!(
        "INSERT INTO {table} ({cols}) \
         SELECT DISTINCT ON ({stg_key}) {stg_cols} \
         FROM {staging} AS stg \
         ORDER BY {stg_key}, stg.{seq} \
         {conflict}",
        table = quote_ident(table),
        staging = quote_ident(staging),
        cols = column_list(columns),
        stg_cols = qualified_list("stg", columns),
        stg_key = qualified_list("stg", key),
        seq = quote_ident(ROW_SEQ),
        conflict = conflict_clause(columns, key, last_updated),
    )
}

/// Merge staged rows with `$1 < seq <= $2`, last staged row per key wins.
pub fn staged_window_sql(
    table: &str,
    staging: &str,
    columns: &[String],
    key: &[String],
    last_updated: Option<&str>,
) -> String {
    format!(
        "INSERT INTO {table} ({cols}) \
         SELECT {ranked_cols} FROM ( \
             SELECT {stg_cols}, ROW_NUMBER() OVER (PARTITION BY {stg_key} ORDER BY stg.{seq} DESC) AS __rn \
             FROM {staging} AS stg \
             WHERE stg.{seq} > $1 AND stg.{seq} <= $2 \
         ) AS ranked \
         WHERE ranked.__rn = 1 \
         {conflict}",
        table = quote_ident(table),
        staging = quote_ident(staging),
        cols = column_list(columns),
        ranked_cols = qualified_list("ranked", columns),
        stg_cols = qualified_list("stg", columns),
        stg_key = qualified_list("stg", key),
        seq = quote_ident(ROW_SEQ),
        conflict = conflict_clause(columns, key, last_updated),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_boundaries() {
        let t = LoadThresholds::default();
        let key = names(&["cnpj_basico"]);

        assert_eq!(t.plan(&[], 5_000_000), LoadTactic::Append);
        assert_eq!(t.plan(&key, 0), LoadTactic::DirectUpsert);
        assert_eq!(t.plan(&key, 9_999), LoadTactic::DirectUpsert);
        assert_eq!(t.plan(&key, 10_000), LoadTactic::StagedSingle);
        assert_eq!(t.plan(&key, 1_000_000), LoadTactic::StagedSingle);
        assert_eq!(t.plan(&key, 1_000_001), LoadTactic::StagedBatched);
    }

    #[test]
    fn test_conflict_clause_updates_non_key_columns_and_stamp() {
        let clause = conflict_clause(
            &names(&["codigo", "descricao"]),
            &names(&["codigo"]),
            Some("data_atualizacao"),
        );
        assert_eq!(
            clause,
            "ON CONFLICT (\"codigo\") DO UPDATE SET \"descricao\" = EXCLUDED.\"descricao\", \
             \"data_atualizacao\" = CURRENT_TIMESTAMP"
        );
    }

    #[test]
    fn test_conflict_clause_without_update_columns_does_nothing() {
        let key = names(&["cnpj_basico", "cnpj_ordem", "cnpj_dv"]);
        let clause = conflict_clause(&key, &key, Some("data_atualizacao"));
        assert_eq!(
            clause,
            "ON CONFLICT (\"cnpj_basico\", \"cnpj_ordem\", \"cnpj_dv\") DO NOTHING"
        );
    }

    #[test]
    fn test_conflict_clause_without_stamp() {
        let clause = conflict_clause(&names(&["codigo", "descricao"]), &names(&["codigo"]), None);
        assert!(!clause.contains("CURRENT_TIMESTAMP"));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("paises"), "\"paises\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_staged_sql_orders_by_sequence() {
        let cols = names(&["codigo", "descricao"]);
        let key = names(&["codigo"]);

        let single = staged_single_sql("cnaes", "_stg", &cols, &key, None);
        assert!(single.contains("SELECT DISTINCT ON (stg.\"codigo\")"));
        assert!(single.contains("ORDER BY stg.\"codigo\", stg.\"__row_seq\""));

        let window = staged_window_sql("cnaes", "_stg", &cols, &key, None);
        assert!(window.contains("ORDER BY stg.\"__row_seq\" DESC"));
        assert!(window.contains("stg.\"__row_seq\" > $1 AND stg.\"__row_seq\" <= $2"));
    }

    #[test]
    fn test_encode_csv_nulls_are_unquoted_empty() {
        let rows = vec![
            vec![Some("1".to_string()), None, Some("a;\"b\"".to_string())],
            vec![Some("2".to_string()), Some("x,y".to_string()), None],
        ];
        let body = String::from_utf8(encode_csv(&rows).unwrap()).unwrap();
        assert_eq!(body, "1,,\"a;\"\"b\"\"\"\n2,\"x,y\",\n");
    }

    #[test]
    fn test_rows_as_json_keeps_nulls() {
        let json = rows_as_json(
            &names(&["codigo", "descricao"]),
            &[vec![Some("01".into()), None]],
        );
        assert_eq!(json, serde_json::json!([{ "codigo": "01", "descricao": null }]));
    }

    #[test]
    fn test_staging_names_are_unique() {
        assert_ne!(staging_name("empresas"), staging_name("empresas"));
    }
}
