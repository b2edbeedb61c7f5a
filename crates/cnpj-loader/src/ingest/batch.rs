//! Header-less `;`-delimited reader producing row windows
//!
//! The reader is a finite producer: it yields windows of at most `n` rows
//! until the file is exhausted. It cannot seek, so a retry of a file starts
//! over from the first byte with a fresh [`BatchReader`].

use crate::error::{IngestError, IngestResult};
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::File;
use tracing::{debug, warn};

/// Rows inspected to fix the column count of a file
pub const SAMPLE_ROWS: usize = 100;

const READ_BUFFER_BYTES: usize = 1 << 20;

/// One row; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Rows with a fixed column schema, handed to the loader in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

pub struct BatchReader {
    file: String,
    reader: AsyncReader<File>,
    record: StringRecord,
    sampled: VecDeque<Row>,
    width: Option<usize>,
    rows_read: u64,
    ragged_rows: u64,
    exhausted: bool,
}

impl BatchReader {
    /// Open a UTF-8 file. `label` names the file in errors and logs.
    pub async fn open(path: &Path, label: &str) -> IngestResult<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| IngestError::io(path, e))?;

        let reader = AsyncReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .flexible(true)
            .buffer_capacity(READ_BUFFER_BYTES)
            .create_reader(file);

        Ok(Self {
            file: label.to_string(),
            reader,
            record: StringRecord::new(),
            sampled: VecDeque::new(),
            width: None,
            rows_read: 0,
            ragged_rows: 0,
            exhausted: false,
        })
    }

    /// Read up to [`SAMPLE_ROWS`] rows and fix the column count to the widest
    /// of them. Returns 0 for an empty file. Sampled rows are replayed by the
    /// following [`next_window`](Self::next_window) calls.
    pub async fn sample(&mut self) -> IngestResult<usize> {
        if let Some(width) = self.width {
            return Ok(width);
        }

        let mut raw = Vec::with_capacity(SAMPLE_ROWS);
        while raw.len() < SAMPLE_ROWS {
            match self.read_raw().await? {
                Some(fields) => raw.push(fields),
                None => break,
            }
        }

        let width = raw.iter().map(Vec::len).max().unwrap_or(0);
        self.width = Some(width);
        let mut fitted = VecDeque::with_capacity(raw.len());
        for (line, row) in (1..).zip(raw) {
            fitted.push_back(self.fit(row, line)?);
        }
        self.sampled = fitted;

        debug!(file = %self.file, width, sampled = self.sampled.len(), "Sampled column schema");
        Ok(width)
    }

    /// Next window of at most `max_rows` rows, or `None` when exhausted.
    pub async fn next_window(&mut self, max_rows: usize) -> IngestResult<Option<Vec<Row>>> {
        self.sample().await?;
        let max_rows = max_rows.max(1);

        let mut rows = Vec::with_capacity(max_rows.min(self.sampled.len() + 64 * 1024));
        while rows.len() < max_rows {
            if let Some(row) = self.sampled.pop_front() {
                rows.push(row);
                continue;
            }
            match self.read_raw().await? {
                Some(fields) => {
                    let row = self.fit(fields, self.rows_read)?;
                    rows.push(row);
                },
                None => break,
            }
        }

        if rows.is_empty() {
            if self.ragged_rows > 0 {
                warn!(
                    file = %self.file,
                    ragged_rows = self.ragged_rows,
                    "Rows narrower than the sampled schema were padded with nulls"
                );
                self.ragged_rows = 0;
            }
            return Ok(None);
        }
        Ok(Some(rows))
    }

    /// Drain the remaining rows into memory.
    pub async fn read_all(&mut self) -> IngestResult<Vec<Row>> {
        let mut all = Vec::new();
        while let Some(mut window) = self.next_window(usize::MAX).await? {
            all.append(&mut window);
        }
        Ok(all)
    }

    /// Physical rows read so far, including sampled rows not yet replayed.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    async fn read_raw(&mut self) -> IngestResult<Option<Vec<Option<String>>>> {
        if self.exhausted {
            return Ok(None);
        }

        let more = self
            .reader
            .read_record(&mut self.record)
            .await
            .map_err(|source| IngestError::Csv {
                file: self.file.clone(),
                source,
            })?;

        if !more {
            self.exhausted = true;
            return Ok(None);
        }

        self.rows_read += 1;
        let fields = self
            .record
            .iter()
            .map(|field| (!field.is_empty()).then(|| field.to_string()))
            .collect();
        Ok(Some(fields))
    }

    /// Pad a short row to the sampled width. A wider row would lose its
    /// trailing fields, so it fails the file instead.
    fn fit(&mut self, mut row: Vec<Option<String>>, line: u64) -> IngestResult<Row> {
        let width = self.width.unwrap_or(row.len());
        if row.len() > width {
            return Err(IngestError::transform(
                self.file.clone(),
                format!(
                    "row {line} has {} columns but the first {SAMPLE_ROWS} rows have at most {width}",
                    row.len()
                ),
                (0..row.len()).map(|i| format!("column_{i}")).collect(),
            ));
        }
        if row.len() < width {
            self.ragged_rows += 1;
            row.resize(width, None);
        }
        Ok(row)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn reader_for(content: &str) -> (tempfile::TempDir, BatchReader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        tokio::fs::write(&path, content).await.unwrap();
        let reader = BatchReader::open(&path, "input.csv").await.unwrap();
        (dir, reader)
    }

    #[tokio::test]
    async fn test_empty_fields_become_null() {
        let (_dir, mut reader) = reader_for("\"01\";\"\";\"x\"\n\"02\";;\"y\"\n").await;

        assert_eq!(reader.sample().await.unwrap(), 3);
        let rows = reader.read_all().await.unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("01".into()), None, Some("x".into())],
                vec![Some("02".into()), None, Some("y".into())],
            ]
        );
    }

    #[tokio::test]
    async fn test_windows_cover_file_exactly_once() {
        let content: String = (0..250).map(|i| format!("{i};v{i}\n")).collect();
        let (_dir, mut reader) = reader_for(&content).await;

        let mut sizes = Vec::new();
        let mut first_values = Vec::new();
        while let Some(window) = reader.next_window(100).await.unwrap() {
            sizes.push(window.len());
            first_values.push(window[0][0].clone().unwrap());
        }

        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(first_values, vec!["0", "100", "200"]);
        assert_eq!(reader.rows_read(), 250);
        assert!(reader.next_window(100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_rows_padded_to_sampled_width() {
        let (_dir, mut reader) = reader_for("a;b;c\nd\n").await;
        let rows = reader.read_all().await.unwrap();
        assert_eq!(rows[1], vec![Some("d".into()), None, None]);
    }

    #[tokio::test]
    async fn test_row_wider_than_sample_fails() {
        let mut content: String = (0..SAMPLE_ROWS).map(|i| format!("{i};v{i}\n")).collect();
        content.push_str("100;v100;extra\n");
        let (_dir, mut reader) = reader_for(&content).await;

        assert_eq!(reader.sample().await.unwrap(), 2);
        let first = reader.next_window(SAMPLE_ROWS).await.unwrap().unwrap();
        assert_eq!(first.len(), SAMPLE_ROWS);

        match reader.next_window(SAMPLE_ROWS).await.unwrap_err() {
            IngestError::Transform { reason, detected, .. } => {
                assert!(reason.starts_with("row 101 has 3 columns"), "{reason}");
                assert_eq!(detected, vec!["column_0", "column_1", "column_2"]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_file_has_zero_width() {
        let (_dir, mut reader) = reader_for("").await;
        assert_eq!(reader.sample().await.unwrap(), 0);
        assert!(reader.next_window(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quoted_delimiter_is_kept() {
        let (_dir, mut reader) = reader_for("\"1\";\"RUA A; LOTE 2\"\n").await;
        let rows = reader.read_all().await.unwrap();
        assert_eq!(rows[0][1].as_deref(), Some("RUA A; LOTE 2"));
    }
}
