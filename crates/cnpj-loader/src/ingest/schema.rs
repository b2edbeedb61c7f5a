//! Positional-to-semantic column mapping and value fixes
//!
//! The same mapper is applied to a whole-file batch and to each chunk
//! window, so both paths produce identical rows.

use super::batch::{Batch, Row};
use super::record_type::RecordType;
use crate::error::{IngestError, IngestResult};

/// Sentinel the publisher uses for "no date".
const EMPTY_DATE: &str = "0";

#[derive(Debug, Clone)]
pub struct SchemaMapper {
    record_type: RecordType,
    columns: Vec<String>,
    numeric: Vec<usize>,
    dates: Vec<usize>,
}

impl SchemaMapper {
    /// Build a mapper for a file whose sampled rows have `width` fields.
    ///
    /// Fields beyond the mapped ones keep their position as `column_{i}`.
    /// A file narrower than the mapping cannot be loaded.
    pub fn for_width(record_type: RecordType, width: usize, file: &str) -> IngestResult<Self> {
        let mapped = record_type.columns();
        if width < mapped.len() {
            let detected = (0..width).map(|i| format!("column_{i}")).collect();
            return Err(IngestError::transform(
                file,
                format!(
                    "{} expects {} columns, found {}",
                    record_type,
                    mapped.len(),
                    width
                ),
                detected,
            ));
        }

        let columns: Vec<String> = (0..width)
            .map(|i| match mapped.get(i) {
                Some(name) => (*name).to_string(),
                None => format!("column_{i}"),
            })
            .collect();

        let position = |name: &&str| columns.iter().position(|c| c.as_str() == *name);
        let numeric = record_type.numeric_columns().iter().filter_map(position).collect();
        let dates = record_type.date_columns().iter().filter_map(position).collect();

        Ok(Self {
            record_type,
            columns,
            numeric,
            dates,
        })
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn apply(&self, mut rows: Vec<Row>) -> Batch {
        for row in &mut rows {
            self.apply_row(row);
        }
        Batch::new(self.columns.clone(), rows)
    }

    pub fn apply_row(&self, row: &mut Row) {
        for value in row.iter_mut() {
            if let Some(text) = value {
                if text.contains('\0') {
                    text.retain(|c| c != '\0');
                    if text.is_empty() {
                        *value = None;
                    }
                }
            }
        }

        for &i in &self.numeric {
            if let Some(cell) = row.get_mut(i) {
                *cell = cell.take().and_then(|raw| normalize_decimal(&raw));
            }
        }

        for &i in &self.dates {
            if let Some(cell) = row.get_mut(i) {
                if cell.as_deref() == Some(EMPTY_DATE) {
                    *cell = None;
                }
            }
        }
    }
}

/// Rewrite a decimal-comma literal (`"1000,50"`) as `"1000.50"`.
/// Anything that is not a finite number after the rewrite becomes `None`.
pub fn normalize_decimal(raw: &str) -> Option<String> {
    let candidate = raw.trim().replace(',', ".");
    match candidate.parse::<f64>() {
        Ok(n) if n.is_finite() => Some(candidate),
        _ => None,
    }
}
