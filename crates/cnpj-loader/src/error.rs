//! File-level error taxonomy
//!
//! Every variant except the unavailable-destination cases is contained to
//! the file that raised it: the run logs it, leaves the file unmarked and
//! moves on to the next one.

use crate::db::DbError;
use crate::ingest::loader::{LoadError, LoadTactic};
use std::path::PathBuf;
use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Unrecognized file type: {filename}")]
    UnrecognizedFileType { filename: String },

    #[error("Cannot transform {file}: {reason} (detected columns: {})", .detected.join(", "))]
    Transform {
        file: String,
        reason: String,
        detected: Vec<String>,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed delimited text in {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv_async::Error,
    },

    #[error("Load into {table} failed: {source}")]
    Load {
        table: String,
        #[source]
        source: LoadError,
    },

    #[error("Processed-file tracking failed: {0}")]
    Tracker(#[from] DbError),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn transform(
        file: impl Into<String>,
        reason: impl Into<String>,
        detected: Vec<String>,
    ) -> Self {
        Self::Transform {
            file: file.into(),
            reason: reason.into(),
            detected,
        }
    }

    /// The destination could not be reached within the retry budget. No
    /// later file can succeed either, so the run stops.
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::Load { source, .. } => source.is_unavailable(),
            IngestError::Tracker(db) => db.is_unavailable(),
            _ => false,
        }
    }

    /// Tactic that was running when the failure happened, if any.
    pub fn tactic(&self) -> Option<LoadTactic> {
        match self {
            IngestError::Load { source, .. } => source.tactic(),
            _ => None,
        }
    }
}
