// ABOUTME: Error taxonomy for table registration, extraction and checkpoint handling
// ABOUTME: Each variant tells the caller whether a table is broken, misused or retryable

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;
use crate::engine::Batch;

#[derive(Debug, Error)]
pub enum TailError {
    /// Table or column missing from the live schema. Fatal for that table.
    #[error("schema error on table '{table}': {message}")]
    Schema { table: String, message: String },

    /// Table or column outside the configured allow-list.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Query or connection failure while reading a batch. Retry on the next pass.
    ///
    /// `partial` holds whatever was read (and advanced) before the failure so
    /// the caller can still deliver it.
    #[error("extraction failed on table '{table}' after {} records", .partial.records.len())]
    Extraction {
        table: String,
        partial: Box<Batch>,
        #[source]
        source: DbError,
    },

    /// Checkpoint file could not be read or written.
    #[error("checkpoint I/O failed for table '{table}' at {}", .path.display())]
    Persistence {
        table: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint file exists but cannot be parsed.
    #[error("corrupt checkpoint for table '{table}' at {}: {message}", .path.display())]
    CorruptCheckpoint {
        table: String,
        path: PathBuf,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl TailError {
    pub fn schema(table: &str, message: impl Into<String>) -> Self {
        TailError::Schema {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TailError::Extraction { .. } | TailError::Persistence { .. }
        )
    }
}
