//! Error taxonomy.
//!
//! - [`ParseError`]: per-line parser failures. Recoverable except for I/O.
//! - [`JobError`]: fatal errors that abort a running job and mark it failed.
//!   `Display` is what the job's error list shows, so it never carries raw
//!   storage text; the source chain is only logged.
//! - [`BulkError`]: errors returned to callers creating or querying jobs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: malformed record: {message}")]
    Malformed { line: u64, message: String },

    #[error("line {line}: exceeds maximum length of {limit} bytes")]
    LineTooLong { line: u64, limit: usize },

    #[error("source read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Only a failing reader ends the stream; everything else is skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::Io(_))
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("batch write failed for rows {first_row}..={last_row}")]
    BatchWrite {
        first_row: u64,
        last_row: u64,
        #[source]
        source: sqlx::Error,
    },

    #[error("orphan reconciliation failed")]
    Reconcile(#[source] sqlx::Error),

    #[error("export read failed")]
    ExportRead(#[source] sqlx::Error),

    #[error("export output failed: {0}")]
    Output(#[source] std::io::Error),

    #[error("job bookkeeping failed")]
    Bookkeeping(#[source] anyhow::Error),

    #[error("job worker panicked")]
    Panicked,

    #[error("job worker was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum BulkError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for BulkError {
    fn from(err: sqlx::Error) -> Self {
        BulkError::Internal(err.into())
    }
}

impl From<std::io::Error> for BulkError {
    fn from(err: std::io::Error) -> Self {
        BulkError::Internal(err.into())
    }
}
