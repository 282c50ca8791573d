//! Error types for bulk-lookup
//!
//! The taxonomy follows the job model:
//! - Configuration problems (`Config`, `MissingColumn`) are fatal and keep a
//!   job from ever starting.
//! - Quota exhaustion and transient lookup failures are *not* errors — they
//!   are classified [`LookupReply`](crate::types::LookupReply) variants that
//!   become per-row sentinel outcomes.
//! - Checkpoint/artifact write failures are logged at the call site and
//!   retried at the next interval; they never appear as an `Error` above the
//!   row loop.
//! - Anything else escaping the row loop is a job-level failure: the runner
//!   reports a short diagnostic to the user and keeps the checkpoint for
//!   resume.

use thiserror::Error;

/// Result type alias for bulk-lookup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bulk-lookup
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "lookup.api_token")
        key: Option<String>,
    },

    /// The source table is missing the required key column
    #[error("required column '{column}' not found in source file")]
    MissingColumn {
        /// The column name that was expected
        column: String,
    },

    /// A batch job is already running for this requester (single-flight guard)
    #[error("a batch job is already active for requester {requester}")]
    JobActive {
        /// The requester that already owns a running job
        requester: i64,
    },

    /// CSV read/write error
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Spreadsheet artifact rendering error
    #[error("spreadsheet error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error from the lookup transport
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error (checkpoint encode/decode)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short diagnostic string suitable for a user-facing message.
    ///
    /// Full detail (including source errors) goes to tracing; users only see
    /// this one-liner.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config { message, .. } => format!("configuration problem: {message}"),
            Error::MissingColumn { column } => {
                format!("the file has no '{column}' column - nothing to process")
            }
            Error::JobActive { .. } => {
                "a job is already running for you; wait for it to finish".to_string()
            }
            Error::Csv(_) => "the source file could not be read as CSV".to_string(),
            Error::ShuttingDown => "the service is shutting down; try again later".to_string(),
            other => format!("processing failed: {other}"),
        }
    }
}
