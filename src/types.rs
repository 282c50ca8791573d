//! Core types for bulk-lookup

use serde::{Deserialize, Serialize};

/// Unique identifier for a batch job.
///
/// Derived from requester + source file name + start time, truncated to a
/// fixed width (see [`CheckpointStore::make_id`](crate::checkpoint::CheckpointStore::make_id)).
/// Doubles as the checkpoint key and the artifact filename suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of the user who requested a job (messaging user id).
///
/// The single-flight guard is keyed by this value: at most one active job per
/// requester at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(pub i64);

impl RequesterId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RequesterId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single field value in a matched record.
///
/// The lookup service returns loosely-typed payloads; we model the two shapes
/// that actually occur (scalar and list) instead of passing raw JSON around.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// A single scalar value, rendered as text
    Text(String),
    /// A list of values (e.g., several phone numbers in one field)
    List(Vec<String>),
}

impl FieldValue {
    /// True if the value carries no content (empty string or empty list)
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::List(items) => items.is_empty(),
        }
    }
}

/// One matched record from the lookup service.
///
/// Field order is preserved as received so summaries render the way the
/// source presented the data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Label of the dataset this record came from
    pub source: String,
    /// Ordered field name/value pairs (empty values are dropped at decode time)
    pub fields: Vec<(String, FieldValue)>,
}

/// Classified reply from one external lookup call.
///
/// Every failure mode of the transport is folded into this enum; the lookup
/// client never returns `Err`. `QuotaExhausted` and `Failed` drive fixed
/// per-row sentinel outcomes rather than error propagation.
#[derive(Clone, Debug, PartialEq)]
pub enum LookupReply {
    /// The service found one or more records for the key
    Matches(Vec<Record>),
    /// The call succeeded but nothing matched
    NoMatches,
    /// The service can no longer serve paid lookups (balance/quota gone).
    /// Once seen, all remaining rows resolve to the exhaustion sentinel
    /// without further calls.
    QuotaExhausted,
    /// Transient failure (timeout, transport error, unexpected status).
    /// The row is marked as errored but the key is never cached, so a later
    /// duplicate retries.
    Failed {
        /// Short description of what went wrong
        message: String,
    },
}

/// Advisory snapshot of the rate governor's window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernorStatus {
    /// Calls admitted in the current window
    pub used: u32,
    /// Calls left before the governor starts blocking
    pub remaining: u32,
    /// Minutes until the current window elapses (0 if no window is open)
    pub minutes_to_reset: f64,
}

/// Event emitted during a batch job's lifecycle.
///
/// Consumers subscribe via the engine's broadcast channel; no polling needed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new job started from row zero
    JobStarted {
        /// Job ID
        job_id: JobId,
        /// Total rows in the source table
        total_rows: usize,
        /// Number of distinct lookup keys
        unique_keys: usize,
    },

    /// A job resumed from a saved checkpoint
    Resumed {
        /// Job ID
        job_id: JobId,
        /// Row index processing resumes at
        at: usize,
        /// Total rows in the source table
        total_rows: usize,
    },

    /// Periodic progress update (wall-clock driven)
    Progress {
        /// Job ID
        job_id: JobId,
        /// Rows fully resolved so far
        processed: usize,
        /// Total rows in the source table
        total_rows: usize,
        /// Distinct keys resolved so far (cache size)
        unique_keys: usize,
        /// Percent complete (0.0 to 100.0)
        percent: f32,
    },

    /// The rate governor hit the quota and is pausing the job
    RatePaused {
        /// Job ID
        job_id: JobId,
        /// Seconds until the window resets
        wait_secs: u64,
    },

    /// The rate governor's pause finished; processing continues
    RateResumed {
        /// Job ID
        job_id: JobId,
    },

    /// A checkpoint was durably saved
    CheckpointSaved {
        /// Job ID
        job_id: JobId,
        /// Rows covered by the checkpoint
        processed: usize,
    },

    /// A partial-result artifact was delivered to the requester
    ArtifactDelivered {
        /// Job ID
        job_id: JobId,
        /// Rows covered by the artifact
        processed: usize,
    },

    /// The job finished and the final artifact was delivered
    JobCompleted {
        /// Job ID
        job_id: JobId,
        /// Rows processed in total
        processed: usize,
        /// Distinct keys that were actually looked up or cached
        unique_keys: usize,
        /// Total wall-clock seconds for the run (since start or resume)
        elapsed_secs: u64,
    },

    /// The job hit an unrecoverable error; checkpoint kept for resume
    JobFailed {
        /// Job ID
        job_id: JobId,
        /// Short diagnostic string (detail is logged, not shown)
        error: String,
    },

    /// The job was interrupted by shutdown after persisting a checkpoint
    JobInterrupted {
        /// Job ID
        job_id: JobId,
        /// Rows covered by the checkpoint written on the way out
        processed: usize,
    },
}
