//! Durable job checkpoints
//!
//! A long batch job can outlive the process (crash, deploy, shutdown). The
//! [`CheckpointStore`] persists a [`JobState`] snapshot every N rows so a new
//! process can pick up from the last saved row instead of re-paying for every
//! lookup.
//!
//! Checkpoints are single JSON files, one per job, written with a
//! temp-then-rename dance so a crash mid-write can never leave a truncated
//! checkpoint behind. A checkpoint that fails to decode is treated as absent,
//! never as a fatal error: the worst case is re-doing work, not losing the
//! job.

use crate::cache::QueryCache;
use crate::config::CheckpointConfig;
use crate::error::Result;
use crate::types::{JobId, RequesterId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Snapshot of one job's resumable progress.
///
/// `extracted` and `summaries` are parallel to the source rows: both always
/// have exactly `processed` entries. On resume, rows past `processed` are
/// re-processed; anything resolved after the last save is lost by design.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobState {
    /// The job this snapshot belongs to
    pub job_id: JobId,
    /// Who requested the job
    pub requester: RequesterId,
    /// Source file name the job was started from
    pub source_name: String,
    /// Total rows in the source table
    pub total_rows: usize,
    /// Rows fully resolved (also the resume index)
    pub processed: usize,
    /// Per-row extracted phones, comma-joined, parallel to rows 0..processed
    pub extracted: Vec<String>,
    /// Per-row reply summaries, parallel to rows 0..processed
    pub summaries: Vec<String>,
    /// Resolved-key cache carried across the resume
    pub cache: QueryCache,
    /// True once the service reported its balance exhausted
    #[serde(default)]
    pub exhausted: bool,
    /// When this snapshot was written
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    /// Fresh state for a job starting at row zero
    pub fn new(
        job_id: JobId,
        requester: RequesterId,
        source_name: impl Into<String>,
        total_rows: usize,
    ) -> Self {
        Self {
            job_id,
            requester,
            source_name: source_name.into(),
            total_rows,
            processed: 0,
            extracted: Vec::new(),
            summaries: Vec::new(),
            cache: QueryCache::new(),
            exhausted: false,
            updated_at: Utc::now(),
        }
    }
}

/// File-per-job checkpoint store rooted at a configured directory.
pub struct CheckpointStore {
    config: CheckpointConfig,
}

impl CheckpointStore {
    /// Create a store; directories are created lazily on first write.
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    /// Derive a job id from requester, source file name and the current time.
    ///
    /// SHA-256 of `"{requester}_{source}_{unix_seconds}"`, truncated to 12 hex
    /// characters. Stable enough to key files, short enough for filenames and
    /// user-visible messages.
    pub fn make_id(&self, requester: RequesterId, source_name: &str) -> JobId {
        let seed = format!("{}_{}_{}", requester, source_name, Utc::now().timestamp());
        let digest = Sha256::digest(seed.as_bytes());
        let mut hex = String::with_capacity(12);
        for byte in digest.iter().take(6) {
            // 6 bytes -> 12 hex chars
            hex.push_str(&format!("{byte:02x}"));
        }
        JobId(hex)
    }

    /// Path of the checkpoint file for a job
    pub fn checkpoint_path(&self, job_id: &JobId) -> PathBuf {
        self.config
            .checkpoint_dir
            .join(format!("checkpoint_{job_id}.json"))
    }

    /// Path for a partial-result artifact covering `processed` rows
    pub fn artifact_path(&self, job_id: &JobId, processed: usize) -> PathBuf {
        self.config
            .temp_dir
            .join(format!("partial_{processed}_{job_id}.xlsx"))
    }

    /// Path of the job's rolling partial snapshot, overwritten at every
    /// checkpoint so there is always a readable results-so-far file on disk
    pub fn snapshot_path(&self, job_id: &JobId) -> PathBuf {
        self.config.temp_dir.join(format!("partial_{job_id}.xlsx"))
    }

    /// Path for the final result artifact of a job.
    ///
    /// `extension` matches the output format: `csv` when the source table was
    /// CSV, `xlsx` otherwise.
    pub fn result_path(&self, job_id: &JobId, extension: &str) -> PathBuf {
        self.config
            .temp_dir
            .join(format!("result_{job_id}.{extension}"))
    }

    /// Durably persist a job snapshot.
    ///
    /// Writes to a `.tmp` sibling first and renames into place, so readers
    /// only ever see a complete file.
    pub fn save(&self, state: &JobState) -> Result<()> {
        std::fs::create_dir_all(&self.config.checkpoint_dir)?;
        let path = self.checkpoint_path(&state.job_id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(state)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(
            job_id = %state.job_id,
            processed = state.processed,
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load a job snapshot by id.
    ///
    /// Returns `None` when the file is missing or does not decode; a corrupt
    /// checkpoint is logged and treated as absent.
    pub fn load(&self, job_id: &JobId) -> Option<JobState> {
        Self::load_file(&self.checkpoint_path(job_id))
    }

    /// Find the most recent checkpoint for a requester + source file pair.
    ///
    /// Job ids embed the start time, so a fresh invocation cannot recompute
    /// the id of an interrupted run; instead the store scans its directory
    /// and picks the newest matching snapshot.
    pub fn find_latest(&self, requester: RequesterId, source_name: &str) -> Option<JobState> {
        let entries = std::fs::read_dir(&self.config.checkpoint_dir).ok()?;
        let mut best: Option<JobState> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(state) = Self::load_file(&path) else {
                continue;
            };
            if state.requester != requester || state.source_name != source_name {
                continue;
            }
            match &best {
                Some(current) if current.updated_at >= state.updated_at => {}
                _ => best = Some(state),
            }
        }
        best
    }

    /// Remove a job's checkpoint; missing files are not an error.
    pub fn delete(&self, job_id: &JobId) -> Result<()> {
        let path = self.checkpoint_path(job_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, "checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory that transient artifacts are written under
    pub fn temp_dir(&self) -> &Path {
        &self.config.temp_dir
    }

    fn load_file(path: &Path) -> Option<JobState> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "checkpoint unreadable, ignoring");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "checkpoint corrupt, ignoring");
                None
            }
        }
    }
}
