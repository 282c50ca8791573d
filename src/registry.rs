//! Single-flight job registry
//!
//! At most one active job per requester. The registry hands out a guard per
//! admitted job; dropping the guard (normal completion, failure or panic of
//! the job task) frees the slot. Shutdown cancels every active job's token
//! and refuses new admissions.

use crate::error::{Error, Result};
use crate::types::{JobId, RequesterId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct ActiveJob {
    job_id: JobId,
}

/// Tracks which requesters currently have a running job.
pub struct JobRegistry {
    active: Mutex<HashMap<RequesterId, ActiveJob>>,
    /// Root shutdown token; every job token is a child of it
    shutdown: CancellationToken,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Admit a job for `requester`, enforcing single-flight.
    ///
    /// Fails with [`Error::JobActive`] while the requester already owns a
    /// running job, and with [`Error::ShuttingDown`] once shutdown started.
    /// The returned guard carries the job's cancellation token and releases
    /// the slot when dropped.
    pub fn begin(self: &Arc<Self>, requester: RequesterId, job_id: JobId) -> Result<JobGuard> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let mut active = self.lock_active();
        if active.contains_key(&requester) {
            return Err(Error::JobActive {
                requester: requester.get(),
            });
        }
        let token = self.shutdown.child_token();
        active.insert(
            requester,
            ActiveJob {
                job_id: job_id.clone(),
            },
        );
        tracing::info!(%requester, %job_id, "job admitted");
        Ok(JobGuard {
            registry: Arc::clone(self),
            requester,
            token,
        })
    }

    /// Job id of the requester's active job, if any
    pub fn active_job(&self, requester: RequesterId) -> Option<JobId> {
        self.lock_active()
            .get(&requester)
            .map(|job| job.job_id.clone())
    }

    /// Number of jobs currently running
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Begin shutdown: cancel every active job's token and refuse new jobs.
    ///
    /// Running jobs observe their token between rows, persist a checkpoint
    /// and exit; callers should wait for their tasks afterwards.
    pub fn shutdown(&self) {
        let count = self.active_count();
        tracing::info!(active_jobs = count, "registry shutting down");
        self.shutdown.cancel();
    }

    /// True once shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn release(&self, requester: RequesterId) {
        if self.lock_active().remove(&requester).is_some() {
            tracing::debug!(%requester, "job slot released");
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<RequesterId, ActiveJob>> {
        // Entries are plain data; a poisoned map is still consistent.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission ticket for one running job.
///
/// Holds the job's cancellation token; dropping the guard frees the
/// requester's single-flight slot.
pub struct JobGuard {
    registry: Arc<JobRegistry>,
    requester: RequesterId,
    token: CancellationToken,
}

impl JobGuard {
    /// Cancellation token for this job (child of the registry's shutdown token)
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobGuard")
            .field("requester", &self.requester)
            .finish_non_exhaustive()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.release(self.requester);
    }
}
