//! Per-job batch runner
//!
//! Drives one job through its lifecycle: load the source table, decide
//! between a fresh start and a checkpoint resume, process rows under the
//! rate governor, persist checkpoints and ship partial artifacts on their
//! intervals, and finalize with the complete result workbook.
//!
//! The runner is crash-oriented: every row's outcome lands in [`JobState`]
//! before the next row starts, checkpoint and artifact write failures are
//! logged and retried at the next interval, and a cancellation observed
//! between rows persists a checkpoint before exiting.

use crate::cache::CacheEntry;
use crate::checkpoint::{CheckpointStore, JobState};
use crate::config::Config;
use crate::error::Result;
use crate::formatter::{
    EXHAUSTED_SENTINEL, INVALID_KEY_SENTINEL, LOOKUP_ERROR_SENTINEL, NO_MATCHES_SENTINEL,
    NO_PHONES_SENTINEL, ResultFormatter,
};
use crate::governor::{PauseUpdate, RateGovernor};
use crate::lookup::LookupService;
use crate::messenger::Messenger;
use crate::runner::progress::{ProgressTracker, format_duration, percent, status_line};
use crate::table::{self, SourceTable};
use crate::types::{Event, JobId, LookupReply, RequesterId};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Everything resolved at admission time for one job.
pub(crate) struct JobPlan {
    /// Who asked for the job
    pub requester: RequesterId,
    /// CSV file to process
    pub source_path: PathBuf,
    /// Display name of the source (used for checkpoint matching)
    pub source_name: String,
    /// Id the job was admitted under
    pub job_id: JobId,
    /// Checkpoint found at admission, validated against the table on load
    pub resume: Option<JobState>,
}

/// Executes one job to completion, interruption or failure.
pub(crate) struct BatchRunner {
    pub(crate) config: Arc<Config>,
    pub(crate) governor: Arc<RateGovernor>,
    pub(crate) store: Arc<CheckpointStore>,
    pub(crate) lookup: Arc<dyn LookupService>,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) events: broadcast::Sender<Event>,
    pub(crate) formatter: ResultFormatter,
}

impl BatchRunner {
    /// Run the job described by `plan`.
    ///
    /// `Ok(())` covers both completion and a clean shutdown interruption;
    /// `Err` means the job failed before or during processing and its
    /// checkpoint (if any) was kept for a later resume.
    pub(crate) async fn run(&self, plan: JobPlan, token: CancellationToken) -> Result<()> {
        let table = table::read_csv(&plan.source_path, &self.config.lookup.key_column)?;
        let total = table.rows.len();

        let mut state = self.open_state(&plan, &table).await;
        let started = Instant::now();
        let resumed_from = state.processed;
        let mut tracker = ProgressTracker::new(self.config.progress.update_interval);
        let mut last_artifact: Option<PathBuf> = None;

        for row in state.processed..total {
            if token.is_cancelled() {
                return self.interrupt(&mut state, plan.requester).await;
            }

            let key = table.key(row).to_string();
            let (extracted, summary) = self.resolve_key(&mut state, &key, plan.requester).await;
            state.extracted.push(extracted);
            state.summaries.push(summary);
            state.processed = row + 1;

            if tracker.should_emit() {
                self.emit_progress(&state, plan.requester, started, resumed_from)
                    .await;
            }

            if state.processed % self.config.checkpoint.checkpoint_interval == 0 {
                self.save_checkpoint(&mut state);
                self.refresh_snapshot(&state, &table);
            }

            if state.processed % self.config.checkpoint.artifact_interval == 0
                && state.processed < total
            {
                self.ship_artifact(&state, &table, plan.requester, &mut last_artifact)
                    .await;
            }
        }

        self.finalize(&state, &table, plan.requester, last_artifact, started)
            .await
    }

    /// Decide between resuming the admitted checkpoint and starting fresh.
    ///
    /// A checkpoint is only honored when it still matches the table (same
    /// row count) and has rows left; otherwise the job restarts from zero
    /// under the admitted id.
    async fn open_state(&self, plan: &JobPlan, table: &SourceTable) -> JobState {
        let total = table.rows.len();

        if let Some(saved) = &plan.resume {
            if saved.total_rows == total && saved.processed < total {
                tracing::info!(
                    job_id = %saved.job_id,
                    at = saved.processed,
                    total,
                    "resuming from checkpoint"
                );
                let _ = self.events.send(Event::Resumed {
                    job_id: saved.job_id.clone(),
                    at: saved.processed,
                    total_rows: total,
                });
                self.notify(
                    plan.requester,
                    &format!(
                        "resuming your job from row {} of {}",
                        saved.processed, total
                    ),
                )
                .await;
                return saved.clone();
            }
            tracing::warn!(
                job_id = %saved.job_id,
                saved_total = saved.total_rows,
                total,
                "checkpoint does not match the source table, starting over"
            );
        }

        let unique_keys: HashSet<&str> = (0..total)
            .map(|i| table.key(i))
            .filter(|k| ResultFormatter::is_valid_key(k))
            .collect();
        let eta = self.governor.estimate(unique_keys.len());

        tracing::info!(
            job_id = %plan.job_id,
            total,
            unique_keys = unique_keys.len(),
            "starting new job"
        );
        let _ = self.events.send(Event::JobStarted {
            job_id: plan.job_id.clone(),
            total_rows: total,
            unique_keys: unique_keys.len(),
        });
        self.notify(
            plan.requester,
            &format!(
                "processing {} rows ({} unique keys), worst case about {}",
                total,
                unique_keys.len(),
                format_duration(eta)
            ),
        )
        .await;

        JobState::new(
            plan.job_id.clone(),
            plan.requester,
            plan.source_name.clone(),
            total,
        )
    }

    /// Resolve one row's key to its (extracted, summary) pair.
    ///
    /// Order matters: exhaustion first (once the balance is gone every
    /// remaining row gets the fixed outcome), validity second (free), cache
    /// third, live call last. Transient failures produce the error sentinel
    /// but are never cached.
    async fn resolve_key(
        &self,
        state: &mut JobState,
        key: &str,
        requester: RequesterId,
    ) -> (String, String) {
        if state.exhausted {
            return (
                EXHAUSTED_SENTINEL.to_string(),
                EXHAUSTED_SENTINEL.to_string(),
            );
        }
        if !ResultFormatter::is_valid_key(key) {
            return (
                INVALID_KEY_SENTINEL.to_string(),
                INVALID_KEY_SENTINEL.to_string(),
            );
        }
        if let Some(entry) = state.cache.get(key) {
            let hit = (entry.extracted.clone(), entry.summary.clone(), entry.exhausted);
            if hit.2 {
                // replayed exhaustion marker flips the job into pass-through
                state.exhausted = true;
            }
            return (hit.0, hit.1);
        }

        self.governed_wait(state.job_id.clone(), requester).await;
        let reply = self.lookup.lookup(key).await;
        if !self.config.lookup.inter_call_delay.is_zero() {
            tokio::time::sleep(self.config.lookup.inter_call_delay).await;
        }

        match reply {
            LookupReply::Matches(records) => {
                let phones = self.formatter.extract_phones(&records);
                let extracted = if phones.is_empty() {
                    NO_PHONES_SENTINEL.to_string()
                } else {
                    phones
                };
                let summary = self.formatter.summarize(&records);
                state
                    .cache
                    .insert(key, CacheEntry::resolved(&extracted, &summary));
                (extracted, summary)
            }
            LookupReply::NoMatches => {
                state
                    .cache
                    .insert(key, CacheEntry::resolved("", NO_MATCHES_SENTINEL));
                (String::new(), NO_MATCHES_SENTINEL.to_string())
            }
            LookupReply::QuotaExhausted => {
                tracing::warn!(job_id = %state.job_id, key, "service balance exhausted");
                state.exhausted = true;
                state.cache.insert(
                    key,
                    CacheEntry::exhausted(EXHAUSTED_SENTINEL, EXHAUSTED_SENTINEL),
                );
                self.notify(
                    requester,
                    "the lookup service balance is exhausted; remaining rows will be marked and the partial result delivered",
                )
                .await;
                (
                    EXHAUSTED_SENTINEL.to_string(),
                    EXHAUSTED_SENTINEL.to_string(),
                )
            }
            LookupReply::Failed { message } => {
                tracing::warn!(job_id = %state.job_id, key, message, "lookup failed for row");
                (
                    LOOKUP_ERROR_SENTINEL.to_string(),
                    format!("lookup failed: {message}"),
                )
            }
        }
    }

    /// Block on the governor, relaying pause progress to the requester.
    async fn governed_wait(&self, job_id: JobId, requester: RequesterId) {
        let events = self.events.clone();
        let messenger = Arc::clone(&self.messenger);
        self.governor
            .acquire(move |update| {
                let events = events.clone();
                let messenger = Arc::clone(&messenger);
                let job_id = job_id.clone();
                async move {
                    match update {
                        PauseUpdate::Started { wait } => {
                            let _ = events.send(Event::RatePaused {
                                job_id,
                                wait_secs: wait.as_secs(),
                            });
                            if let Err(e) = messenger
                                .edit_last_status(
                                    requester,
                                    &format!(
                                        "rate limit reached, resuming in {}",
                                        format_duration(wait)
                                    ),
                                )
                                .await
                            {
                                tracing::warn!(error = %e, "failed to deliver pause notice");
                            }
                        }
                        PauseUpdate::Remaining { remaining } => {
                            if let Err(e) = messenger
                                .edit_last_status(
                                    requester,
                                    &format!("still rate limited, {} left", format_duration(remaining)),
                                )
                                .await
                            {
                                tracing::warn!(error = %e, "failed to deliver pause notice");
                            }
                        }
                        PauseUpdate::Finished => {
                            let _ = events.send(Event::RateResumed { job_id });
                        }
                    }
                }
            })
            .await;
    }

    async fn emit_progress(
        &self,
        state: &JobState,
        requester: RequesterId,
        started: Instant,
        resumed_from: usize,
    ) {
        let _ = self.events.send(Event::Progress {
            job_id: state.job_id.clone(),
            processed: state.processed,
            total_rows: state.total_rows,
            unique_keys: state.cache.len(),
            percent: percent(state.processed, state.total_rows),
        });

        // ETA from the observed per-row cost since start or resume
        let done_this_run = state.processed.saturating_sub(resumed_from);
        let mut line = status_line(state.processed, state.total_rows, state.cache.len());
        if done_this_run > 0 && state.processed < state.total_rows {
            let per_row = started.elapsed() / done_this_run as u32;
            let eta = per_row * (state.total_rows - state.processed) as u32;
            line.push_str(&format!(", about {} left", format_duration(eta)));
        }
        self.edit_status(requester, &line).await;
    }

    /// Persist a checkpoint; failures are logged and retried next interval.
    fn save_checkpoint(&self, state: &mut JobState) {
        state.updated_at = Utc::now();
        match self.store.save(state) {
            Ok(()) => {
                let _ = self.events.send(Event::CheckpointSaved {
                    job_id: state.job_id.clone(),
                    processed: state.processed,
                });
            }
            Err(e) => {
                tracing::error!(job_id = %state.job_id, error = %e, "checkpoint save failed");
            }
        }
    }

    /// Overwrite the job's rolling results-so-far workbook.
    fn refresh_snapshot(&self, state: &JobState, table: &SourceTable) {
        let path = self.store.snapshot_path(&state.job_id);
        if let Err(e) = table::write_snapshot_xlsx(
            &path,
            table,
            &state.extracted,
            &state.summaries,
            state.processed,
        ) {
            tracing::error!(job_id = %state.job_id, error = %e, "partial snapshot write failed");
        }
    }

    /// Write and deliver a partial-result workbook, replacing the previous one.
    async fn ship_artifact(
        &self,
        state: &JobState,
        table: &SourceTable,
        requester: RequesterId,
        last_artifact: &mut Option<PathBuf>,
    ) {
        let path = self.store.artifact_path(&state.job_id, state.processed);
        if let Err(e) = table::write_snapshot_xlsx(
            &path,
            table,
            &state.extracted,
            &state.summaries,
            state.processed,
        ) {
            tracing::error!(job_id = %state.job_id, error = %e, "partial artifact write failed");
            return;
        }

        let caption = format!(
            "partial results: {} of {} rows",
            state.processed, state.total_rows
        );
        if let Err(e) = self.messenger.send_file(requester, &path, &caption).await {
            tracing::warn!(job_id = %state.job_id, error = %e, "partial artifact delivery failed");
        }

        if let Some(previous) = last_artifact.take() {
            if let Err(e) = std::fs::remove_file(&previous) {
                tracing::debug!(path = %previous.display(), error = %e, "stale artifact not removed");
            }
        }
        *last_artifact = Some(path);

        let _ = self.events.send(Event::ArtifactDelivered {
            job_id: state.job_id.clone(),
            processed: state.processed,
        });
    }

    /// Write the final result, deliver it, and clean up job residue.
    ///
    /// The final result mirrors the source format: CSV in, CSV out; anything
    /// else gets the workbook.
    async fn finalize(
        &self,
        state: &JobState,
        table: &SourceTable,
        requester: RequesterId,
        last_artifact: Option<PathBuf>,
        started: Instant,
    ) -> Result<()> {
        let from_csv = std::path::Path::new(&state.source_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        let result_path = if from_csv {
            let path = self.store.result_path(&state.job_id, "csv");
            table::write_result_csv(&path, table, &state.extracted, &state.summaries)?;
            path
        } else {
            let path = self.store.result_path(&state.job_id, "xlsx");
            table::write_snapshot_xlsx(
                &path,
                table,
                &state.extracted,
                &state.summaries,
                state.total_rows,
            )?;
            path
        };

        let elapsed = started.elapsed();
        let caption = format!(
            "done: {} rows, {} unique keys, took {}",
            state.total_rows,
            state.cache.len(),
            format_duration(elapsed)
        );
        if let Err(e) = self
            .messenger
            .send_file(requester, &result_path, &caption)
            .await
        {
            tracing::warn!(job_id = %state.job_id, error = %e, "final result delivery failed");
        }

        let mut stale: Vec<PathBuf> = last_artifact.into_iter().collect();
        let snapshot = self.store.snapshot_path(&state.job_id);
        if snapshot.exists() {
            stale.push(snapshot);
        }
        for path in stale {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "stale artifact not removed");
            }
        }
        if let Err(e) = self.store.delete(&state.job_id) {
            tracing::warn!(job_id = %state.job_id, error = %e, "checkpoint cleanup failed");
        }

        tracing::info!(
            job_id = %state.job_id,
            processed = state.processed,
            elapsed_secs = elapsed.as_secs(),
            "job completed"
        );
        let _ = self.events.send(Event::JobCompleted {
            job_id: state.job_id.clone(),
            processed: state.processed,
            unique_keys: state.cache.len(),
            elapsed_secs: elapsed.as_secs(),
        });
        Ok(())
    }

    /// Persist a checkpoint and exit cleanly on shutdown.
    async fn interrupt(&self, state: &mut JobState, requester: RequesterId) -> Result<()> {
        tracing::info!(
            job_id = %state.job_id,
            processed = state.processed,
            "shutdown requested, checkpointing and exiting"
        );
        state.updated_at = Utc::now();
        if let Err(e) = self.store.save(state) {
            tracing::error!(job_id = %state.job_id, error = %e, "checkpoint save on shutdown failed");
        }
        self.notify(
            requester,
            &format!(
                "processing paused at row {} of {}; send the file again to resume",
                state.processed, state.total_rows
            ),
        )
        .await;
        let _ = self.events.send(Event::JobInterrupted {
            job_id: state.job_id.clone(),
            processed: state.processed,
        });
        Ok(())
    }

    async fn notify(&self, requester: RequesterId, text: &str) {
        if let Err(e) = self.messenger.send_text(requester, text).await {
            tracing::warn!(%requester, error = %e, "message delivery failed");
        }
    }

    async fn edit_status(&self, requester: RequesterId, text: &str) {
        if let Err(e) = self.messenger.edit_last_status(requester, text).await {
            tracing::warn!(%requester, error = %e, "status update failed");
        }
    }
}
