//! Batch engine facade
//!
//! [`BatchEngine`] wires the governor, checkpoint store, lookup service and
//! messenger together and runs jobs as background tasks. Embedders launch
//! jobs, subscribe to the event stream, and call [`shutdown`](BatchEngine::shutdown)
//! on their way out; everything else happens inside the per-job runner.

pub(crate) mod job;
/// Progress bars, ETAs and status lines
pub mod progress;

#[cfg(test)]
mod tests;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::error::Result;
use crate::formatter::ResultFormatter;
use crate::governor::RateGovernor;
use crate::lookup::{LookupClient, LookupService};
use crate::messenger::{Messenger, NullMessenger};
use crate::registry::JobRegistry;
use crate::runner::job::{BatchRunner, JobPlan};
use crate::types::{Event, GovernorStatus, JobId, LookupReply, RequesterId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A request to process one source file for one requester.
#[derive(Clone, Debug)]
pub struct JobRequest {
    /// Who is asking; also the single-flight key
    pub requester: RequesterId,
    /// Path to the CSV source table
    pub source_path: PathBuf,
}

struct EngineInner {
    config: Arc<Config>,
    governor: Arc<RateGovernor>,
    store: Arc<CheckpointStore>,
    lookup: Arc<dyn LookupService>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<JobRegistry>,
    events: broadcast::Sender<Event>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// The batch processing engine.
///
/// Cheap to clone; all clones share the same governor, registry and event
/// channel.
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

impl BatchEngine {
    /// Build an engine with the production lookup client and no messenger.
    pub fn new(config: Config) -> Result<Self> {
        let lookup = Arc::new(LookupClient::new(config.lookup.clone())?);
        Self::with_services(config, lookup, Arc::new(NullMessenger))
    }

    /// Build an engine with caller-provided service implementations.
    ///
    /// This is the embedding entry point: a chat frontend passes its own
    /// [`Messenger`]; tests pass scripted lookups.
    pub fn with_services(
        config: Config,
        lookup: Arc<dyn LookupService>,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self> {
        config.validate()?;
        // Fail at construction if the phone pattern is unusable
        let _ = ResultFormatter::new()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(EngineInner {
                governor: Arc::new(RateGovernor::new(config.rate_limit.clone())),
                store: Arc::new(CheckpointStore::new(config.checkpoint.clone())),
                config: Arc::new(config),
                lookup,
                messenger,
                registry: Arc::new(JobRegistry::new()),
                events,
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Advisory snapshot of the shared rate governor
    pub fn governor_status(&self) -> GovernorStatus {
        self.inner.governor.status()
    }

    /// Worst-case wall-clock estimate for `calls` governed lookups
    pub fn estimate(&self, calls: usize) -> Duration {
        self.inner.governor.estimate(calls)
    }

    /// Job id of the requester's running job, if any
    pub fn active_job(&self, requester: RequesterId) -> Option<JobId> {
        self.inner.registry.active_job(requester)
    }

    /// One-off governed lookup for a single key.
    ///
    /// Validates the key, waits on the shared governor like any batch row
    /// would, and returns the classified reply. Batch jobs running in
    /// parallel queue behind the same quota window.
    pub async fn check_single(&self, key: &str) -> LookupReply {
        let key = key.trim();
        if !ResultFormatter::is_valid_key(key) {
            return LookupReply::Failed {
                message: crate::formatter::INVALID_KEY_SENTINEL.to_string(),
            };
        }
        self.inner.governor.acquire(|_| async {}).await;
        self.inner.lookup.lookup(key).await
    }

    /// Start a job in the background, returning its id immediately.
    ///
    /// If an interrupted checkpoint exists for the same requester and source
    /// file name, the job resumes under the old id; otherwise a new id is
    /// minted. Fails when the requester already has a running job or the
    /// engine is shutting down.
    pub async fn launch(&self, request: JobRequest) -> Result<JobId> {
        let source_name = request
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.source_path.to_string_lossy().into_owned());

        let resume = self.inner.store.find_latest(request.requester, &source_name);
        let job_id = match &resume {
            Some(saved) => saved.job_id.clone(),
            None => self.inner.store.make_id(request.requester, &source_name),
        };

        let guard = self.inner.registry.begin(request.requester, job_id.clone())?;
        let token = guard.token().clone();

        let runner = BatchRunner {
            config: Arc::clone(&self.inner.config),
            governor: Arc::clone(&self.inner.governor),
            store: Arc::clone(&self.inner.store),
            lookup: Arc::clone(&self.inner.lookup),
            messenger: Arc::clone(&self.inner.messenger),
            events: self.inner.events.clone(),
            formatter: ResultFormatter::new()?,
        };
        let plan = JobPlan {
            requester: request.requester,
            source_path: request.source_path,
            source_name,
            job_id: job_id.clone(),
            resume,
        };

        let events = self.inner.events.clone();
        let messenger = Arc::clone(&self.inner.messenger);
        let task_job_id = job_id.clone();
        let requester = request.requester;
        let handle = tokio::spawn(async move {
            // Guard lives for the duration of the task so the slot frees
            // itself even if the runner panics.
            let _slot = guard;
            if let Err(e) = runner.run(plan, token).await {
                tracing::error!(job_id = %task_job_id, error = %e, "job failed");
                let _ = events.send(Event::JobFailed {
                    job_id: task_job_id,
                    error: e.user_message(),
                });
                if let Err(send_err) = messenger.send_text(requester, &e.user_message()).await {
                    tracing::warn!(error = %send_err, "failed to deliver failure notice");
                }
            }
        });
        self.inner.tasks.lock().await.push(handle);

        Ok(job_id)
    }

    /// Wait for all launched jobs to finish without interrupting them.
    pub async fn wait_for_jobs(&self) {
        let handles: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "job task panicked");
            }
        }
    }

    /// Graceful shutdown: refuse new jobs, signal running jobs to checkpoint
    /// and exit, then wait for their tasks.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("batch engine shutting down");
        self.inner.registry.shutdown();
        self.wait_for_jobs().await;
        Ok(())
    }
}
