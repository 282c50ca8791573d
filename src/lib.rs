//! # bulk-lookup
//!
//! Rate-limited, checkpointed batch lookup engine for long-running contact
//! enrichment jobs.
//!
//! ## Design Philosophy
//!
//! bulk-lookup is designed to be:
//! - **Quota-honest** - one shared governor enforces the paid service's call
//!   budget across every job in the process
//! - **Crash-oriented** - progress is checkpointed on a fixed row interval,
//!   so an interrupted job resumes from its last save instead of re-paying
//!   for finished lookups
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding;
//!   the messaging transport is a trait the embedder implements
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use bulk_lookup::{BatchEngine, Config, JobRequest, RequesterId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         lookup: bulk_lookup::LookupConfig {
//!             api_token: "secret".to_string(),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!
//!     let engine = BatchEngine::new(config)?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     engine
//!         .launch(JobRequest {
//!             requester: RequesterId(100),
//!             source_path: "contacts.csv".into(),
//!         })
//!         .await?;
//!
//!     engine.wait_for_jobs().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Per-job cache of resolved lookup keys
pub mod cache;
/// Durable job checkpoints
pub mod checkpoint;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Reply formatting, phone extraction and sentinels
pub mod formatter;
/// Quota window rate governing
pub mod governor;
/// External lookup service client
pub mod lookup;
/// Outbound messaging seam
pub mod messenger;
/// Single-flight job registry
pub mod registry;
/// Batch engine and per-job runner
pub mod runner;
/// Tabular row source and result sinks
pub mod table;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use cache::{CacheEntry, QueryCache};
pub use checkpoint::{CheckpointStore, JobState};
pub use config::{CheckpointConfig, Config, LookupConfig, ProgressConfig, RateLimitConfig};
pub use error::{Error, Result};
pub use formatter::ResultFormatter;
pub use governor::{PauseUpdate, RateGovernor};
pub use lookup::{LookupClient, LookupService};
pub use messenger::{Messenger, NullMessenger};
pub use registry::JobRegistry;
pub use runner::{BatchEngine, JobRequest};
pub use types::{Event, GovernorStatus, JobId, LookupReply, RequesterId};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()`
/// method, which checkpoints running jobs before returning.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use bulk_lookup::{BatchEngine, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut config = Config::default();
///     config.lookup.api_token = "secret".to_string();
///     let engine = BatchEngine::new(config)?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(engine).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: BatchEngine) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Handler registration can fail in sandboxed runtimes; degrade to
    // whichever signals are still available.
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut term), Ok(mut int)) => {
            tokio::select! {
                _ = term.recv() => tracing::info!("SIGTERM received"),
                _ = int.recv() => tracing::info!("SIGINT received"),
            }
        }
        (Ok(mut term), Err(e)) => {
            tracing::warn!(error = %e, "no SIGINT handler, waiting on SIGTERM");
            term.recv().await;
            tracing::info!("SIGTERM received");
        }
        (Err(e), Ok(mut int)) => {
            tracing::warn!(error = %e, "no SIGTERM handler, waiting on SIGINT");
            int.recv().await;
            tracing::info!("SIGINT received");
        }
        (Err(term_err), Err(int_err)) => {
            tracing::warn!(
                sigterm_error = %term_err,
                sigint_error = %int_err,
                "unix signal handlers unavailable, falling back to ctrl_c"
            );
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "ctrl_c listener failed");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl_c listener failed");
    } else {
        tracing::info!("Ctrl+C received");
    }
}
