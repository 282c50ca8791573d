//! Outbound messaging seam
//!
//! The engine reports progress and delivers artifacts to whoever requested
//! the job, but it does not know (or care) what the transport is. A chat
//! frontend implements [`Messenger`] over its bot API; services that only
//! consume the event stream plug in the [`NullMessenger`].
//!
//! Delivery failures are the callee's problem to signal via `Err`; the
//! runner logs them and keeps processing. A lost status message must never
//! kill a half-finished batch.

use crate::error::Result;
use crate::types::RequesterId;
use async_trait::async_trait;
use std::path::Path;

/// Transport used to reach the job's requester.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a standalone text message
    async fn send_text(&self, requester: RequesterId, text: &str) -> Result<()>;

    /// Send a file with a short caption
    async fn send_file(&self, requester: RequesterId, path: &Path, caption: &str) -> Result<()>;

    /// Update the requester's rolling status line.
    ///
    /// Implementations that can edit a previously sent message should do so;
    /// others may send a fresh message. Called frequently, so implementations
    /// should be cheap.
    async fn edit_last_status(&self, requester: RequesterId, text: &str) -> Result<()>;
}

/// Messenger that discards everything (with a debug trace).
///
/// Default for embedders that watch the engine's event stream instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMessenger;

#[async_trait]
impl Messenger for NullMessenger {
    async fn send_text(&self, requester: RequesterId, text: &str) -> Result<()> {
        tracing::debug!(%requester, text, "send_text (null messenger)");
        Ok(())
    }

    async fn send_file(&self, requester: RequesterId, path: &Path, caption: &str) -> Result<()> {
        tracing::debug!(%requester, path = %path.display(), caption, "send_file (null messenger)");
        Ok(())
    }

    async fn edit_last_status(&self, requester: RequesterId, text: &str) -> Result<()> {
        tracing::debug!(%requester, text, "edit_last_status (null messenger)");
        Ok(())
    }
}
