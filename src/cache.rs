//! Per-job cache of resolved lookup keys
//!
//! Source tables routinely repeat the same key across many rows. Each key is
//! looked up at most once per job; later rows with the same key reuse the
//! cached outcome without touching the governor or the network.
//!
//! Only *stable* outcomes are cached: real matches, confirmed no-match, the
//! invalid-key verdict, and the exhaustion sentinel. Transient failures
//! (timeouts, transport errors) are never inserted, so a duplicate key later
//! in the table gets a fresh attempt.
//!
//! The cache is serialized into the job checkpoint, so a resumed job keeps
//! every lookup it already paid for.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One cached, stable outcome for a lookup key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Phones extracted from the reply, comma-joined ("" if none)
    pub extracted: String,
    /// Human-readable summary of the reply (or a sentinel line)
    pub summary: String,
    /// True when this entry records the balance-exhausted sentinel
    #[serde(default)]
    pub exhausted: bool,
}

impl CacheEntry {
    /// Entry for a successfully resolved key
    pub fn resolved(extracted: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            extracted: extracted.into(),
            summary: summary.into(),
            exhausted: false,
        }
    }

    /// Entry recording that the service balance ran out at this key
    pub fn exhausted(extracted: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            extracted: extracted.into(),
            summary: summary.into(),
            exhausted: true,
        }
    }
}

/// Key -> outcome map for one job.
///
/// Plain synchronous map; the runner owns it exclusively and the row loop is
/// sequential, so no interior locking is needed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryCache {
    entries: HashMap<String, CacheEntry>,
}

impl QueryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a previously resolved key
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Record a stable outcome for a key.
    ///
    /// Callers must not insert transient-failure outcomes; that is what keeps
    /// duplicates retryable.
    pub fn insert(&mut self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    /// Number of distinct keys resolved so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no key has been resolved yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
