//! Behavioral tests for the batch engine
//!
//! Drive whole jobs through [`BatchEngine`] with a scripted lookup service
//! and a recording messenger, asserting on the event stream and on what was
//! persisted and delivered.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::checkpoint::{CheckpointStore, JobState};
use crate::config::RateLimitConfig;
use crate::formatter::{EXHAUSTED_SENTINEL, INVALID_KEY_SENTINEL, LOOKUP_ERROR_SENTINEL};
use crate::lookup::LookupService;
use crate::types::{FieldValue, LookupReply, Record};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

/// Lookup service that replays scripted replies and records every call.
struct ScriptedLookup {
    replies: Mutex<HashMap<String, VecDeque<LookupReply>>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedLookup {
    fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Queue a reply for `key`; the last queued reply repeats forever.
    fn script(&self, key: &str, reply: LookupReply) {
        self.replies
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LookupService for ScriptedLookup {
    async fn lookup(&self, key: &str) -> LookupReply {
        self.calls.lock().unwrap().push(key.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(LookupReply::NoMatches),
            None => LookupReply::NoMatches,
        }
    }
}

/// Messenger that records everything it is asked to deliver.
#[derive(Default)]
struct RecordingMessenger {
    texts: Mutex<Vec<String>>,
    files: Mutex<Vec<PathBuf>>,
    statuses: Mutex<Vec<String>>,
}

#[async_trait]
impl crate::messenger::Messenger for RecordingMessenger {
    async fn send_text(&self, _requester: RequesterId, text: &str) -> crate::error::Result<()> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_file(
        &self,
        _requester: RequesterId,
        path: &Path,
        _caption: &str,
    ) -> crate::error::Result<()> {
        self.files.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn edit_last_status(
        &self,
        _requester: RequesterId,
        text: &str,
    ) -> crate::error::Result<()> {
        self.statuses.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.lookup.api_token = "test-token".into();
    config.lookup.inter_call_delay = Duration::ZERO;
    config.rate_limit = RateLimitConfig {
        quota: 100,
        window: Duration::from_millis(200),
        wait_notice_interval: Duration::from_millis(20),
        avg_call_cost: Duration::from_millis(10),
    };
    config.checkpoint.checkpoint_dir = dir.path().join("checkpoints");
    config.checkpoint.temp_dir = dir.path().join("temp");
    config.checkpoint.checkpoint_interval = 2;
    config.checkpoint.artifact_interval = 3;
    config.progress.update_interval = Duration::ZERO;
    config
}

fn write_source(dir: &TempDir, name: &str, keys: &[&str]) -> PathBuf {
    let mut content = String::from("tax_id\n");
    for key in keys {
        content.push_str(key);
        content.push('\n');
    }
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn matched_reply(phone: &str) -> LookupReply {
    LookupReply::Matches(vec![Record {
        source: "registry".to_string(),
        fields: vec![("phone".to_string(), FieldValue::Text(phone.to_string()))],
    }])
}

fn engine_with(
    config: Config,
    lookup: Arc<ScriptedLookup>,
    messenger: Arc<RecordingMessenger>,
) -> BatchEngine {
    BatchEngine::with_services(config, lookup, messenger).unwrap()
}

/// Drain events until a terminal one arrives.
async fn run_to_terminal(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a terminal event")
            .expect("event channel closed");
        let terminal = matches!(
            event,
            Event::JobCompleted { .. } | Event::JobFailed { .. } | Event::JobInterrupted { .. }
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn completes_a_job_and_calls_each_distinct_key_once() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::new());
    lookup.script("7701234567", matched_reply("+79990001122"));
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), Arc::clone(&lookup), Arc::clone(&messenger));

    let source = write_source(
        &dir,
        "contacts.csv",
        &[
            "7701234567",
            "7707654321",
            "7701234567",
            "7701234567",
            "7707654321",
        ],
    );
    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    let Some(Event::JobCompleted {
        processed,
        unique_keys,
        ..
    }) = events.last()
    else {
        panic!("expected completion, got {:?}", events.last());
    };
    assert_eq!(*processed, 5);
    assert_eq!(*unique_keys, 2);
    // 2 distinct keys across 5 rows: exactly 2 live calls
    assert_eq!(lookup.calls().len(), 2);
    // final result was delivered
    assert!(!messenger.files.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_keys_resolve_without_service_calls() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), Arc::clone(&lookup), messenger);

    let source = write_source(&dir, "contacts.csv", &["12345", "not-a-key", ""]);
    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));
    assert!(lookup.calls().is_empty(), "no key was valid, no call allowed");
}

#[tokio::test]
async fn exhaustion_marks_remaining_rows_without_further_calls() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::new());
    lookup.script("1111111111", LookupReply::QuotaExhausted);
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), Arc::clone(&lookup), Arc::clone(&messenger));

    let source = write_source(
        &dir,
        "contacts.csv",
        &["1111111111", "2222222222", "3333333333"],
    );
    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));
    // only the first key reached the service
    assert_eq!(lookup.calls(), vec!["1111111111"]);
    // the requester was told about the exhaustion
    let texts = messenger.texts.lock().unwrap();
    assert!(texts.iter().any(|t| t.contains("exhausted")));
}

#[tokio::test]
async fn transient_failure_is_not_cached_so_a_duplicate_retries() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::new());
    lookup.script(
        "7701234567",
        LookupReply::Failed {
            message: "timeout".into(),
        },
    );
    lookup.script("7701234567", matched_reply("+79990001122"));
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), Arc::clone(&lookup), messenger);

    let source = write_source(&dir, "contacts.csv", &["7701234567", "7701234567"]);
    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));
    // failed first attempt must not be cached: the duplicate tries again
    assert_eq!(lookup.calls().len(), 2);
}

#[tokio::test]
async fn quota_pauses_are_reported_per_window() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.rate_limit.quota = 2;
    let lookup = Arc::new(ScriptedLookup::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(config, lookup, messenger);

    // 5 distinct keys at quota 2: pauses after keys 2 and 4
    let source = write_source(
        &dir,
        "contacts.csv",
        &[
            "1111111111",
            "2222222222",
            "3333333333",
            "4444444444",
            "5555555555",
        ],
    );
    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    let paused = events
        .iter()
        .filter(|e| matches!(e, Event::RatePaused { .. }))
        .count();
    let resumed = events
        .iter()
        .filter(|e| matches!(e, Event::RateResumed { .. }))
        .count();
    assert_eq!(paused, 2);
    assert_eq!(resumed, 2);
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));
}

#[tokio::test]
async fn second_launch_for_the_same_requester_is_rejected() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::with_delay(Duration::from_millis(100)));
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), lookup, messenger);

    let source = write_source(&dir, "contacts.csv", &["1111111111", "2222222222"]);
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source.clone(),
        })
        .await
        .unwrap();

    let err = engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::Error::JobActive { requester: 1 }));

    engine.wait_for_jobs().await;
}

#[tokio::test]
async fn shutdown_persists_a_checkpoint_and_interrupts_the_job() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = CheckpointStore::new(config.checkpoint.clone());
    let lookup = Arc::new(ScriptedLookup::with_delay(Duration::from_millis(50)));
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(config, lookup, messenger);

    let keys: Vec<String> = (0..20).map(|i| format!("77012345{i:02}77")).collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let source = write_source(&dir, "contacts.csv", &key_refs);

    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    // let a few rows go through, then pull the plug
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.shutdown().await.unwrap();

    let events = run_to_terminal(&mut rx).await;
    let Some(Event::JobInterrupted { processed, .. }) = events.last() else {
        panic!("expected interruption, got {:?}", events.last());
    };
    assert!(*processed > 0 && *processed < 20);

    let saved = store
        .find_latest(RequesterId(1), "contacts.csv")
        .expect("checkpoint should survive the shutdown");
    assert_eq!(saved.processed, *processed);
    // output columns stay parallel to the rows covered
    assert_eq!(saved.extracted.len(), saved.processed);
    assert_eq!(saved.summaries.len(), saved.processed);
}

#[tokio::test]
async fn resume_continues_from_the_saved_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = CheckpointStore::new(config.checkpoint.clone());
    let lookup = Arc::new(ScriptedLookup::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(config, Arc::clone(&lookup), messenger);

    let source = write_source(
        &dir,
        "contacts.csv",
        &["1111111111", "2222222222", "3333333333", "4444444444"],
    );

    // a previous run got through the first two rows
    let job_id = store.make_id(RequesterId(1), "contacts.csv");
    let mut saved = JobState::new(job_id.clone(), RequesterId(1), "contacts.csv", 4);
    saved.processed = 2;
    saved.extracted = vec!["+79990001111".into(), String::new()];
    saved.summaries = vec!["registry: phone=+79990001111".into(), "no matches".into()];
    saved
        .cache
        .insert("1111111111", crate::cache::CacheEntry::resolved("+79990001111", "ok"));
    saved
        .cache
        .insert("2222222222", crate::cache::CacheEntry::resolved("", "no matches"));
    store.save(&saved).unwrap();

    let mut rx = engine.subscribe();
    let launched_id = engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();
    assert_eq!(launched_id, job_id, "resume keeps the original job id");

    let events = run_to_terminal(&mut rx).await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Resumed { at: 2, .. })),
        "expected a resume event at row 2"
    );
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));
    // only the two unfinished keys hit the service
    assert_eq!(lookup.calls(), vec!["3333333333", "4444444444"]);
}

#[tokio::test]
async fn completed_job_cleans_up_its_checkpoint_and_stale_artifacts() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = CheckpointStore::new(config.checkpoint.clone());
    let lookup = Arc::new(ScriptedLookup::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(config, lookup, Arc::clone(&messenger));

    // 8 rows, artifact interval 3: partials at rows 3 and 6, final at the end
    let keys: Vec<String> = (0..8).map(|i| format!("11112222{i:02}33")).collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let source = write_source(&dir, "contacts.csv", &key_refs);

    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));

    let artifacts = events
        .iter()
        .filter(|e| matches!(e, Event::ArtifactDelivered { .. }))
        .count();
    assert_eq!(artifacts, 2);
    // partials plus the final workbook
    assert_eq!(messenger.files.lock().unwrap().len(), 3);

    // checkpoint is gone, and only the final result remains on disk
    assert!(store.find_latest(RequesterId(1), "contacts.csv").is_none());
    let remaining: Vec<_> = std::fs::read_dir(dir.path().join("temp"))
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].starts_with("result_"));
}

#[tokio::test]
async fn csv_source_gets_a_csv_final_result_with_sentinels_in_both_columns() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::new());
    lookup.script("1111111111", LookupReply::QuotaExhausted);
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), lookup, Arc::clone(&messenger));

    let source = write_source(&dir, "contacts.csv", &["1111111111", "2222222222"]);
    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));

    let delivered = messenger.files.lock().unwrap().last().cloned().unwrap();
    assert_eq!(
        delivered.extension().and_then(|e| e.to_str()),
        Some("csv"),
        "a CSV source must produce a CSV final result"
    );
    let text = std::fs::read_to_string(&delivered).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next().unwrap(), "tax_id,phones,summary");
    // both the exhausting row and the passed-through row carry the sentinel
    // in both output columns
    for line in lines {
        assert_eq!(
            line.matches(EXHAUSTED_SENTINEL).count(),
            2,
            "unexpected row: {line}"
        );
    }
}

#[tokio::test]
async fn missing_source_file_fails_the_job_with_a_user_message() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), lookup, Arc::clone(&messenger));

    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: dir.path().join("does-not-exist.csv"),
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(Event::JobFailed { .. })));
    assert!(!messenger.texts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn row_outcomes_use_the_documented_sentinels() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = CheckpointStore::new(config.checkpoint.clone());
    let lookup = Arc::new(ScriptedLookup::with_delay(Duration::from_millis(40)));
    lookup.script(
        "2222222222",
        LookupReply::Failed {
            message: "flaky".into(),
        },
    );
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(config, lookup, messenger);

    // row 0 invalid, row 1 transient failure, rows 2+ keep the job alive
    // long enough to interrupt it and inspect the persisted outcomes
    let source = write_source(
        &dir,
        "contacts.csv",
        &[
            "12345",
            "2222222222",
            "3333333333",
            "4444444444",
            "5555555555",
            "6666666666",
        ],
    );
    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.shutdown().await.unwrap();
    run_to_terminal(&mut rx).await;

    let saved = store
        .find_latest(RequesterId(1), "contacts.csv")
        .expect("interrupted job should leave a checkpoint");
    assert!(saved.processed >= 2);
    // sentinels land in both output columns, and the transient failure
    // keeps its short message in the summary
    assert_eq!(saved.extracted[0], INVALID_KEY_SENTINEL);
    assert_eq!(saved.summaries[0], INVALID_KEY_SENTINEL);
    assert_eq!(saved.extracted[1], LOOKUP_ERROR_SENTINEL);
    assert_eq!(saved.summaries[1], "lookup failed: flaky");
}

#[tokio::test]
async fn check_single_validates_and_goes_through_the_governor() {
    let dir = TempDir::new().unwrap();
    let lookup = Arc::new(ScriptedLookup::new());
    lookup.script("7701234567", matched_reply("+79990001122"));
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(test_config(&dir), Arc::clone(&lookup), messenger);

    // invalid key never reaches the service
    let reply = engine.check_single("12345").await;
    assert!(matches!(reply, LookupReply::Failed { .. }));
    assert!(lookup.calls().is_empty());

    let reply = engine.check_single(" 7701234567 ").await;
    assert!(matches!(reply, LookupReply::Matches(_)));
    assert_eq!(lookup.calls(), vec!["7701234567"]);
    // the call counted against the shared window
    assert_eq!(engine.governor_status().used, 1);
}

#[tokio::test]
async fn engine_rejects_an_invalid_configuration() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.lookup.api_token = String::new();

    let result = BatchEngine::with_services(
        config,
        Arc::new(ScriptedLookup::new()),
        Arc::new(RecordingMessenger::default()),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn resumed_job_keeps_the_exhaustion_flag() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = CheckpointStore::new(config.checkpoint.clone());
    let lookup = Arc::new(ScriptedLookup::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = engine_with(config, Arc::clone(&lookup), messenger);

    let source = write_source(
        &dir,
        "contacts.csv",
        &["1111111111", "2222222222", "3333333333"],
    );

    // the previous run hit exhaustion on its first row
    let job_id = store.make_id(RequesterId(1), "contacts.csv");
    let mut saved = JobState::new(job_id, RequesterId(1), "contacts.csv", 3);
    saved.processed = 1;
    saved.extracted = vec![EXHAUSTED_SENTINEL.to_string()];
    saved.summaries = vec![EXHAUSTED_SENTINEL.to_string()];
    saved.exhausted = true;
    saved.cache.insert(
        "1111111111",
        crate::cache::CacheEntry::exhausted(EXHAUSTED_SENTINEL, EXHAUSTED_SENTINEL),
    );
    store.save(&saved).unwrap();

    let mut rx = engine.subscribe();
    engine
        .launch(JobRequest {
            requester: RequesterId(1),
            source_path: source,
        })
        .await
        .unwrap();

    let events = run_to_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(Event::JobCompleted { .. })));
    // exhaustion carried over: the remaining rows never reach the service
    assert!(lookup.calls().is_empty());
}
