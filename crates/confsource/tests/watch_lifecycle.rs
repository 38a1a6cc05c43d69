//! Integration tests for watch supervision and reload behavior
//!
//! Covers the watcher state machine end to end:
//! - an update triggers re-resolution and the reload callback
//! - rapid updates collapse into a single re-resolution (debounce)
//! - close unblocks watchers within a bounded window
//! - fatal watch errors reach `on_fatal` after retry exhaustion
//! - a failed re-resolution keeps the prior configuration in effect

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use confsource::prelude::*;
use serde_json::{Map, Value, json};
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout};

/// Watchable that fires an update when a permit becomes available.
struct PermitWatchable {
    permits: Arc<Semaphore>,
}

#[async_trait]
impl Watchable for PermitWatchable {
    async fn watch_for_update(&self) -> SourceError {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                SourceError::ValueUpdated.wrap("stub value changed")
            }
            Err(_) => SourceError::SessionClosed.wrap("permit source closed"),
        }
    }
}

/// Watchable that never fires on its own; only session close ends it.
struct BlockingWatchable;

#[async_trait]
impl Watchable for BlockingWatchable {
    async fn watch_for_update(&self) -> SourceError {
        std::future::pending::<SourceError>().await
    }
}

/// Watchable that absorbs transient errors per its policy, then gives up.
struct RetryingWatchable {
    policy: RetryPolicy,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Watchable for RetryingWatchable {
    async fn watch_for_update(&self) -> SourceError {
        let mut attempt = 0;
        loop {
            if self.policy.is_exhausted(attempt) {
                return SourceError::watch("backend gone");
            }
            // Every iteration simulates one absorbed transient error.
            self.attempts.fetch_add(1, Ordering::SeqCst);
            sleep(self.policy.backoff(attempt)).await;
            attempt += 1;
        }
    }
}

struct WatchableRetrieved {
    value: Value,
    watchable: Box<dyn Watchable>,
}

impl Retrieved for WatchableRetrieved {
    fn value(&self) -> Value {
        self.value.clone()
    }

    fn watchable(&self) -> Option<&dyn Watchable> {
        Some(self.watchable.as_ref())
    }
}

/// Source whose values are `v1`, `v2`, ... per retrieve call. The first
/// `watch_first_n` retrieved values watch the shared permit pool; later
/// ones block until the session closes, which keeps reload tests from
/// feeding back into themselves.
struct CountingWatchSource {
    calls: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
    watch_first_n: usize,
}

impl CountingWatchSource {
    fn new(permits: Arc<Semaphore>, watch_first_n: usize) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            permits,
            watch_first_n,
        }
    }
}

#[async_trait]
impl ConfigSource for CountingWatchSource {
    async fn retrieve(
        &mut self,
        _selector: &str,
        _params: Option<&Map<String, Value>>,
    ) -> SourceResult<Box<dyn Retrieved>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let watchable: Box<dyn Watchable> = if call <= self.watch_first_n {
            Box::new(PermitWatchable {
                permits: Arc::clone(&self.permits),
            })
        } else {
            Box::new(BlockingWatchable)
        };
        Ok(Box::new(WatchableRetrieved {
            value: json!(format!("v{call}")),
            watchable,
        }))
    }

    async fn close(&mut self) -> SourceResult<()> {
        Ok(())
    }
}

/// Collects `on_change` documents and wakes waiting assertions.
struct ChangeLog {
    documents: std::sync::Mutex<Vec<Value>>,
    notify: Notify,
}

impl ChangeLog {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            documents: std::sync::Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    fn record(&self, document: Value) {
        self.documents.lock().unwrap().push(document);
        self.notify.notify_one();
    }

    fn count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    fn last(&self) -> Option<Value> {
        self.documents.lock().unwrap().last().cloned()
    }
}

/// Test: an updated value triggers re-resolution and the reload callback
#[tokio::test]
async fn update_triggers_reload_with_new_document() {
    let permits = Arc::new(Semaphore::new(0));
    let source = CountingWatchSource::new(Arc::clone(&permits), 1);
    let changes = ChangeLog::new();
    let changes_cb = Arc::clone(&changes);

    let session = SessionBuilder::new()
        .with_source("store", Box::new(source))
        .on_change(move |document| changes_cb.record(document))
        .build();

    let document = json!({"password": "store: db/password"});
    let resolved = session.resolve(&document).await.expect("resolve should succeed");
    assert_eq!(resolved, json!({"password": "v1"}));

    // Signal the watched value changed.
    permits.add_permits(1);

    timeout(Duration::from_secs(2), changes.notify.notified())
        .await
        .expect("reload callback should fire");
    assert_eq!(changes.last(), Some(json!({"password": "v2"})));
    assert_eq!(session.last_resolved().await, Some(json!({"password": "v2"})));

    session.close().await.expect("close should succeed");
}

/// Test: rapid updates collapse into one re-resolution (debounce)
#[tokio::test]
async fn rapid_updates_collapse_into_one_reload() {
    let permits = Arc::new(Semaphore::new(0));
    let source = CountingWatchSource::new(Arc::clone(&permits), 5);
    let retrieve_calls = Arc::clone(&source.calls);
    let changes = ChangeLog::new();
    let changes_cb = Arc::clone(&changes);

    let session = SessionBuilder::new()
        .with_source("store", Box::new(source))
        .on_change(move |document| changes_cb.record(document))
        .build();

    let document = json!({
        "a": "store: s1",
        "b": "store: s2",
        "c": "store: s3",
        "d": "store: s4",
        "e": "store: s5"
    });
    session.resolve(&document).await.expect("resolve should succeed");
    assert_eq!(retrieve_calls.load(Ordering::SeqCst), 5);

    // All five watchers fire in rapid succession.
    permits.add_permits(5);

    timeout(Duration::from_secs(2), changes.notify.notified())
        .await
        .expect("reload callback should fire");
    // Let any spurious extra reloads surface before asserting.
    sleep(Duration::from_millis(300)).await;

    assert_eq!(changes.count(), 1, "five updates must collapse into one reload");
    assert_eq!(
        retrieve_calls.load(Ordering::SeqCst),
        10,
        "exactly one re-resolution pass"
    );

    session.close().await.expect("close should succeed");
}

/// Test: close unblocks a watcher stuck in watch_for_update
#[tokio::test]
async fn close_unblocks_blocked_watcher() {
    let permits = Arc::new(Semaphore::new(0));
    let source = CountingWatchSource::new(permits, 0);
    let fatals = Arc::new(AtomicUsize::new(0));
    let fatals_cb = Arc::clone(&fatals);

    let session = SessionBuilder::new()
        .with_source("store", Box::new(source))
        .on_fatal(move |_| {
            fatals_cb.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    session
        .resolve(&json!({"key": "store: some/value"}))
        .await
        .expect("resolve should succeed");

    timeout(Duration::from_secs(2), session.close())
        .await
        .expect("close must finish within the shutdown window")
        .expect("close should succeed");
    assert_eq!(fatals.load(Ordering::SeqCst), 0, "shutdown is not a fatal error");
}

/// Source returning a single retrying watchable with the given policy.
struct RetryingSource {
    policy: RetryPolicy,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl ConfigSource for RetryingSource {
    async fn retrieve(
        &mut self,
        _selector: &str,
        _params: Option<&Map<String, Value>>,
    ) -> SourceResult<Box<dyn Retrieved>> {
        Ok(Box::new(WatchableRetrieved {
            value: json!("value"),
            watchable: Box::new(RetryingWatchable {
                policy: self.policy.clone(),
                attempts: Arc::clone(&self.attempts),
            }),
        }))
    }

    async fn close(&mut self) -> SourceResult<()> {
        Ok(())
    }
}

/// Test: a watch that exhausts its retry policy surfaces through on_fatal
#[tokio::test]
async fn exhausted_watch_reports_fatal_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let source = RetryingSource {
        policy: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(20),
        },
        attempts: Arc::clone(&attempts),
    };

    let fatal: Arc<std::sync::Mutex<Option<SourceError>>> = Arc::new(std::sync::Mutex::new(None));
    let fatal_cb = Arc::clone(&fatal);
    let notify = Arc::new(Notify::new());
    let notify_cb = Arc::clone(&notify);

    let session = SessionBuilder::new()
        .with_source("flaky", Box::new(source))
        .on_fatal(move |err| {
            *fatal_cb.lock().unwrap() = Some(err);
            notify_cb.notify_one();
        })
        .build();

    session
        .resolve(&json!({"key": "flaky: some/value"}))
        .await
        .expect("resolve should succeed");

    timeout(Duration::from_secs(2), notify.notified())
        .await
        .expect("fatal callback should fire");

    let err = fatal.lock().unwrap().take().expect("error should be recorded");
    assert!(!err.is_session_closed());
    assert!(!err.is_value_updated());
    assert!(err.to_string().contains("some/value"), "error should carry the selector: {err}");
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "three transient errors absorbed");

    session.close().await.expect("close should succeed");
}

/// Retrieved value that reports its own drop; the watcher task owns the
/// last reference, so the drop marks the task's termination.
struct GuardedRetrieved {
    value: Value,
    watchable: BlockingWatchable,
    dropped: Arc<Notify>,
}

impl Retrieved for GuardedRetrieved {
    fn value(&self) -> Value {
        self.value.clone()
    }

    fn watchable(&self) -> Option<&dyn Watchable> {
        Some(&self.watchable)
    }
}

impl Drop for GuardedRetrieved {
    fn drop(&mut self) {
        self.dropped.notify_one();
    }
}

struct GuardedSource {
    dropped: Arc<Notify>,
    close_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ConfigSource for GuardedSource {
    async fn retrieve(
        &mut self,
        _selector: &str,
        _params: Option<&Map<String, Value>>,
    ) -> SourceResult<Box<dyn Retrieved>> {
        Ok(Box::new(GuardedRetrieved {
            value: json!("value"),
            watchable: BlockingWatchable,
            dropped: Arc::clone(&self.dropped),
        }))
    }

    async fn close(&mut self) -> SourceResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Test: dropping the last handle without close still retires watchers
#[tokio::test]
async fn dropping_session_cancels_blocked_watcher() {
    let dropped = Arc::new(Notify::new());
    let close_calls = Arc::new(AtomicUsize::new(0));
    let source = GuardedSource {
        dropped: Arc::clone(&dropped),
        close_calls: Arc::clone(&close_calls),
    };

    let session = SessionBuilder::new()
        .with_source("store", Box::new(source))
        .build();

    session
        .resolve(&json!({"key": "store: some/value"}))
        .await
        .expect("resolve should succeed");

    drop(session);

    // The watcher task holds the only reference to the retrieved value;
    // observing its drop proves the blocked watcher terminated.
    timeout(Duration::from_secs(2), dropped.notified())
        .await
        .expect("dropping the session must unblock the watcher");

    // The backstop cancels watchers but never runs the close cascade.
    assert_eq!(close_calls.load(Ordering::SeqCst), 0);
}

/// Watchable that reports an update immediately.
struct ImmediateUpdate;

#[async_trait]
impl Watchable for ImmediateUpdate {
    async fn watch_for_update(&self) -> SourceError {
        SourceError::ValueUpdated.wrap("expired on arrival")
    }
}

/// Source that succeeds once, then fails every later retrieve.
struct FlakyOnReloadSource {
    calls: AtomicUsize,
}

#[async_trait]
impl ConfigSource for FlakyOnReloadSource {
    async fn retrieve(
        &mut self,
        _selector: &str,
        _params: Option<&Map<String, Value>>,
    ) -> SourceResult<Box<dyn Retrieved>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Box::new(WatchableRetrieved {
                value: json!("v1"),
                watchable: Box::new(ImmediateUpdate),
            }))
        } else {
            Err(SourceError::watch("store unavailable"))
        }
    }

    async fn close(&mut self) -> SourceResult<()> {
        Ok(())
    }
}

/// Test: a failed re-resolution keeps the prior document and reports
#[tokio::test]
async fn failed_re_resolution_keeps_prior_document() {
    let fatal_seen = Arc::new(Notify::new());
    let fatal_cb = Arc::clone(&fatal_seen);
    let changes = ChangeLog::new();
    let changes_cb = Arc::clone(&changes);

    let session = SessionBuilder::new()
        .with_source(
            "store",
            Box::new(FlakyOnReloadSource {
                calls: AtomicUsize::new(0),
            }),
        )
        .on_change(move |document| changes_cb.record(document))
        .on_fatal(move |_| fatal_cb.notify_one())
        .build();

    let resolved = session
        .resolve(&json!({"key": "store: db/key"}))
        .await
        .expect("initial resolve should succeed");
    assert_eq!(resolved, json!({"key": "v1"}));

    timeout(Duration::from_secs(2), fatal_seen.notified())
        .await
        .expect("failed re-resolution should be reported");

    // The prior configuration stays in effect and no reload fired.
    assert_eq!(session.last_resolved().await, Some(json!({"key": "v1"})));
    assert_eq!(changes.count(), 0);

    session.close().await.expect("close should succeed");
}
