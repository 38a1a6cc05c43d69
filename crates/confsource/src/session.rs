//! Session orchestration for configuration resolution
//!
//! The [`Session`] owns every registered source binding, resolves selector
//! references out of a raw configuration document, supervises one watcher
//! per watchable retrieved value, debounces update-triggered
//! re-resolutions, and cascades close over every binding that was ever
//! retrieved-from.
//!
//! Concurrency model: `retrieve`/`close` are strictly serialized per
//! binding (each binding sits behind its own async mutex) and freely
//! parallel across distinct bindings. Closing the session is the single
//! cancellation mechanism; it forces every blocked watch and in-flight
//! retrieve to observe [`SourceError::SessionClosed`] within a bounded
//! window.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::error::{SourceError, SourceResult};
use crate::core::selector::{self, ScannedRef};
use crate::core::traits::{ConfigSource, Retrieved};
use crate::watcher::{self, WatchCandidate, WatchEvent, WatchOutcome};

/// Callback invoked with the freshly resolved document after an update.
pub(crate) type ChangeCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback invoked with unrecoverable watch or re-resolution errors.
pub(crate) type FatalCallback = Arc<dyn Fn(SourceError) + Send + Sync>;

/// A registered, named source instance.
struct Binding {
    /// The mutex is what serializes `retrieve`/`close` on one binding.
    source: Mutex<Box<dyn ConfigSource>>,
    /// Set on first retrieval; only used bindings join the close cascade.
    used: AtomicBool,
}

/// State mutated by resolution passes and shutdown.
struct WatchState {
    /// Raw document kept for update-triggered re-resolution.
    raw: Option<Value>,
    /// Monotonic resolution generation; stale watcher events are dropped.
    generation: u64,
    /// Child token cancelling the current generation's watchers.
    token: CancellationToken,
    /// Join handles of the current generation's watcher tasks.
    handles: Vec<JoinHandle<()>>,
    /// Most recent successfully resolved document.
    last_resolved: Option<Value>,
}

/// Owning handle to a configuration-resolution session.
///
/// Built with [`crate::SessionBuilder`]. Cheap to clone; all clones refer
/// to the same session. Call [`Session::close`] when the configuration is
/// no longer in use; dropping the last handle cancels watchers as a
/// backstop but does not run the source close cascade.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    bindings: HashMap<String, Binding>,
    /// Session-wide cancellation; cancelled exactly once, never reverts.
    cancel: CancellationToken,
    /// Serializes resolution passes (public and update-triggered alike).
    resolve_gate: Mutex<()>,
    state: Mutex<WatchState>,
    events_tx: mpsc::Sender<WatchEvent>,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Guards the close cascade so it runs at most once.
    close_gate: Mutex<bool>,
    on_change: Option<ChangeCallback>,
    on_fatal: Option<FatalCallback>,
}

impl Session {
    /// Assemble a session and start its aggregation loop.
    ///
    /// Must be called inside a tokio runtime; [`crate::SessionBuilder`]
    /// is the public entry point.
    pub(crate) fn new(
        sources: HashMap<String, Box<dyn ConfigSource>>,
        on_change: Option<ChangeCallback>,
        on_fatal: Option<FatalCallback>,
        event_capacity: usize,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(event_capacity.max(1));
        let cancel = CancellationToken::new();
        let watch_token = cancel.child_token();

        let bindings = sources
            .into_iter()
            .map(|(name, source)| {
                let binding = Binding {
                    source: Mutex::new(source),
                    used: AtomicBool::new(false),
                };
                (name, binding)
            })
            .collect();

        let inner = Arc::new(SessionInner {
            bindings,
            cancel,
            resolve_gate: Mutex::new(()),
            state: Mutex::new(WatchState {
                raw: None,
                generation: 0,
                token: watch_token,
                handles: Vec::new(),
                last_resolved: None,
            }),
            events_tx,
            loop_handle: std::sync::Mutex::new(None),
            close_gate: Mutex::new(false),
            on_change,
            on_fatal,
        });

        let handle = SessionInner::spawn_aggregation_loop(&inner, events_rx);
        if let Ok(mut slot) = inner.loop_handle.lock() {
            *slot = Some(handle);
        }

        Self { inner }
    }

    /// Resolve every selector reference in `document`.
    ///
    /// Returns a deep copy of the document with all references
    /// substituted. Resolution is all-or-nothing: if any selector fails to
    /// retrieve, the whole pass fails with an error naming the offending
    /// selector and no partial document escapes. A successful pass retires
    /// the previous resolution's watchers and starts fresh ones for every
    /// watchable result.
    ///
    /// Must not be invoked concurrently with itself; an internal gate
    /// serializes overlapping calls as a safety net.
    pub async fn resolve(&self, document: &Value) -> SourceResult<Value> {
        let inner = &self.inner;
        let _gate = inner.resolve_gate.lock().await;
        if inner.cancel.is_cancelled() {
            return Err(SourceError::SessionClosed.wrap("resolve called on a closed session"));
        }

        let (resolved, candidates) = inner.resolve_pass(document).await?;

        let mut state = inner.state.lock().await;
        state.raw = Some(document.clone());
        state.last_resolved = Some(resolved.clone());
        inner.install_watchers(&mut state, candidates);
        Ok(resolved)
    }

    /// The most recent successfully resolved document, if any.
    pub async fn last_resolved(&self) -> Option<Value> {
        self.inner.state.lock().await.last_resolved.clone()
    }

    /// True once [`Session::close`] has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Close the session.
    ///
    /// Cancels every running watcher (each observes
    /// [`SourceError::SessionClosed`]), stops the aggregation loop, then
    /// closes every binding that was ever retrieved-from — exactly once
    /// each, best-effort. The first close error is returned after every
    /// binding has been attempted. Calling `close` again is a no-op, and
    /// calling it concurrently with an in-flight [`Session::resolve`] is
    /// safe: the resolve observes the cancellation and the cascade still
    /// covers every used binding.
    pub async fn close(&self) -> SourceResult<()> {
        let inner = &self.inner;
        let mut closed = inner.close_gate.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        debug!(action = "session_closing", "Closing configuration session");
        inner.cancel.cancel();

        let handles = {
            let mut state = inner.state.lock().await;
            std::mem::take(&mut state.handles)
        };
        for handle in handles {
            let _ = handle.await;
        }
        let loop_handle = inner.loop_handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = loop_handle {
            let _ = handle.await;
        }

        let mut first_error = None;
        let mut names: Vec<&String> = inner.bindings.keys().collect();
        names.sort();
        for name in names {
            let binding = &inner.bindings[name];
            if !binding.used.load(Ordering::SeqCst) {
                continue;
            }
            let mut source = binding.source.lock().await;
            match source.close().await {
                Ok(()) => {
                    debug!(action = "source_closed", source = %name, "Closed source binding");
                }
                Err(err) => {
                    warn!(
                        action = "source_close_failed",
                        source = %name,
                        error = %err,
                        "Failed to close source binding; continuing cascade"
                    );
                    if first_error.is_none() {
                        first_error = Some(err.wrap(format!("closing source `{name}`")));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("bindings", &self.inner.bindings.len())
            .field("closed", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl SessionInner {
    /// One resolution pass: scan, retrieve, substitute.
    ///
    /// Retrieval runs concurrently across distinct bindings and strictly
    /// serially within one binding.
    async fn resolve_pass(&self, document: &Value) -> SourceResult<(Value, Vec<WatchCandidate>)> {
        let refs = selector::scan(document, &|name| self.bindings.contains_key(name))?;
        debug!(
            action = "document_scanned",
            references = refs.len(),
            "Scanned document for selector references"
        );

        // Group reference indices per binding; BTreeMap keeps the
        // cross-binding issue order deterministic.
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, scanned) in refs.iter().enumerate() {
            groups
                .entry(scanned.reference.source_name.as_str())
                .or_default()
                .push(index);
        }

        let group_futures = groups
            .into_iter()
            .map(|(name, indices)| self.retrieve_group(name, indices, &refs));
        let group_results = join_all(group_futures).await;

        let mut retrieved_by_index: Vec<Option<Arc<dyn Retrieved>>> =
            refs.iter().map(|_| None).collect();
        for result in group_results {
            for (index, retrieved) in result? {
                retrieved_by_index[index] = Some(retrieved);
            }
        }

        let mut resolved = document.clone();
        let mut candidates = Vec::new();
        for (scanned, slot) in refs.iter().zip(retrieved_by_index) {
            let Some(retrieved) = slot else { continue };
            if !selector::substitute(&mut resolved, &scanned.path, retrieved.value()) {
                warn!(
                    action = "substitution_miss",
                    selector = %scanned.reference.selector,
                    "Scanned path vanished before substitution"
                );
            }
            candidates.push(WatchCandidate {
                source_name: scanned.reference.source_name.clone(),
                selector: scanned.reference.selector.clone(),
                retrieved,
            });
        }
        Ok((resolved, candidates))
    }

    /// Retrieve every reference bound to one source, serially, while the
    /// binding's mutex is held.
    async fn retrieve_group(
        &self,
        name: &str,
        indices: Vec<usize>,
        refs: &[ScannedRef],
    ) -> SourceResult<Vec<(usize, Arc<dyn Retrieved>)>> {
        let Some(binding) = self.bindings.get(name) else {
            // Scan only yields registered names.
            return Err(SourceError::invalid_reference(name, "source is not registered"));
        };
        let mut source = binding.source.lock().await;
        binding.used.store(true, Ordering::SeqCst);

        let mut retrieved = Vec::with_capacity(indices.len());
        for index in indices {
            let reference = &refs[index].reference;
            // Biased so a retrieve never starts once close has begun.
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Err(SourceError::SessionClosed.wrap(format!(
                        "session closed while retrieving `{}` from `{name}`",
                        reference.selector
                    )));
                }
                result = source.retrieve(&reference.selector, reference.params.as_ref()) => result,
            };
            let value =
                result.map_err(|err| SourceError::retrieval(name, &reference.selector, err))?;
            debug!(
                action = "selector_retrieved",
                source = %name,
                selector = %reference.selector,
                "Retrieved value for selector"
            );
            retrieved.push((index, Arc::from(value)));
        }
        Ok(retrieved)
    }

    /// Retire the previous generation's watchers and start fresh ones.
    ///
    /// No new watchers start once the session is cancelled.
    fn install_watchers(&self, state: &mut WatchState, candidates: Vec<WatchCandidate>) {
        state.token.cancel();
        state.handles.clear();
        state.generation += 1;
        state.token = self.cancel.child_token();

        if self.cancel.is_cancelled() {
            return;
        }
        for candidate in candidates {
            if candidate.retrieved.watchable().is_none() {
                continue;
            }
            debug!(
                action = "watcher_started",
                source = %candidate.source_name,
                selector = %candidate.selector,
                generation = state.generation,
                "Starting watcher for retrieved value"
            );
            let handle = watcher::spawn(
                candidate,
                state.generation,
                state.token.clone(),
                self.events_tx.clone(),
            );
            state.handles.push(handle);
        }
    }

    /// Aggregation point for watcher outcomes.
    ///
    /// Holds only a weak session handle so an owner that drops the session
    /// without closing it does not leak the loop.
    fn spawn_aggregation_loop(
        inner: &Arc<Self>,
        mut events_rx: mpsc::Receiver<WatchEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_event(event).await;
            }
        })
    }

    async fn handle_event(&self, event: WatchEvent) {
        match event.outcome {
            WatchOutcome::Closed => {
                // Expected outcome of shutdown or watcher retirement.
                debug!(
                    action = "watcher_closed",
                    source = %event.source_name,
                    selector = %event.selector,
                    "Watcher closed"
                );
            }
            WatchOutcome::Failed(err) => {
                warn!(
                    action = "watch_failed",
                    source = %event.source_name,
                    selector = %event.selector,
                    error = %err,
                    "Watcher reported a fatal error"
                );
                self.report_fatal(err.wrap(format!(
                    "watch for selector `{}` from source `{}` failed",
                    event.selector, event.source_name
                )));
            }
            WatchOutcome::Updated => self.handle_update(event).await,
        }
    }

    /// Re-resolve the stored raw document after a watched value updated.
    ///
    /// The aggregation loop processes events serially and stale-generation
    /// events are dropped, so rapid updates collapse into a single
    /// re-resolution per completed pass.
    async fn handle_update(&self, event: WatchEvent) {
        let _gate = self.resolve_gate.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }
        let raw = {
            let state = self.state.lock().await;
            if state.generation != event.generation {
                debug!(
                    action = "stale_update_dropped",
                    source = %event.source_name,
                    selector = %event.selector,
                    event_generation = event.generation,
                    current_generation = state.generation,
                    "Dropping update from a retired resolution generation"
                );
                return;
            }
            state.raw.clone()
        };
        let Some(raw) = raw else { return };

        debug!(
            action = "re_resolution",
            source = %event.source_name,
            selector = %event.selector,
            "Watched value updated; re-resolving document"
        );
        match self.resolve_pass(&raw).await {
            Ok((resolved, candidates)) => {
                let on_change = {
                    let mut state = self.state.lock().await;
                    state.last_resolved = Some(resolved.clone());
                    self.install_watchers(&mut state, candidates);
                    self.on_change.clone()
                };
                if let Some(on_change) = on_change {
                    on_change(resolved);
                }
            }
            Err(err) => {
                if err.is_session_closed() && self.cancel.is_cancelled() {
                    return;
                }
                // The previously resolved configuration stays in effect.
                self.report_fatal(err.wrap("re-resolution after update failed"));
            }
        }
    }

    fn report_fatal(&self, err: SourceError) {
        match &self.on_fatal {
            Some(on_fatal) => on_fatal(err),
            None => error!(
                action = "fatal_unreported",
                error = %err,
                "Fatal error with no on_fatal handler installed"
            ),
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
