//! Watcher supervision primitives
//!
//! The session starts one watcher task per watchable retrieved value. A
//! watcher's only job is to drive a single
//! [`watch_for_update`](crate::Watchable::watch_for_update) call to its
//! terminal condition and post the classification to the
//! session's aggregation channel. The call is raced against the
//! generation's cancellation token so shutdown is bounded even for a
//! source that fails to observe its own close.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::SourceError;
use crate::core::traits::Retrieved;

/// Terminal classification of one watcher.
#[derive(Debug)]
pub(crate) enum WatchOutcome {
    /// The monitored value changed or expired.
    Updated,
    /// The session closed the watch; expected during shutdown.
    Closed,
    /// The watch failed after exhausting its transient-error tolerance.
    Failed(SourceError),
}

/// Event posted to the session's aggregation loop.
#[derive(Debug)]
pub(crate) struct WatchEvent {
    /// Resolution generation this watcher belongs to.
    pub generation: u64,
    /// Name of the binding that produced the watched value.
    pub source_name: String,
    /// Selector of the watched value.
    pub selector: String,
    /// Terminal classification.
    pub outcome: WatchOutcome,
}

/// A retrieved value kept alive for watching.
pub(crate) struct WatchCandidate {
    pub source_name: String,
    pub selector: String,
    pub retrieved: Arc<dyn Retrieved>,
}

/// Spawn the watcher task for one candidate.
///
/// The task posts exactly one [`WatchEvent`] and exits. A send failure
/// means the session is gone and the event is moot.
pub(crate) fn spawn(
    candidate: WatchCandidate,
    generation: u64,
    token: CancellationToken,
    events: mpsc::Sender<WatchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let WatchCandidate {
            source_name,
            selector,
            retrieved,
        } = candidate;

        let outcome = match retrieved.watchable() {
            Some(watchable) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => WatchOutcome::Closed,
                    err = watchable.watch_for_update() => classify(err),
                }
            }
            // The session only spawns watchers for watchable values.
            None => WatchOutcome::Closed,
        };

        debug!(
            action = "watcher_finished",
            source = %source_name,
            selector = %selector,
            generation,
            outcome = ?outcome,
            "Watcher reached terminal state"
        );

        let _ = events
            .send(WatchEvent {
                generation,
                source_name,
                selector,
                outcome,
            })
            .await;
    })
}

fn classify(err: SourceError) -> WatchOutcome {
    if err.is_value_updated() {
        WatchOutcome::Updated
    } else if err.is_session_closed() {
        WatchOutcome::Closed
    } else {
        WatchOutcome::Failed(err)
    }
}

/// Transient-error tolerance for watch loops.
///
/// The core fixes no system-wide bound: each source plugin carries its own
/// policy and applies it inside
/// [`watch_for_update`](crate::Watchable::watch_for_update), absorbing
/// transient failures with capped exponential backoff until the policy is
/// exhausted, at which point the watch must surface a fatal error instead
/// of looping silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of transient errors absorbed before giving up.
    pub max_attempts: usize,
    /// Backoff before the first re-attempt.
    pub initial_backoff: Duration,
    /// Multiplier applied to the backoff after every attempt.
    ///
    /// Values below 1.0 are clamped to 1.0; the backoff never shrinks
    /// between attempts.
    pub multiplier: f64,
    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before re-attempt `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as usize) as i32);
        let raw = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max_backoff.as_secs_f64()))
    }

    /// True once `attempt` transient errors have been absorbed.
    pub fn is_exhausted(&self, attempt: usize) -> bool {
        attempt >= self.max_attempts
    }
}
