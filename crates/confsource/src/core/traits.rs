//! Plugin contracts for configuration sources
//!
//! A *source* is a pluggable provider of externally held configuration
//! values (secret stores, key/value services, files). The session is the
//! only caller of these traits: it serializes `retrieve`/`close` on each
//! binding (the `&mut self` receivers encode that precondition) while
//! freely parallelizing across distinct bindings.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::{SourceError, SourceResult};

/// Contract implemented by every pluggable configuration source.
///
/// A source may use the moment of a `retrieve` call to acquire whatever
/// resource keeps the returned value consistent (a lock preventing torn
/// reads, a lease, a connection) and must hold it until `close`.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Retrieve the value selected by `selector`.
    ///
    /// `selector` is required and non-empty; `params` is optional and
    /// passed through opaquely from the configuration document. Returns
    /// the retrieved value together with its optional watch capability.
    ///
    /// The session guarantees this is never called concurrently with
    /// another `retrieve` or `close` on the same binding.
    async fn retrieve(
        &mut self,
        selector: &str,
        params: Option<&Map<String, Value>>,
    ) -> SourceResult<Box<dyn Retrieved>>;

    /// Release every resource this binding acquired, including any
    /// outstanding watch state.
    ///
    /// Called at most once per binding, when the owning session ends,
    /// on success and failure paths alike.
    async fn close(&mut self) -> SourceResult<()>;
}

/// Result of one [`ConfigSource::retrieve`] call.
pub trait Retrieved: Send + Sync {
    /// The retrieved data, to be substituted into the configuration tree.
    ///
    /// Pure accessor: stable for the object's lifetime until a watch
    /// signals otherwise.
    fn value(&self) -> Value;

    /// Optional capability to monitor the retrieved value for updates.
    ///
    /// Sources that cannot detect changes return `None` (the default);
    /// the session then treats the value as static for the session's life.
    fn watchable(&self) -> Option<&dyn Watchable> {
        None
    }
}

/// Optional capability of a [`Retrieved`] value: monitoring for updates.
#[async_trait]
pub trait Watchable: Send + Sync {
    /// Block until the watch reaches a terminal condition.
    ///
    /// The returned error is the terminal classification and must be one
    /// of exactly three things:
    ///
    /// 1. [`SourceError::ValueUpdated`] (possibly wrapped) — the monitored
    ///    value changed or expired and must be retrieved again.
    /// 2. [`SourceError::SessionClosed`] (possibly wrapped) — the owning
    ///    session closed this binding.
    /// 3. Any other error — an unrecoverable failure, surfaced only after
    ///    the implementation has absorbed its configured share of
    ///    transient errors (see [`crate::watcher::RetryPolicy`]).
    ///
    /// Implementations must not return for any other reason.
    async fn watch_for_update(&self) -> SourceError;
}
