//! Session builder

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::error::SourceError;
use super::traits::ConfigSource;
use crate::session::{ChangeCallback, FatalCallback, Session};

/// Builder assembling a [`Session`] from named source bindings and owner
/// callbacks.
///
/// All bindings are registered before resolution begins; the built session
/// exclusively owns their lifecycle from then on.
pub struct SessionBuilder {
    sources: HashMap<String, Box<dyn ConfigSource>>,
    on_change: Option<ChangeCallback>,
    on_fatal: Option<FatalCallback>,
    event_capacity: usize,
}

impl SessionBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            on_change: None,
            on_fatal: None,
            event_capacity: 64,
        }
    }

    /// Register a source under `name`.
    ///
    /// Selector references in resolved documents use this name to pick
    /// their binding. Registering the same name again replaces the
    /// earlier source.
    pub fn with_source(mut self, name: impl Into<String>, source: Box<dyn ConfigSource>) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Install the reload callback, invoked asynchronously with the newly
    /// resolved document whenever a watched value changes and
    /// re-resolution completes.
    pub fn on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    /// Install the error callback, invoked asynchronously with
    /// unrecoverable watch or re-resolution failures. Whether to
    /// re-resolve, alert, or close the session is the owner's decision.
    pub fn on_fatal<F>(mut self, callback: F) -> Self
    where
        F: Fn(SourceError) + Send + Sync + 'static,
    {
        self.on_fatal = Some(Arc::new(callback));
        self
    }

    /// Capacity of the watcher-outcome channel. The default of 64 is
    /// ample; watchers post at most one event each.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the session and start its aggregation loop.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Session {
        Session::new(
            self.sources,
            self.on_change,
            self.on_fatal,
            self.event_capacity,
        )
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("sources", &self.sources.len())
            .field("has_on_change", &self.on_change.is_some())
            .field("has_on_fatal", &self.on_fatal.is_some())
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}
