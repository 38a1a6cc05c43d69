//! Error taxonomy for configuration-source resolution
//!
//! Two variants are *sentinels*: [`SourceError::SessionClosed`] and
//! [`SourceError::ValueUpdated`]. They may be wrapped with additional
//! context any number of times; callers identify them with
//! [`SourceError::is_session_closed`] / [`SourceError::is_value_updated`],
//! never by comparing messages.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type SourceResult<T> = Result<T, SourceError>;

/// Error type for configuration-source retrieval and watching.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SourceError {
    /// The owning session was closed while the operation was in flight.
    ///
    /// This is the expected terminal signal of a session-initiated
    /// shutdown, not a user-visible failure.
    #[error("parent session was closed")]
    SessionClosed,

    /// The watched value changed or expired and must be retrieved again.
    #[error("configuration must retrieve the updated value")]
    ValueUpdated,

    /// A selector could not be retrieved from its source.
    #[error("retrieval of selector `{selector}` from source `{source_name}` failed")]
    Retrieval {
        /// Name the source was registered under.
        source_name: String,
        /// Selector that failed to retrieve.
        selector: String,
        /// Underlying error reported by the source.
        #[source]
        source: Box<SourceError>,
    },

    /// A selector-reference marker was malformed.
    #[error("invalid selector reference `{reference}`: {message}")]
    InvalidReference {
        /// The offending marker string.
        reference: String,
        /// What was wrong with it.
        message: String,
    },

    /// A watch exhausted its transient-error tolerance.
    #[error("watch failed: {message}")]
    Watch {
        /// Description of the fatal watch condition.
        message: String,
    },

    /// Closing a source binding failed.
    #[error("failed to close source `{name}`: {message}")]
    Close {
        /// Name the source was registered under.
        name: String,
        /// Description of the close failure.
        message: String,
    },

    /// Additional context layered over another error.
    #[error("{context}")]
    Wrapped {
        /// Context describing where the inner error surfaced.
        context: String,
        /// The wrapped error.
        #[source]
        source: Box<SourceError>,
    },
}

impl SourceError {
    /// Wrap this error with additional context.
    ///
    /// Sentinel identity survives wrapping: `e.wrap("a").wrap("b")` still
    /// answers `is_session_closed()` the same way `e` did.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a retrieval error naming the offending selector and source.
    pub fn retrieval(
        source_name: impl Into<String>,
        selector: impl Into<String>,
        source: SourceError,
    ) -> Self {
        Self::Retrieval {
            source_name: source_name.into(),
            selector: selector.into(),
            source: Box::new(source),
        }
    }

    /// Create an invalid-reference error.
    pub fn invalid_reference(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Create a fatal watch error.
    pub fn watch(message: impl Into<String>) -> Self {
        Self::Watch {
            message: message.into(),
        }
    }

    /// Create a close-cascade error.
    pub fn close(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Close {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True if this error is, or wraps, [`SourceError::SessionClosed`].
    pub fn is_session_closed(&self) -> bool {
        matches!(self.root(), Self::SessionClosed)
    }

    /// True if this error is, or wraps, [`SourceError::ValueUpdated`].
    pub fn is_value_updated(&self) -> bool {
        matches!(self.root(), Self::ValueUpdated)
    }

    /// Innermost error in the wrap chain.
    fn root(&self) -> &Self {
        let mut current = self;
        loop {
            match current {
                Self::Wrapped { source, .. } | Self::Retrieval { source, .. } => {
                    current = source;
                }
                other => return other,
            }
        }
    }
}
