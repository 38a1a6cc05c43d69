//! confsource - dynamic external-configuration resolution
//!
//! This crate lets a static configuration document reference values held
//! in external sources (secret stores, key/value services, files) via
//! selector markers, retrieves those values at startup, and keeps the
//! running configuration synchronized when a watched value changes.
//!
//! Any provider implementing the [`ConfigSource`] / [`Retrieved`] /
//! [`Watchable`] contracts can be registered with a [`Session`] under a
//! source name; documents then reference it with string scalars of the
//! form `"source-name: selector"` (optionally `"?key=value&..."`).
//!
//! # Example
//!
//! ```rust,no_run
//! use confsource::prelude::*;
//!
//! # fn vault_source() -> Box<dyn ConfigSource> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> SourceResult<()> {
//!     let session = SessionBuilder::new()
//!         .with_source("vault", vault_source())
//!         .on_change(|resolved| println!("configuration changed: {resolved}"))
//!         .on_fatal(|err| eprintln!("watch failed: {err}"))
//!         .build();
//!
//!     let document = serde_json::json!({
//!         "exporters": { "otlp": { "password": "vault: secret/db/password" } }
//!     });
//!     let resolved = session.resolve(&document).await?;
//!
//!     // ... run the pipeline with `resolved` ...
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

#![deny(unused_must_use)]
#![warn(missing_docs)]

// Core module with contracts, errors, and the builder
pub mod core;

// Orchestration modules
pub mod session;
pub mod watcher;

// Re-export main types from core
pub use self::core::{ConfigSource, Retrieved, SessionBuilder, SourceError, SourceResult, Watchable};

// Re-export orchestration types
pub use session::Session;
pub use watcher::RetryPolicy;

/// Prelude module for convenient imports
pub mod prelude {
    //! Prelude for common imports
    //!
    //! # Example
    //! ```rust
    //! use confsource::prelude::*;
    //! ```

    pub use crate::core::{
        ConfigSource, Retrieved, SessionBuilder, SourceError, SourceResult, Watchable,
    };
    pub use crate::session::Session;
    pub use crate::watcher::RetryPolicy;
}
