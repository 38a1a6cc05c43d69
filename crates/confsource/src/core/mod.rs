//! Core contracts for configuration-source resolution

pub mod builder;
pub mod error;
pub mod traits;

pub(crate) mod selector;

// Re-export core types
pub use builder::SessionBuilder;
pub use error::{SourceError, SourceResult};

// Re-export plugin contracts
pub use traits::{ConfigSource, Retrieved, Watchable};
