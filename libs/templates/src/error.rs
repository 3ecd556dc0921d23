//! Error types for template building and storage.

use thiserror::Error;

/// Errors from a template store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("template store lock poisoned")]
    Poisoned,

    #[error("template store unavailable: {0}")]
    Unavailable(String),
}

/// Errors building or installing a single template.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The mapping document could not be built.
    #[error("failed to build mapping for template [{template}]: {source}")]
    Mapping {
        template: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The store failed to read or write the template.
    #[error("failed to install template: {0}")]
    Store(#[from] StoreError),
}
