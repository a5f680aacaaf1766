//! Error types for the Volume Data Source Validator

use thiserror::Error;

/// Result type alias using the validator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Validator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object is no longer present in the local cache
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// Listing the VolumePopulator catalog failed
    #[error("{0}")]
    CatalogUnavailable(String),

    /// A catalog entry could not be decoded into a VolumePopulator
    #[error("Failed to decode VolumePopulator '{name}': {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Transient failure reading from the cache or the API
    #[error("Lookup failed: {0}")]
    LookupFailure(String),

    /// Work queue key is not a valid namespace/name key
    #[error("Unexpected key format: {0:?}")]
    InvalidKey(String),

    /// Caches never reported synced
    #[error("Cannot sync caches")]
    CacheSync,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a catalog listing error
    pub fn catalog_unavailable(msg: impl Into<String>) -> Self {
        Error::CatalogUnavailable(msg.into())
    }

    /// Create a lookup error
    pub fn lookup(msg: impl Into<String>) -> Self {
        Error::LookupFailure(msg.into())
    }

    /// Whether the failed work item should be re-queued with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::CatalogUnavailable(_)
                | Error::Decode { .. }
                | Error::LookupFailure(_)
        )
    }
}
