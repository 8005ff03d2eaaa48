//! Error types for the resource cache

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while caching and serving resources
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Cache Population Errors
    // =========================================================================
    /// A waiter gave up on another caller's population of the same key
    #[error("Timed out after {timeout:?} waiting for cache key {key} to be populated")]
    LockTimeout { key: String, timeout: Duration },

    /// The origin producer failed while populating a key
    #[error("Origin failed while populating cache key {key}: {reason}")]
    OriginFailure { key: String, reason: String },

    /// The response was already written by an earlier stage
    #[error("Response already committed")]
    AlreadyCommitted,

    // =========================================================================
    // HTTP Errors
    // =========================================================================
    /// HTTP construction error
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// Header value could not be built or parsed
    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // General Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status a server should answer with when this error ends a request.
    ///
    /// A lock timeout is reported as `503` so clients back off instead of
    /// hammering an origin that is already busy populating the key.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true for the distinguished population-timeout error
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }

    /// Build an origin failure for `key` from any displayable cause
    pub fn origin(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::OriginFailure {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
