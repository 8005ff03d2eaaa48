//! Response Body Compression
//!
//! Gzip encoding of cached bodies so the negotiator can hand clients a
//! pre-compressed representation, with automatic fallback on failure.
//!
//! # Example
//!
//! ```
//! use resource_cache::cache::compression::{CompressionManager, Compressor, GzipCompressor};
//!
//! let manager = CompressionManager::new();
//!
//! let data = "body{color:red}".repeat(200);
//! let gzipped = manager.gzip_variant(data.as_bytes()).unwrap().unwrap();
//! assert!(gzipped.len() < data.len());
//!
//! let inflated = GzipCompressor::new().decompress(&gzipped).unwrap();
//! assert_eq!(inflated, data.as_bytes());
//!
//! // Too small to be worth a variant
//! assert!(manager.gzip_variant(b"p{}").unwrap().is_none());
//! ```

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported content encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// Identity encoding
    None,
    /// Gzip (RFC 1952)
    #[default]
    Gzip,
}

/// Whether a media type benefits from gzip.
///
/// Text, script, stylesheet and structured-text types compress; images,
/// audio, video, archives and other binary formats never do.
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if essence.starts_with("text/") {
        return true;
    }
    if essence.ends_with("+xml") || essence.ends_with("+json") {
        return true;
    }
    matches!(
        essence.as_str(),
        "application/javascript"
            | "application/x-javascript"
            | "application/ecmascript"
            | "application/json"
            | "application/xml"
            | "application/manifest+json"
    )
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Minimum body size to compress (smaller bodies get no gzip variant)
    pub min_size: u64,
    /// Gzip level (0-9)
    pub level: u32,
    /// Whether to fall back to no variant on failure
    pub fallback_on_failure: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: 256,
            level: 6,
            fallback_on_failure: true,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Gzip compressor
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    /// Create a gzip compressor with the default level
    pub fn new() -> Self {
        Self { level: 6 }
    }

    /// Create with a custom level, clamped to 0-9
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| Error::CompressionFailed {
                algorithm: "gzip".into(),
                reason: e.to_string(),
            })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: "gzip".into(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Builds gzip variants with fallback support
pub struct CompressionManager {
    config: CompressionConfig,
    gzip: GzipCompressor,
}

impl CompressionManager {
    /// Create a new compression manager with default config
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            gzip: GzipCompressor::with_level(config.level),
            config,
        }
    }

    /// Produce the gzip variant of a body, if one is worth storing.
    ///
    /// `None` when the body is below the size threshold, when gzip does not
    /// make it smaller, or when compression fails and fallback is enabled.
    pub fn gzip_variant(&self, data: &[u8]) -> Result<Option<Bytes>> {
        if (data.len() as u64) < self.config.min_size {
            return Ok(None);
        }

        match self.gzip.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => Ok(Some(Bytes::from(compressed))),
            Ok(_) => Ok(None),
            Err(e) if self.config.fallback_on_failure => {
                tracing::warn!("Gzip failed, caching identity only: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
