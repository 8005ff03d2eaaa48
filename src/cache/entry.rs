//! Cache Entry Types
//!
//! Immutable snapshots of an origin response plus the request-derived key
//! they are stored under.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::Deserialize;

use super::compression::{is_compressible, CompressionAlgorithm, Compressor, GzipCompressor};
use crate::error::{Error, Result};

/// Suffix that distinguishes the gzip representation's validator
pub const GZIP_ETAG_SUFFIX: &str = "-gzip";

// =============================================================================
// Cache Key
// =============================================================================

/// How much of the request URI takes part in the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Method and normalized path; query and fragment are ignored
    #[default]
    Path,
    /// Method, normalized path and raw query string
    PathAndQuery,
}

/// Cache key - method plus normalized request URI, e.g. `GET_/style/app.css`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already computed key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Compute the key for a request.
    ///
    /// HEAD shares the GET key: both are answered from the same entry.
    pub fn from_request(method: &Method, uri: &Uri, strategy: KeyStrategy) -> Self {
        let method = if *method == Method::HEAD {
            Method::GET.as_str()
        } else {
            method.as_str()
        };

        let mut key = format!("{}_{}", method, normalize_path(uri.path()));
        if strategy == KeyStrategy::PathAndQuery {
            if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
                key.push('?');
                key.push_str(query);
            }
        }
        Self(key)
    }

    /// Get the key as a string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Normalize a request path so equivalent spellings share a key.
///
/// Percent-escapes are decoded, empty and `.` segments dropped, `..` resolved
/// without escaping the root. A trailing slash is preserved.
pub fn normalize_path(path: &str) -> String {
    let decoded = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut normalized = String::with_capacity(decoded.len() + 1);
    normalized.push('/');
    normalized.push_str(&segments.join("/"));
    if decoded.ends_with('/') && !segments.is_empty() {
        normalized.push('/');
    }
    normalized
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached response. Built once by the population path, never mutated.
#[derive(Clone)]
pub struct CacheEntry {
    status: StatusCode,
    content_type: String,
    body: Bytes,
    gzipped_body: Option<Bytes>,
    headers: HeaderMap,
    /// Whole seconds; HTTP dates cannot carry more
    last_modified: DateTime<Utc>,
    etag: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Create an entry with no extra headers, modified at `last_modified`
    pub fn new(
        status: StatusCode,
        content_type: impl Into<String>,
        body: Bytes,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let last_modified = truncate_to_second(last_modified);
        Self {
            status,
            content_type: content_type.into(),
            body,
            gzipped_body: None,
            headers: HeaderMap::new(),
            etag: etag_for_timestamp(last_modified),
            last_modified,
            expires_at: None,
        }
    }

    /// Attach response headers captured from the origin
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the absolute expiry used by the TTL policy
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Attach a pre-compressed representation.
    ///
    /// The gzip bytes must decompress to exactly [`body`](Self::body).
    pub fn with_gzipped_body(mut self, gzipped: Bytes) -> Result<Self> {
        let inflated = GzipCompressor::new().decompress(&gzipped)?;
        if inflated.as_slice() != self.body.as_ref() {
            return Err(Error::Internal(format!(
                "gzip variant inflates to {} bytes, body has {}",
                inflated.len(),
                self.body.len()
            )));
        }
        self.gzipped_body = Some(gzipped);
        Ok(self)
    }

    /// Response status captured from the origin
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Media type of the body
    #[inline]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Uncompressed body (zero-copy)
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Gzip representation, if one was stored
    #[inline]
    pub fn gzipped_body(&self) -> Option<&Bytes> {
        self.gzipped_body.as_ref()
    }

    /// Headers captured from the origin
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Last modification time, truncated to whole seconds
    #[inline]
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Absolute expiry (TTL policy only)
    #[inline]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Strong validator of the identity representation
    #[inline]
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Validator for the representation sent with `algorithm`
    pub fn etag_for(&self, algorithm: CompressionAlgorithm) -> String {
        match algorithm {
            CompressionAlgorithm::None => self.etag.clone(),
            CompressionAlgorithm::Gzip => gzip_etag(&self.etag),
        }
    }

    /// True when the content type may be sent gzip-encoded
    #[inline]
    pub fn is_compressible(&self) -> bool {
        is_compressible(&self.content_type)
    }

    /// True when a gzip representation is available to send
    #[inline]
    pub fn has_gzip_variant(&self) -> bool {
        self.gzipped_body.is_some() && self.is_compressible()
    }

    /// Bytes held by this entry across both representations
    pub fn size(&self) -> u64 {
        (self.body.len() + self.gzipped_body.as_ref().map_or(0, Bytes::len)) as u64
    }

    /// True for 2xx statuses, the only ones worth keeping
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("status", &self.status.as_u16())
            .field("content_type", &self.content_type)
            .field("size", &self.body.len())
            .field("gzip", &self.gzipped_body.as_ref().map(Bytes::len))
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .finish()
    }
}

/// Drop sub-second precision
pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp(), 0).single().unwrap_or(t)
}

fn etag_for_timestamp(t: DateTime<Utc>) -> String {
    format!("\"{:x}\"", t.timestamp())
}

fn gzip_etag(etag: &str) -> String {
    let bare = etag.trim_end_matches('"');
    format!("{}{}\"", bare, GZIP_ETAG_SUFFIX)
}

// =============================================================================
// Tests
// =============================================================================
