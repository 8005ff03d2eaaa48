//! Origin Ports
//!
//! The cache core consumes three collaborators it does not implement itself.
//! Each is a trait; infrastructure (the filesystem origin, an application
//! renderer, a test double) provides the implementation.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CachingFilter                          │
//! │   CachePredicate  │  OriginProducer  │  FreshnessOracle      │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │      FileOrigin (static resources under a root directory)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod file;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, StatusCode};

use crate::error::Result;

pub use file::{content_type_for, FileOrigin, DEFAULT_MAX_RESOURCE_SIZE};

// =============================================================================
// Value Objects
// =============================================================================

/// What the origin produced for one request
#[derive(Debug, Clone)]
pub struct OriginResponse {
    /// Response status
    pub status: StatusCode,
    /// Media type of `body`
    pub content_type: Option<String>,
    /// Other response headers
    pub headers: HeaderMap,
    /// Uncompressed body
    pub body: Bytes,
    /// Modification time of the backing resource, when the origin knows it
    pub last_modified: Option<DateTime<Utc>>,
}

impl OriginResponse {
    /// Create a response with no headers
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: None,
            headers: HeaderMap::new(),
            body: body.into(),
            last_modified: None,
        }
    }

    /// A `200 OK` response with a content type
    pub fn ok(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body).with_content_type(content_type)
    }

    /// Set the media type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Append a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the backing resource's modification time
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Performs the real work for a request (render a page, read a file, ...)
#[async_trait]
pub trait OriginProducer: Send + Sync {
    /// Produce the full response for `request`.
    ///
    /// Errors propagate to the caller; a non-success status is a normal
    /// response, not an error.
    async fn produce(&self, request: &Request<()>) -> Result<OriginResponse>;
}

/// Reports when the resource behind a request last changed
#[async_trait]
pub trait FreshnessOracle: Send + Sync {
    /// Current modification time, or `None` when it cannot be resolved
    async fn last_modified(&self, request: &Request<()>) -> Option<DateTime<Utc>>;
}

/// Decides whether a request may go through the cache at all
#[async_trait]
pub trait CachePredicate: Send + Sync {
    /// True when the request is eligible for caching
    async fn is_cacheable(&self, request: &Request<()>) -> bool;
}

/// Oracle for origins with no notion of a backing resource
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOracle;

#[async_trait]
impl FreshnessOracle for NoOracle {
    async fn last_modified(&self, _request: &Request<()>) -> Option<DateTime<Utc>> {
        None
    }
}

/// Predicate that admits every request
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCacheable;

#[async_trait]
impl CachePredicate for AlwaysCacheable {
    async fn is_cacheable(&self, _request: &Request<()>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_response_builders() {
        let response = OriginResponse::ok("text/css", "body{color:red}")
            .with_header(
                HeaderName::from_static("x-origin"),
                HeaderValue::from_static("disk"),
            );

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type.as_deref(), Some("text/css"));
        assert_eq!(response.body.len(), 15);
        assert_eq!(response.headers["x-origin"], "disk");
        assert!(response.last_modified.is_none());
    }

    #[tokio::test]
    async fn test_default_collaborators() {
        let request = Request::get("/anything").body(()).unwrap();
        assert!(NoOracle.last_modified(&request).await.is_none());
        assert!(AlwaysCacheable.is_cacheable(&request).await);
    }
}
