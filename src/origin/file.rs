//! Static resource origin
//!
//! Serves files below a root directory and answers freshness and
//! eligibility questions from the same filesystem metadata.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Request, StatusCode};
use tracing::debug;

use super::{CachePredicate, FreshnessOracle, OriginProducer, OriginResponse};
use crate::cache::normalize_path;
use crate::error::Result;

/// Largest file the cache will hold by default (1 MiB)
pub const DEFAULT_MAX_RESOURCE_SIZE: u64 = 1024 * 1024;

const INDEX_FILE: &str = "index.html";

/// Filesystem-backed origin for static resources
#[derive(Debug, Clone)]
pub struct FileOrigin {
    root: PathBuf,
    max_size: u64,
}

impl FileOrigin {
    /// Serve files below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_size: DEFAULT_MAX_RESOURCE_SIZE,
        }
    }

    /// Set the largest file eligible for caching
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request path to a file below the root.
    ///
    /// The path is normalized first, so `..` can never climb above the root.
    /// Directory paths resolve to their `index.html`.
    pub fn resolve(&self, request_path: &str) -> PathBuf {
        let normalized = normalize_path(request_path);
        let mut path = self.root.clone();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        if normalized.ends_with('/') {
            path.push(INDEX_FILE);
        }
        path
    }
}

#[async_trait]
impl OriginProducer for FileOrigin {
    async fn produce(&self, request: &Request<()>) -> Result<OriginResponse> {
        let path = self.resolve(request.uri().path());

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(not_found()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(not_found()),
            Err(e) => return Err(e.into()),
        };

        let body = tokio::fs::read(&path).await?;
        debug!(path = %path.display(), size = body.len(), "Read static resource");

        let mut response = OriginResponse::ok(content_type_for(&path), Bytes::from(body));
        if let Ok(modified) = metadata.modified() {
            response = response.with_last_modified(DateTime::<Utc>::from(modified));
        }
        Ok(response)
    }
}

#[async_trait]
impl FreshnessOracle for FileOrigin {
    async fn last_modified(&self, request: &Request<()>) -> Option<DateTime<Utc>> {
        let path = self.resolve(request.uri().path());
        let modified = tokio::fs::metadata(&path).await.ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }
}

#[async_trait]
impl CachePredicate for FileOrigin {
    /// Only existing files no larger than the size threshold are cached
    async fn is_cacheable(&self, request: &Request<()>) -> bool {
        let path = self.resolve(request.uri().path());
        match tokio::fs::metadata(&path).await {
            Ok(m) => m.is_file() && m.len() <= self.max_size,
            Err(_) => false,
        }
    }
}

fn not_found() -> OriginResponse {
    OriginResponse::new(StatusCode::NOT_FOUND, "Not Found")
        .with_content_type("text/plain; charset=utf-8")
}

/// Guess a media type from the file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" | "psml" | "xsl" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
