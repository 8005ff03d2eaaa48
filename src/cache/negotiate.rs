//! Content Negotiation
//!
//! Renders a cached entry for one request: conditional-GET short-circuit,
//! gzip/identity selection, status-driven body suppression and the canonical
//! caching headers.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    TRANSFER_ENCODING, VARY,
};
use http::{HeaderMap, Method, StatusCode};

use super::compression::CompressionAlgorithm;
use super::entry::CacheEntry;
use super::policy::{offset, ETERNAL_HORIZON};
use crate::error::{Error, Result};

/// Placeholder in the cache-control template replaced by the remaining seconds
pub const TTL_PLACEHOLDER: &str = "%TTL";

/// Default cache-control template
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=%TTL";

/// Headers upstream code may have set that the cache owns on the way out
pub const CONFLICTING_HEADERS: [HeaderName; 5] =
    [LAST_MODIFIED, EXPIRES, CACHE_CONTROL, ETAG, ACCEPT_RANGES];

/// Headers recomputed for every response and never replayed from the entry
pub const COMPUTED_HEADERS: [HeaderName; 6] = [
    CONTENT_LENGTH,
    CONTENT_ENCODING,
    CONTENT_TYPE,
    TRANSFER_ENCODING,
    VARY,
    ACCEPT_RANGES,
];

/// A response rendered from a cache entry
#[derive(Debug, Clone)]
pub enum Negotiation {
    /// Full response; `body` is exactly what must be written
    Full {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        encoding: CompressionAlgorithm,
    },
    /// `304 Not Modified` with validators only
    NotModified { headers: HeaderMap },
}

impl Negotiation {
    /// Status to send
    pub fn status(&self) -> StatusCode {
        match self {
            Negotiation::Full { status, .. } => *status,
            Negotiation::NotModified { .. } => StatusCode::NOT_MODIFIED,
        }
    }

    /// Headers to send
    pub fn headers(&self) -> &HeaderMap {
        match self {
            Negotiation::Full { headers, .. } | Negotiation::NotModified { headers } => headers,
        }
    }

    /// Body bytes to write
    pub fn body(&self) -> Bytes {
        match self {
            Negotiation::Full { body, .. } => body.clone(),
            Negotiation::NotModified { .. } => Bytes::new(),
        }
    }

    /// Encoding of the written body
    pub fn encoding(&self) -> CompressionAlgorithm {
        match self {
            Negotiation::Full { encoding, .. } => *encoding,
            Negotiation::NotModified { .. } => CompressionAlgorithm::None,
        }
    }

    /// True for the conditional-GET short-circuit
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Negotiation::NotModified { .. })
    }

    /// Split into status, headers and body
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        match self {
            Negotiation::Full {
                status,
                headers,
                body,
                ..
            } => (status, headers, body),
            Negotiation::NotModified { headers } => (StatusCode::NOT_MODIFIED, headers, Bytes::new()),
        }
    }
}

/// Renders cache entries against request headers
#[derive(Debug, Clone)]
pub struct ContentNegotiator {
    cache_control: String,
}

impl Default for ContentNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CONTROL)
    }
}

impl ContentNegotiator {
    /// Create a negotiator with a cache-control template such as
    /// `public, max-age=%TTL`
    pub fn new(cache_control: impl Into<String>) -> Self {
        Self {
            cache_control: cache_control.into(),
        }
    }

    /// Cache-control value for `remaining` freshness
    pub fn cache_control(&self, remaining: Duration) -> String {
        self.cache_control
            .replace(TTL_PLACEHOLDER, &remaining.as_secs().to_string())
    }

    /// Render a stored entry.
    ///
    /// `remaining` is the freshness left at `now`; it drives `max-age` and
    /// `Expires` so both reflect write time, not population time.
    pub fn negotiate(
        &self,
        entry: &CacheEntry,
        method: &Method,
        request_headers: &HeaderMap,
        remaining: Duration,
        now: DateTime<Utc>,
    ) -> Result<Negotiation> {
        let remaining = remaining.min(ETERNAL_HORIZON);
        let encoding = if entry.has_gzip_variant() && accepts_gzip(request_headers) {
            CompressionAlgorithm::Gzip
        } else {
            CompressionAlgorithm::None
        };

        let mut validators = HeaderMap::new();
        validators.insert(
            CACHE_CONTROL,
            header_value(&CACHE_CONTROL, &self.cache_control(remaining))?,
        );
        validators.insert(ETAG, header_value(&ETAG, &entry.etag_for(encoding))?);
        validators.insert(
            LAST_MODIFIED,
            header_value(&LAST_MODIFIED, &http_date(entry.last_modified()))?,
        );
        let vary = vary_value(entry)?;
        if let Some(vary) = &vary {
            validators.insert(VARY, vary.clone());
        }

        if entry.status() == StatusCode::OK && is_not_modified(entry, request_headers) {
            let mut headers = validators;
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            return Ok(Negotiation::NotModified { headers });
        }

        let mut headers = replayable_headers(entry);
        for (name, value) in validators.iter() {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(
            EXPIRES,
            header_value(&EXPIRES, &http_date(offset(now, remaining)))?,
        );

        let representation = match encoding {
            CompressionAlgorithm::Gzip => {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                entry.gzipped_body().cloned().unwrap_or_default()
            }
            CompressionAlgorithm::None => entry.body().clone(),
        };

        self.finish(entry, method, headers, representation, encoding)
    }

    /// Render an entry that was not kept (non-2xx origin response).
    ///
    /// No validators are attached; the origin's headers pass through.
    pub fn render_uncached(&self, entry: &CacheEntry, method: &Method) -> Result<Negotiation> {
        let mut headers = replayable_headers(entry);
        // The body is replayed verbatim, so its coding labels go with it
        for name in [CACHE_CONTROL, CONTENT_ENCODING, VARY] {
            for value in entry.headers().get_all(&name) {
                headers.append(name.clone(), value.clone());
            }
        }
        let body = entry.body().clone();
        self.finish(entry, method, headers, body, CompressionAlgorithm::None)
    }

    fn finish(
        &self,
        entry: &CacheEntry,
        method: &Method,
        mut headers: HeaderMap,
        representation: Bytes,
        encoding: CompressionAlgorithm,
    ) -> Result<Negotiation> {
        let status = entry.status();

        // 204 and 304 never carry a body
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            headers.remove(CONTENT_ENCODING);
            return Ok(Negotiation::Full {
                status,
                headers,
                body: Bytes::new(),
                encoding: CompressionAlgorithm::None,
            });
        }

        if !entry.content_type().is_empty() {
            headers.insert(
                CONTENT_TYPE,
                header_value(&CONTENT_TYPE, entry.content_type())?,
            );
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(representation.len()));

        let body = if *method == Method::HEAD {
            Bytes::new()
        } else {
            representation
        };

        Ok(Negotiation::Full {
            status,
            headers,
            body,
            encoding,
        })
    }
}

/// Whether the client accepts gzip, honouring `q=0` refusals and `*`
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut gzip_q: Option<f32> = None;
    let mut star_q: Option<f32> = None;

    for value in headers.get_all(ACCEPT_ENCODING) {
        let Ok(value) = value.to_str() else { continue };
        for item in value.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let mut q = Some(1.0);
            for param in parts {
                if let Some((name, v)) = param.split_once('=') {
                    if name.trim().eq_ignore_ascii_case("q") {
                        q = v.trim().parse::<f32>().ok().filter(|q| (0.0..=1.0).contains(q));
                    }
                }
            }
            // Members with an unparseable weight are ignored
            let Some(q) = q else { continue };
            match coding.as_str() {
                "gzip" | "x-gzip" => gzip_q = Some(q),
                "*" => star_q = Some(q),
                _ => {}
            }
        }
    }

    gzip_q.or(star_q).is_some_and(|q| q > 0.0)
}

fn is_not_modified(entry: &CacheEntry, headers: &HeaderMap) -> bool {
    // If-None-Match takes precedence; If-Modified-Since is then ignored
    if headers.contains_key(IF_NONE_MATCH) {
        return headers
            .get_all(IF_NONE_MATCH)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|tag| etag_matches(entry, tag.trim()));
    }

    headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .map(|since| DateTime::<Utc>::from(since).timestamp() >= entry.last_modified().timestamp())
        .unwrap_or(false)
}

fn etag_matches(entry: &CacheEntry, tag: &str) -> bool {
    if tag == "*" {
        return true;
    }
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag == entry.etag_for(CompressionAlgorithm::None)
        || tag == entry.etag_for(CompressionAlgorithm::Gzip)
}

/// Origin headers minus everything the cache computes itself
fn replayable_headers(entry: &CacheEntry) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(entry.headers().len());
    for (name, value) in entry.headers() {
        if CONFLICTING_HEADERS.contains(name) || COMPUTED_HEADERS.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn vary_value(entry: &CacheEntry) -> Result<Option<HeaderValue>> {
    let mut fields: Vec<String> = entry
        .headers()
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    if entry.has_gzip_variant()
        && !fields
            .iter()
            .any(|f| f.eq_ignore_ascii_case("accept-encoding"))
    {
        fields.push("Accept-Encoding".to_string());
    }

    if fields.is_empty() {
        return Ok(None);
    }
    header_value(&VARY, &fields.join(", ")).map(Some)
}

/// Format a timestamp as an IMF-fixdate
pub fn http_date(t: DateTime<Utc>) -> String {
    httpdate::fmt_http_date(SystemTime::from(t))
}

fn header_value(name: &HeaderName, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
