//! Request/response plumbing for the filter
//!
//! [`Outgoing`] is the response under construction. Earlier pipeline stages
//! may already have set headers on it, or written it outright, before the
//! filter runs.

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, IF_MATCH,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE, RANGE,
};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::Full;

use crate::error::{Error, Result};
use crate::origin::OriginResponse;

/// Response being assembled for one request
#[derive(Debug, Clone)]
pub struct Outgoing {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    committed: bool,
}

impl Default for Outgoing {
    fn default() -> Self {
        Self::new()
    }
}

impl Outgoing {
    /// An empty, uncommitted `200 OK`
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            committed: false,
        }
    }

    /// True once status and body have been written
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Status written so far
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Headers set so far
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Headers, for stages that run before the body is written
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Body written so far
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Write status, headers and body, then commit.
    ///
    /// `headers` replace any values already present under the same names.
    pub fn write(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes) -> Result<()> {
        if self.committed {
            return Err(Error::AlreadyCommitted);
        }
        self.status = status;
        self.headers.extend(headers);
        self.body = body;
        self.committed = true;
        Ok(())
    }

    /// Write an origin response as-is, outside the cache
    pub fn write_origin(&mut self, method: &Method, origin: OriginResponse) -> Result<()> {
        let OriginResponse {
            status,
            content_type,
            mut headers,
            body,
            ..
        } = origin;

        if let Some(content_type) = content_type {
            let value = HeaderValue::from_str(&content_type).map_err(|e| Error::InvalidHeader {
                name: CONTENT_TYPE.to_string(),
                reason: e.to_string(),
            })?;
            headers.insert(CONTENT_TYPE, value);
        }

        let body = if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            Bytes::new()
        } else {
            body
        };
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        let body = if *method == Method::HEAD { Bytes::new() } else { body };
        self.write(status, headers, body)
    }

    /// Mark the response as written by someone else
    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Convert into a hyper-compatible response
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Copy of `request` with its method replaced.
///
/// Used to ask the origin for the full GET representation when a HEAD
/// request populates the cache.
pub fn with_method(request: &Request<()>, method: Method) -> Request<()> {
    let mut copy = Request::new(());
    *copy.method_mut() = method;
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

/// Client headers that would make the origin answer with something other
/// than the full identity representation
const NEGOTIATION_HEADERS: [HeaderName; 7] = [
    ACCEPT_ENCODING,
    IF_NONE_MATCH,
    IF_MODIFIED_SINCE,
    IF_MATCH,
    IF_UNMODIFIED_SINCE,
    IF_RANGE,
    RANGE,
];

/// GET request used to populate the cache on behalf of `request`.
///
/// Encoding, validator and range headers are dropped; the cache negotiates
/// those itself against the stored entry.
pub fn population_request(request: &Request<()>) -> Request<()> {
    let mut copy = with_method(request, Method::GET);
    for name in NEGOTIATION_HEADERS.iter() {
        copy.headers_mut().remove(name);
    }
    copy
}

/// Value of a query parameter, percent-decoded
pub fn query_param(request: &Request<()>, name: &str) -> Option<String> {
    request.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).ok()?;
        if key != name {
            return None;
        }
        Some(
            urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CACHE_CONTROL;

    #[test]
    fn test_write_commits_once() {
        let mut outgoing = Outgoing::new();
        assert!(!outgoing.is_committed());

        outgoing
            .write(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"hello"))
            .unwrap();
        assert!(outgoing.is_committed());

        let err = outgoing
            .write(StatusCode::OK, HeaderMap::new(), Bytes::new())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyCommitted));
        assert_eq!(outgoing.body().as_ref(), b"hello");
    }

    #[test]
    fn test_written_headers_replace_upstream_values() {
        let mut outgoing = Outgoing::new();
        outgoing
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        outgoing
            .headers_mut()
            .insert("x-request-id", HeaderValue::from_static("abc"));

        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        outgoing.write(StatusCode::OK, headers, Bytes::new()).unwrap();

        assert_eq!(outgoing.headers()[CACHE_CONTROL], "max-age=60");
        assert_eq!(outgoing.headers()["x-request-id"], "abc");
    }

    #[test]
    fn test_write_origin_head_and_no_content() {
        let mut head = Outgoing::new();
        head.write_origin(&Method::HEAD, OriginResponse::ok("text/plain", "twelve bytes"))
            .unwrap();
        assert!(head.body().is_empty());
        assert_eq!(head.headers()[CONTENT_LENGTH], "12");
        assert_eq!(head.headers()[CONTENT_TYPE], "text/plain");

        let mut empty = Outgoing::new();
        empty
            .write_origin(&Method::GET, OriginResponse::new(StatusCode::NO_CONTENT, "ignored"))
            .unwrap();
        assert!(empty.body().is_empty());
        assert_eq!(empty.headers()[CONTENT_LENGTH], "0");
    }

    #[test]
    fn test_with_method_keeps_uri_and_headers() {
        let request = Request::head("/a.css?v=1")
            .header("accept-encoding", "gzip")
            .body(())
            .unwrap();
        let get = with_method(&request, Method::GET);
        assert_eq!(get.method(), Method::GET);
        assert_eq!(get.uri(), "/a.css?v=1");
        assert_eq!(get.headers()["accept-encoding"], "gzip");
    }

    #[test]
    fn test_population_request_drops_negotiation_headers() {
        let request = Request::head("/a.css")
            .header(ACCEPT_ENCODING, "gzip")
            .header(IF_NONE_MATCH, "\"6553f100\"")
            .header(IF_MODIFIED_SINCE, "Tue, 14 Nov 2023 22:13:20 GMT")
            .header(RANGE, "bytes=0-10")
            .header("cookie", "session=1")
            .body(())
            .unwrap();

        let origin = population_request(&request);
        assert_eq!(origin.method(), Method::GET);
        assert_eq!(origin.uri(), "/a.css");
        for name in NEGOTIATION_HEADERS.iter() {
            assert!(origin.headers().get(name).is_none(), "{}", name);
        }
        assert_eq!(origin.headers()["cookie"], "session=1");
    }

    #[test]
    fn test_query_param() {
        let request = Request::get("/a?x=1&cache=false&y").body(()).unwrap();
        assert_eq!(query_param(&request, "cache").as_deref(), Some("false"));
        assert_eq!(query_param(&request, "y").as_deref(), Some(""));
        assert_eq!(query_param(&request, "z"), None);

        let plain = Request::get("/a").body(()).unwrap();
        assert_eq!(query_param(&plain, "cache"), None);
    }
}
