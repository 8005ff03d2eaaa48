//! Caching Filter
//!
//! Request pipeline in front of an origin:
//!
//! ```text
//! request
//!   │
//!   ├─ committed?  ───────────────────────────▶ Committed (no-op)
//!   ├─ cacheable?  (bypass param, method, predicate) ─▶ origin ─▶ Bypassed
//!   ├─ reentrant?  ───────────────────────────▶ origin ─▶ Bypassed
//!   │
//!   ├─ peek + freshness ── stale ──▶ mark_stale
//!   ├─ get_or_compute ──── miss ───▶ origin ─▶ CacheEntry (2xx kept, else served once)
//!   └─ negotiate ─▶ write
//! ```
//!
//! Everything after the reentrancy check runs under the task-local guard, so
//! the mark is cleared on every exit path.

mod guard;
mod response;

use std::sync::Arc;

use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{Method, Request};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{
    CacheEntry, CacheKey, CacheMetrics, CompressionAlgorithm, CompressionManager,
    ContentNegotiator, FreshnessMode, FreshnessPolicy, KeyStrategy, KeyedBlockingCache,
    LookupSource, Negotiation, Population, COMPUTED_HEADERS, CONFLICTING_HEADERS,
};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::origin::{AlwaysCacheable, CachePredicate, FreshnessOracle, NoOracle, OriginProducer};

pub use self::guard::is_active as is_filter_active;
pub use self::response::{population_request, query_param, with_method, Outgoing};

// =============================================================================
// Outcome
// =============================================================================

/// Why a request went straight to the origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Method or predicate excluded the request
    Ineligible,
    /// The filter is already running for this request
    Reentrant,
    /// The bypass query parameter turned caching off
    Disabled,
}

/// How the filter handled a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Served from a fresh cached entry
    Hit,
    /// This request populated the entry
    Built,
    /// Another request populated the entry while this one waited
    Joined,
    /// Non-success origin response, served once and not kept
    Uncached,
    /// Conditional request answered with `304`
    NotModified,
    /// Origin invoked directly
    Bypassed(BypassReason),
    /// Response already written upstream; nothing done
    Committed,
}

impl Disposition {
    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Hit => "hit",
            Disposition::Built => "built",
            Disposition::Joined => "joined",
            Disposition::Uncached => "uncached",
            Disposition::NotModified => "not-modified",
            Disposition::Bypassed(BypassReason::Ineligible) => "bypass-ineligible",
            Disposition::Bypassed(BypassReason::Reentrant) => "bypass-reentrant",
            Disposition::Bypassed(BypassReason::Disabled) => "bypass-disabled",
            Disposition::Committed => "committed",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Caches origin responses and negotiates them onto outgoing responses
pub struct CachingFilter {
    id: Uuid,
    cache: Arc<KeyedBlockingCache>,
    producer: Arc<dyn OriginProducer>,
    oracle: Arc<dyn FreshnessOracle>,
    predicate: Arc<dyn CachePredicate>,
    policy: FreshnessPolicy,
    negotiator: ContentNegotiator,
    compression: Arc<CompressionManager>,
    clock: Arc<dyn Clock>,
    key_strategy: KeyStrategy,
    bypass_parameter: Option<String>,
}

impl CachingFilter {
    /// Filter over an origin that also answers freshness and eligibility
    pub fn new<O>(origin: Arc<O>) -> Self
    where
        O: OriginProducer + FreshnessOracle + CachePredicate + 'static,
    {
        Self::with_producer(origin.clone())
            .with_oracle(origin.clone())
            .with_predicate(origin)
    }

    /// Filter over a bare producer: every GET/HEAD is cacheable and no
    /// freshness oracle is consulted
    pub fn with_producer(producer: Arc<dyn OriginProducer>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cache: Arc::new(KeyedBlockingCache::new("resource-cache")),
            producer,
            oracle: Arc::new(NoOracle),
            predicate: Arc::new(AlwaysCacheable),
            policy: FreshnessPolicy::default(),
            negotiator: ContentNegotiator::default(),
            compression: Arc::new(CompressionManager::new()),
            clock: Arc::new(SystemClock),
            key_strategy: KeyStrategy::default(),
            bypass_parameter: Some("cache".to_string()),
        }
    }

    /// Filter configured from `config`
    pub fn from_config<O>(config: &CacheConfig, origin: Arc<O>) -> Self
    where
        O: OriginProducer + FreshnessOracle + CachePredicate + 'static,
    {
        let cache = KeyedBlockingCache::with_timeout(config.name.clone(), config.population_timeout());
        Self::new(origin)
            .with_cache(Arc::new(cache))
            .with_policy(config.freshness_policy())
            .with_negotiator(ContentNegotiator::new(config.cache_control.clone()))
            .with_compression(CompressionManager::with_config(config.compression.clone()))
            .with_key_strategy(config.key_strategy)
            .with_bypass_parameter(config.bypass_parameter().map(str::to_string))
    }

    /// Source of the backing resource's modification time
    pub fn with_oracle(mut self, oracle: Arc<dyn FreshnessOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Decides which requests may be cached at all
    pub fn with_predicate(mut self, predicate: Arc<dyn CachePredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Use an existing (possibly shared) cache
    pub fn with_cache(mut self, cache: Arc<KeyedBlockingCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Freshness policy for stored entries
    pub fn with_policy(mut self, policy: FreshnessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Negotiator carrying the cache-control template
    pub fn with_negotiator(mut self, negotiator: ContentNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    /// Compression settings for gzip variants
    pub fn with_compression(mut self, compression: CompressionManager) -> Self {
        self.compression = Arc::new(compression);
        self
    }

    /// Time source for freshness and `Expires`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How requests map to cache keys
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Query parameter that disables caching; `None` turns the check off
    pub fn with_bypass_parameter(mut self, parameter: Option<String>) -> Self {
        self.bypass_parameter = parameter;
        self
    }

    /// The underlying cache, for administration
    pub fn cache(&self) -> &Arc<KeyedBlockingCache> {
        &self.cache
    }

    /// Metrics shared with the cache
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        self.cache.metrics()
    }

    /// Active freshness policy
    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// Identity used by the reentrancy guard
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Key a request is cached under
    pub fn key_for(&self, request: &Request<()>) -> CacheKey {
        CacheKey::from_request(request.method(), request.uri(), self.key_strategy)
    }

    /// Handle one request, writing the result to `response`.
    ///
    /// Origin failures and population timeouts are returned as errors; use
    /// [`Error::status_code`](crate::error::Error::status_code) to map them.
    pub async fn handle(&self, request: &Request<()>, response: &mut Outgoing) -> Result<Disposition> {
        if response.is_committed() {
            self.metrics().record_committed();
            warn!(
                uri = %request.uri(),
                status = response.status().as_u16(),
                "Response already committed upstream, skipping cache"
            );
            return Ok(Disposition::Committed);
        }

        if let Some(reason) = self.bypass_reason(request).await {
            self.metrics().record_bypass();
            debug!(uri = %request.uri(), method = %request.method(), reason = ?reason, "Bypassing cache");
            self.pass_through(request, response).await?;
            return Ok(Disposition::Bypassed(reason));
        }

        if guard::is_active(self.id) {
            self.metrics().record_reentrant();
            warn!(
                filter = %self.id,
                uri = %request.uri(),
                "Reentrant invocation of caching filter, calling origin directly"
            );
            self.pass_through(request, response).await?;
            return Ok(Disposition::Bypassed(BypassReason::Reentrant));
        }

        guard::guarded(self.id, self.serve_cached(request, response)).await
    }

    async fn bypass_reason(&self, request: &Request<()>) -> Option<BypassReason> {
        if let Some(parameter) = &self.bypass_parameter {
            if query_param(request, parameter).is_some_and(|v| is_disabled(&v)) {
                return Some(BypassReason::Disabled);
            }
        }
        let method = request.method();
        if method != Method::GET && method != Method::HEAD {
            return Some(BypassReason::Ineligible);
        }
        if !self.predicate.is_cacheable(request).await {
            return Some(BypassReason::Ineligible);
        }
        None
    }

    async fn pass_through(&self, request: &Request<()>, response: &mut Outgoing) -> Result<()> {
        let origin = self.producer.produce(request).await?;
        response.write_origin(request.method(), origin)
    }

    async fn serve_cached(&self, request: &Request<()>, response: &mut Outgoing) -> Result<Disposition> {
        let key = self.key_for(request);
        self.expire_if_stale(&key, request).await;

        // HEAD shares the GET entry, which must carry the full body
        let origin_request = population_request(request);
        let lookup = self
            .cache
            .get_or_compute(&key, || self.populate(&key, &origin_request))
            .await?;

        let now = self.clock.now();
        let negotiation = if lookup.stored {
            let remaining = self.policy.remaining(&lookup.entry, now);
            self.negotiator
                .negotiate(&lookup.entry, request.method(), request.headers(), remaining, now)?
        } else {
            self.negotiator.render_uncached(&lookup.entry, request.method())?
        };

        let disposition = if negotiation.is_not_modified() {
            self.metrics().record_not_modified();
            Disposition::NotModified
        } else if !lookup.stored {
            Disposition::Uncached
        } else {
            match lookup.source {
                LookupSource::Hit => Disposition::Hit,
                LookupSource::Built => Disposition::Built,
                LookupSource::Joined => Disposition::Joined,
            }
        };

        self.write(response, negotiation)?;
        debug!(
            key = %key,
            status = response.status().as_u16(),
            disposition = %disposition,
            "Served through cache"
        );
        Ok(disposition)
    }

    /// Flag the cached entry stale if the policy says so, forcing a rebuild
    async fn expire_if_stale(&self, key: &CacheKey, request: &Request<()>) {
        let Some(entry) = self.cache.peek(key) else {
            return;
        };
        let resource_modified = match self.policy.mode {
            FreshnessMode::Resource => self.oracle.last_modified(request).await,
            FreshnessMode::Ttl => None,
        };
        if !self.policy.is_fresh(&entry, resource_modified, self.clock.now()) {
            debug!(key = %key, policy = %self.policy.name, "Cached entry is stale");
            self.cache.mark_stale(key, &entry);
        }
    }

    /// Run the origin and turn its response into a cache entry
    async fn populate(&self, key: &CacheKey, request: &Request<()>) -> Result<Population> {
        let origin = self.producer.produce(request).await?;
        let now = self.clock.now();

        let last_modified = match origin.last_modified {
            Some(modified) => modified,
            None => self.oracle.last_modified(request).await.unwrap_or(now),
        };
        let content_type = origin
            .content_type
            .or_else(|| {
                origin
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        // Stored bodies are identity; an origin that encodes anyway is served as-is once
        let encoded = origin
            .headers
            .get_all(CONTENT_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|coding| !coding.trim().eq_ignore_ascii_case("identity"));

        let mut entry = CacheEntry::new(origin.status, content_type, origin.body, last_modified)
            .with_headers(origin.headers);

        if !entry.is_success() || encoded {
            debug!(
                key = %key,
                status = entry.status().as_u16(),
                encoded,
                "Origin response will not be cached"
            );
            return Ok(Population::ServeOnce(entry));
        }

        if let Some(expires_at) = self.policy.expires_at(now) {
            entry = entry.with_expires_at(expires_at);
        }
        if entry.is_compressible() {
            if let Some(gzipped) = self.compression.gzip_variant(entry.body())? {
                entry = entry.with_gzipped_body(gzipped)?;
            }
        }

        debug!(
            key = %key,
            status = entry.status().as_u16(),
            size = entry.size(),
            gzip = entry.has_gzip_variant(),
            "Built cache entry"
        );
        Ok(Population::Store(entry))
    }

    fn write(&self, response: &mut Outgoing, negotiation: Negotiation) -> Result<()> {
        let gzip = negotiation.encoding() == CompressionAlgorithm::Gzip;
        let (status, headers, body) = negotiation.into_parts();

        // Upstream values for headers the cache owns never survive, including
        // representation headers a 304 must not carry
        for name in CONFLICTING_HEADERS.iter().chain(COMPUTED_HEADERS.iter()) {
            response.headers_mut().remove(name);
        }

        self.metrics().record_body(body.len() as u64, gzip);
        response.write(status, headers, body)
    }
}

impl std::fmt::Debug for CachingFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingFilter")
            .field("id", &self.id)
            .field("cache", &self.cache)
            .field("policy", &self.policy)
            .field("key_strategy", &self.key_strategy)
            .field("bypass_parameter", &self.bypass_parameter)
            .finish()
    }
}

fn is_disabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "off" | "no" | "0"
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compression::GzipCompressor;
    use crate::cache::{CompressionConfig, Compressor, GZIP_ETAG_SUFFIX};
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::origin::OriginResponse;
    use http::header::{
        HeaderValue, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, ETAG,
        EXPIRES, IF_NONE_MATCH, VARY,
    };
    use http::StatusCode;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CSS: &str = "body{color:red}";

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    struct StubOrigin {
        calls: AtomicUsize,
        status: StatusCode,
        content_type: &'static str,
        body: Bytes,
        modified: Mutex<Option<DateTime<Utc>>>,
        methods: Mutex<Vec<Method>>,
    }

    impl StubOrigin {
        fn new(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status,
                content_type,
                body: body.into(),
                modified: Mutex::new(Some(epoch())),
                methods: Mutex::new(Vec::new()),
            })
        }

        fn css() -> Arc<Self> {
            Self::new(StatusCode::OK, "text/css", CSS)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OriginProducer for StubOrigin {
        async fn produce(&self, request: &Request<()>) -> Result<OriginResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.methods.lock().push(request.method().clone());
            let mut response = OriginResponse::new(self.status, self.body.clone())
                .with_content_type(self.content_type);
            if let Some(modified) = *self.modified.lock() {
                response = response.with_last_modified(modified);
            }
            Ok(response)
        }
    }

    #[async_trait]
    impl FreshnessOracle for StubOrigin {
        async fn last_modified(&self, _request: &Request<()>) -> Option<DateTime<Utc>> {
            *self.modified.lock()
        }
    }

    #[async_trait]
    impl CachePredicate for StubOrigin {
        async fn is_cacheable(&self, _request: &Request<()>) -> bool {
            true
        }
    }

    fn filter(origin: &Arc<StubOrigin>, clock: &ManualClock) -> CachingFilter {
        CachingFilter::new(origin.clone()).with_clock(Arc::new(clock.clone()))
    }

    fn get(uri: &str) -> Request<()> {
        Request::get(uri).body(()).unwrap()
    }

    async fn run(filter: &CachingFilter, request: &Request<()>) -> (Disposition, Outgoing) {
        let mut response = Outgoing::new();
        let disposition = filter.handle(request, &mut response).await.unwrap();
        (disposition, response)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let origin = StubOrigin::css();
        let clock = ManualClock::new(epoch());
        let filter = filter(&origin, &clock);

        let (first, response) = run(&filter, &get("/style/app.css")).await;
        assert_eq!(first, Disposition::Built);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), CSS.as_bytes());
        assert_eq!(response.headers()[CACHE_CONTROL], "max-age=60");

        let (second, response) = run(&filter, &get("/style/app.css?v=2")).await;
        assert_eq!(second, Disposition::Hit);
        assert_eq!(response.body().as_ref(), CSS.as_bytes());
        assert_eq!(origin.calls(), 1);
        assert_eq!(filter.cache().keys(), vec![CacheKey::from("GET_/style/app.css")]);
    }

    #[tokio::test]
    async fn test_committed_response_left_alone() {
        let origin = StubOrigin::css();
        let filter = filter(&origin, &ManualClock::new(epoch()));

        let mut response = Outgoing::new();
        response.commit();
        let disposition = filter.handle(&get("/style/app.css"), &mut response).await.unwrap();

        assert_eq!(disposition, Disposition::Committed);
        assert_eq!(origin.calls(), 0);
        assert!(response.body().is_empty());
        assert_eq!(filter.metrics().snapshot().committed, 1);
    }

    #[tokio::test]
    async fn test_bypass_parameter_and_methods() {
        let origin = StubOrigin::css();
        let filter = filter(&origin, &ManualClock::new(epoch()));

        for _ in 0..2 {
            let (disposition, response) = run(&filter, &get("/style/app.css?cache=false")).await;
            assert_eq!(disposition, Disposition::Bypassed(BypassReason::Disabled));
            assert_eq!(response.body().as_ref(), CSS.as_bytes());
            assert!(response.headers().get(ETAG).is_none());
        }

        let post = Request::post("/style/app.css").body(()).unwrap();
        let (disposition, _) = run(&filter, &post).await;
        assert_eq!(disposition, Disposition::Bypassed(BypassReason::Ineligible));

        assert_eq!(origin.calls(), 3);
        assert!(filter.cache().is_empty());
        assert_eq!(filter.metrics().snapshot().bypasses, 3);
    }

    #[tokio::test]
    async fn test_non_success_served_once() {
        let origin = StubOrigin::new(StatusCode::NOT_FOUND, "text/html", "<h1>gone</h1>");
        let filter = filter(&origin, &ManualClock::new(epoch()));

        for _ in 0..2 {
            let (disposition, response) = run(&filter, &get("/missing.html")).await;
            assert_eq!(disposition, Disposition::Uncached);
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(response.body().as_ref(), b"<h1>gone</h1>");
        }
        assert_eq!(origin.calls(), 2);
        assert!(filter.cache().is_empty());
    }

    #[tokio::test]
    async fn test_resource_change_forces_rebuild() {
        let origin = StubOrigin::css();
        let clock = ManualClock::new(epoch());
        let filter = filter(&origin, &clock);

        run(&filter, &get("/style/app.css")).await;

        // Sub-second changes are invisible to HTTP dates
        *origin.modified.lock() = Some(epoch() + chrono::Duration::milliseconds(900));
        let (disposition, _) = run(&filter, &get("/style/app.css")).await;
        assert_eq!(disposition, Disposition::Hit);

        *origin.modified.lock() = Some(epoch() + chrono::Duration::seconds(5));
        let (disposition, _) = run(&filter, &get("/style/app.css")).await;
        assert_eq!(disposition, Disposition::Built);
        assert_eq!(origin.calls(), 2);
        assert_eq!(filter.metrics().snapshot().stale, 1);
    }

    #[tokio::test]
    async fn test_ttl_policy_expires_and_counts_down() {
        let origin = StubOrigin::css();
        let clock = ManualClock::new(epoch());
        let filter = filter(&origin, &clock).with_policy(FreshnessPolicy::ttl(std::time::Duration::from_secs(60)));

        run(&filter, &get("/style/app.css")).await;

        clock.advance(chrono::Duration::seconds(45));
        let (disposition, response) = run(&filter, &get("/style/app.css")).await;
        assert_eq!(disposition, Disposition::Hit);
        assert_eq!(response.headers()[CACHE_CONTROL], "max-age=15");
        assert!(response.headers().contains_key(EXPIRES));

        clock.advance(chrono::Duration::seconds(16));
        let (disposition, response) = run(&filter, &get("/style/app.css")).await;
        assert_eq!(disposition, Disposition::Built);
        assert_eq!(response.headers()[CACHE_CONTROL], "max-age=60");
    }

    #[tokio::test]
    async fn test_conditional_get() {
        let origin = StubOrigin::css();
        let filter = filter(&origin, &ManualClock::new(epoch()));

        let (_, first) = run(&filter, &get("/style/app.css")).await;
        let etag = first.headers()[ETAG].clone();

        let conditional = Request::get("/style/app.css")
            .header(IF_NONE_MATCH, etag)
            .body(())
            .unwrap();
        let (disposition, response) = run(&filter, &conditional).await;
        assert_eq!(disposition, Disposition::NotModified);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.body().is_empty());
        assert!(response.headers().get(CONTENT_TYPE).is_none());
        assert_eq!(filter.metrics().snapshot().not_modified, 1);
    }

    #[tokio::test]
    async fn test_gzip_negotiated_on_compressible_body() {
        let body = CSS.repeat(64);
        let origin = StubOrigin::new(StatusCode::OK, "text/css", body.clone());
        let filter = filter(&origin, &ManualClock::new(epoch())).with_compression(
            CompressionManager::with_config(CompressionConfig {
                min_size: 0,
                ..Default::default()
            }),
        );

        let gzip = Request::get("/style/app.css")
            .header(ACCEPT_ENCODING, "gzip, deflate")
            .body(())
            .unwrap();
        let (_, response) = run(&filter, &gzip).await;
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(response.headers()[VARY], "Accept-Encoding");
        assert!(response.headers()[ETAG].to_str().unwrap().contains(GZIP_ETAG_SUFFIX));
        assert!(response.body().len() < body.len());

        let (_, plain) = run(&filter, &get("/style/app.css")).await;
        assert!(plain.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(plain.body().as_ref(), body.as_bytes());
        assert_eq!(filter.metrics().snapshot().gzip_responses, 1);
    }

    #[tokio::test]
    async fn test_head_populates_with_get() {
        let origin = StubOrigin::css();
        let filter = filter(&origin, &ManualClock::new(epoch()));

        let head = Request::head("/style/app.css").body(()).unwrap();
        let (disposition, response) = run(&filter, &head).await;
        assert_eq!(disposition, Disposition::Built);
        assert!(response.body().is_empty());
        assert_eq!(response.headers()[CONTENT_LENGTH], "15");

        let (disposition, response) = run(&filter, &get("/style/app.css")).await;
        assert_eq!(disposition, Disposition::Hit);
        assert_eq!(response.body().as_ref(), CSS.as_bytes());
        assert_eq!(*origin.methods.lock(), vec![Method::GET]);
    }

    #[tokio::test]
    async fn test_upstream_conflicting_headers_stripped() {
        let origin = StubOrigin::css();
        let filter = filter(&origin, &ManualClock::new(epoch()));

        let mut response = Outgoing::new();
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
            .headers_mut()
            .insert(http::header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        response
            .headers_mut()
            .insert("x-frame-options", HeaderValue::from_static("DENY"));

        filter.handle(&get("/style/app.css"), &mut response).await.unwrap();
        assert_eq!(response.headers()[CACHE_CONTROL], "max-age=60");
        assert!(response.headers().get(http::header::ACCEPT_RANGES).is_none());
        assert_eq!(response.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn test_upstream_representation_headers_stripped() {
        let origin = StubOrigin::css();
        let filter = filter(&origin, &ManualClock::new(epoch()));
        let (_, first) = run(&filter, &get("/style/app.css")).await;
        let etag = first.headers()[ETAG].clone();

        let preset = || {
            let mut response = Outgoing::new();
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
            response
                .headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
            response
                .headers_mut()
                .insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            response
        };

        let conditional = Request::get("/style/app.css")
            .header(IF_NONE_MATCH, etag)
            .body(())
            .unwrap();
        let mut response = preset();
        let disposition = filter.handle(&conditional, &mut response).await.unwrap();
        assert_eq!(disposition, Disposition::NotModified);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().get(CONTENT_TYPE).is_none());
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert!(response.headers().get(http::header::TRANSFER_ENCODING).is_none());

        let mut response = preset();
        let disposition = filter.handle(&get("/style/app.css"), &mut response).await.unwrap();
        assert_eq!(disposition, Disposition::Hit);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/css");
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(response.headers()[CONTENT_LENGTH], "15");
        assert_eq!(response.body().as_ref(), CSS.as_bytes());
    }

    /// Origin that gzips its own output when the request allows it
    struct SelfEncoding {
        always: bool,
        seen: Mutex<Vec<http::HeaderMap>>,
    }

    impl SelfEncoding {
        fn new(always: bool) -> Arc<Self> {
            Arc::new(Self {
                always,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OriginProducer for SelfEncoding {
        async fn produce(&self, request: &Request<()>) -> Result<OriginResponse> {
            self.seen.lock().push(request.headers().clone());
            let plain = CSS.repeat(8);
            if self.always || request.headers().contains_key(ACCEPT_ENCODING) {
                let gzipped = GzipCompressor::new().compress(plain.as_bytes())?;
                return Ok(OriginResponse::ok("text/css", gzipped)
                    .with_header(CONTENT_ENCODING, HeaderValue::from_static("gzip")));
            }
            Ok(OriginResponse::ok("text/css", plain))
        }
    }

    #[tokio::test]
    async fn test_population_asks_origin_for_identity() {
        let origin = SelfEncoding::new(false);
        let filter = CachingFilter::with_producer(origin.clone());
        let plain = CSS.repeat(8);

        let gzip_client = Request::get("/style/app.css")
            .header(ACCEPT_ENCODING, "gzip")
            .header(IF_NONE_MATCH, "\"0\"")
            .header(http::header::RANGE, "bytes=0-3")
            .body(())
            .unwrap();
        let (disposition, _) = run(&filter, &gzip_client).await;
        assert_eq!(disposition, Disposition::Built);

        let seen = origin.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].get(ACCEPT_ENCODING).is_none());
        assert!(seen[0].get(IF_NONE_MATCH).is_none());
        assert!(seen[0].get(http::header::RANGE).is_none());

        let (disposition, response) = run(&filter, &get("/style/app.css")).await;
        assert_eq!(disposition, Disposition::Hit);
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(response.body().as_ref(), plain.as_bytes());
    }

    #[tokio::test]
    async fn test_encoded_origin_response_served_once() {
        let origin = SelfEncoding::new(true);
        let filter = CachingFilter::with_producer(origin.clone());

        for _ in 0..2 {
            let (disposition, response) = run(&filter, &get("/style/app.css")).await;
            assert_eq!(disposition, Disposition::Uncached);
            assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
            assert_eq!(&response.body()[..2], &[0x1f, 0x8b]);
        }
        assert_eq!(origin.seen.lock().len(), 2);
        assert!(filter.cache().is_empty());
    }

    struct Failing;

    #[async_trait]
    impl OriginProducer for Failing {
        async fn produce(&self, _request: &Request<()>) -> Result<OriginResponse> {
            Err(Error::Internal("template missing".into()))
        }
    }

    #[tokio::test]
    async fn test_origin_failure_propagates_and_unlocks() {
        let filter = CachingFilter::with_producer(Arc::new(Failing));

        let mut response = Outgoing::new();
        let err = filter.handle(&get("/page"), &mut response).await.unwrap_err();
        assert_matches!(err, Error::OriginFailure { ref key, .. } if key == "GET_/page");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.is_committed());
        assert_eq!(filter.cache().pending(), 0);
    }

    /// Producer that routes back through its own filter once
    struct Looping {
        filter: Mutex<Option<Arc<CachingFilter>>>,
        nested: Mutex<Option<Disposition>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OriginProducer for Looping {
        async fn produce(&self, request: &Request<()>) -> Result<OriginResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let filter = self.filter.lock().clone();
            if let (0, Some(filter)) = (call, filter) {
                let mut inner = Outgoing::new();
                let disposition = filter.handle(request, &mut inner).await?;
                *self.nested.lock() = Some(disposition);
            }
            Ok(OriginResponse::ok("text/plain", "rendered"))
        }
    }

    #[tokio::test]
    async fn test_reentrant_invocation_bypasses_cache() {
        let producer = Arc::new(Looping {
            filter: Mutex::new(None),
            nested: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let filter = Arc::new(CachingFilter::with_producer(producer.clone()));
        *producer.filter.lock() = Some(filter.clone());

        let (outer, response) = run(&filter, &get("/page")).await;
        assert_eq!(outer, Disposition::Built);
        assert_eq!(response.body().as_ref(), b"rendered");
        assert_eq!(
            *producer.nested.lock(),
            Some(Disposition::Bypassed(BypassReason::Reentrant))
        );
        assert_eq!(filter.metrics().snapshot().reentrant, 1);
        assert!(!is_filter_active(filter.id()));

        // Break the cycle so both sides drop
        producer.filter.lock().take();
    }

    #[test]
    fn test_disabled_values() {
        for value in ["false", "FALSE", "off", "0", "no"] {
            assert!(is_disabled(value), "{}", value);
        }
        for value in ["true", "", "1", "yes"] {
            assert!(!is_disabled(value), "{}", value);
        }
    }
}
