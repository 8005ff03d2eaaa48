//! Blocking HTTP Resource Cache
//!
//! Caches full HTTP responses keyed by request identity and serializes
//! concurrent population of the same key.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         KeyedBlockingCache                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  CacheKey ──▶ Slot                                                       │
//! │               ├─ Ready(Arc<CacheEntry>)    immutable, published whole    │
//! │               └─ Pending(watch channel)    one builder, bounded waiters  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  FreshnessPolicy      resource mtime  |  TTL  |  eternal (1 year)        │
//! │  ContentNegotiator    304 / gzip / body suppression / header hygiene     │
//! │  CompressionManager   gzip variant built once at population              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

mod blocking;
mod entry;
mod metrics;
mod negotiate;
mod policy;
pub mod compression;

pub use blocking::{
    KeyedBlockingCache, Lookup, LookupSource, Population, DEFAULT_POPULATION_TIMEOUT,
};
pub use compression::{
    is_compressible, CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor,
};
pub use entry::{
    normalize_path, truncate_to_second, CacheEntry, CacheKey, KeyStrategy, GZIP_ETAG_SUFFIX,
};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use negotiate::{
    accepts_gzip, http_date, ContentNegotiator, Negotiation, COMPUTED_HEADERS, CONFLICTING_HEADERS,
    DEFAULT_CACHE_CONTROL, TTL_PLACEHOLDER,
};
pub use policy::{FreshnessMode, FreshnessPolicy, ETERNAL_HORIZON};
