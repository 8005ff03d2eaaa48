//! Resource Cache - blocking HTTP response cache
//!
//! Caches full HTTP responses keyed by request identity, collapses concurrent
//! misses on the same key into one origin call, revalidates entries against
//! the backing resource or a TTL, and negotiates conditional GET and gzip on
//! every hit.
//!
//! # Architecture
//!
//! ```text
//! request ──▶ CachingFilter ──▶ KeyedBlockingCache ──▶ OriginProducer
//!                  │                   │
//!                  │            FreshnessPolicy ◀── FreshnessOracle
//!                  ▼
//!           ContentNegotiator ──▶ Outgoing response
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Entries, keys, the single-flight cache, freshness and negotiation
//! - [`clock`] - Wall-clock source used for freshness and `Expires`
//! - [`config`] - Deployment configuration
//! - [`error`] - Error types
//! - [`filter`] - The request pipeline and reentrancy guard
//! - [`origin`] - Ports for the origin, freshness oracle and eligibility predicate

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod origin;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheKey, ContentNegotiator, FreshnessPolicy, KeyedBlockingCache, MetricsSnapshot,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use filter::{BypassReason, CachingFilter, Disposition, Outgoing};
pub use origin::{FileOrigin, OriginProducer, OriginResponse};
