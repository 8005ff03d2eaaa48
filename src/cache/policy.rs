//! Freshness Policies
//!
//! Decide whether a cached entry may still be served or must be rebuilt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::entry::CacheEntry;

/// Horizon used by the eternal policy (one year)
pub const ETERNAL_HORIZON: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What freshness is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessMode {
    /// Modification time of the resource backing the request
    #[default]
    Resource,
    /// Fixed time-to-live from population
    Ttl,
}

impl std::fmt::Display for FreshnessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreshnessMode::Resource => write!(f, "resource"),
            FreshnessMode::Ttl => write!(f, "ttl"),
        }
    }
}

/// Freshness policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FreshnessPolicy {
    /// Name of the policy
    pub name: String,
    /// What freshness is measured against
    pub mode: FreshnessMode,
    /// Lifetime advertised to clients; under TTL mode also enforced
    pub ttl: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::external_resource(Duration::from_secs(60))
    }
}

impl FreshnessPolicy {
    /// External-resource policy
    ///
    /// Entries stay fresh until the backing resource changes. `max_age` is only
    /// what clients are told.
    pub fn external_resource(max_age: Duration) -> Self {
        Self {
            name: "External-Resource".to_string(),
            mode: FreshnessMode::Resource,
            ttl: max_age.min(ETERNAL_HORIZON),
        }
    }

    /// TTL policy
    ///
    /// Entries are rebuilt once `ttl` has elapsed since population. Lifetimes
    /// beyond [`ETERNAL_HORIZON`] are capped to it.
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            name: "TTL".to_string(),
            mode: FreshnessMode::Ttl,
            ttl: ttl.min(ETERNAL_HORIZON),
        }
    }

    /// Eternal policy
    ///
    /// A TTL policy with a one-year horizon, so clock anomalies cannot pin an
    /// entry forever.
    pub fn eternal() -> Self {
        Self {
            name: "Eternal".to_string(),
            mode: FreshnessMode::Ttl,
            ttl: ETERNAL_HORIZON,
        }
    }

    /// Expiry to stamp on an entry populated at `now` (TTL mode only)
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.mode {
            FreshnessMode::Resource => None,
            FreshnessMode::Ttl => Some(offset(now, self.ttl)),
        }
    }

    /// Check whether `entry` may still be served.
    ///
    /// `resource_modified` is the backing resource's current modification time,
    /// or `None` when it could not be resolved. Under the external-resource
    /// policy an unresolvable resource counts as fresh: the lookup is
    /// inconclusive and a rebuild would not be able to do better. This can
    /// hide genuine staleness.
    pub fn is_fresh(
        &self,
        entry: &CacheEntry,
        resource_modified: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.mode {
            FreshnessMode::Resource => match resource_modified {
                // HTTP dates have one-second resolution
                Some(modified) => modified.timestamp() <= entry.last_modified().timestamp(),
                None => {
                    tracing::debug!(
                        etag = entry.etag(),
                        "Backing resource unresolvable, treating entry as fresh"
                    );
                    true
                }
            },
            FreshnessMode::Ttl => match entry.expires_at() {
                Some(expires_at) => now < expires_at,
                None => false,
            },
        }
    }

    /// Freshness left at `now`, used for `max-age` and `Expires` at write time.
    ///
    /// Rounded up to whole seconds and never negative.
    pub fn remaining(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Duration {
        match (self.mode, entry.expires_at()) {
            (FreshnessMode::Ttl, Some(expires_at)) => {
                let left = expires_at - now;
                if left <= chrono::Duration::zero() {
                    return Duration::ZERO;
                }
                let millis = left.num_milliseconds() as u64;
                Duration::from_secs(millis.div_ceil(1000))
            }
            _ => self.ttl,
        }
    }
}

/// `now + d`, saturating at the latest representable instant
pub(crate) fn offset(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// =============================================================================
// Tests
// =============================================================================
