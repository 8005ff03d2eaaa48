//! Cache configuration
//!
//! Everything a deployment tunes: cache name, population timeout, freshness
//! policy, eligibility threshold and the cache-control template. Loaded from
//! YAML; every field has a default so an empty document is valid.
//!
//! ```yaml
//! name: static-resources
//! population_timeout: 10
//! freshness: ttl
//! ttl: 300
//! cache_control: "public, max-age=%TTL"
//! compression:
//!   min_size: 512
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{
    CompressionConfig, FreshnessMode, FreshnessPolicy, KeyStrategy, DEFAULT_CACHE_CONTROL,
    ETERNAL_HORIZON, TTL_PLACEHOLDER,
};
use crate::error::{Error, Result};
use crate::origin::DEFAULT_MAX_RESOURCE_SIZE;

/// Configuration of one cache and the filter in front of it
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache name, used in logs and metrics
    pub name: String,

    /// Seconds a caller waits for another caller's population
    #[serde(rename = "population_timeout")]
    pub population_timeout_secs: u64,

    /// What freshness is measured against
    pub freshness: FreshnessMode,

    /// Seconds of freshness advertised (and enforced under `ttl`)
    #[serde(rename = "ttl")]
    pub ttl_secs: u64,

    /// Cache for a one-year horizon instead of `ttl`
    pub eternal: bool,

    /// Largest resource eligible for caching, in bytes
    pub max_resource_size: u64,

    /// Cache-Control template; `%TTL` becomes the remaining seconds
    pub cache_control: String,

    /// Which parts of the URI form the key
    pub key_strategy: KeyStrategy,

    /// Query parameter that disables caching when set to a false value.
    /// Empty disables the check.
    pub bypass_parameter: String,

    /// Gzip settings
    pub compression: CompressionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "resource-cache".to_string(),
            population_timeout_secs: 10,
            freshness: FreshnessMode::Resource,
            ttl_secs: 60,
            eternal: false,
            max_resource_size: DEFAULT_MAX_RESOURCE_SIZE,
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
            key_strategy: KeyStrategy::Path,
            bypass_parameter: "cache".to_string(),
            compression: CompressionConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("name must not be empty".into()));
        }
        if self.population_timeout_secs == 0 {
            return Err(Error::Config("population_timeout must be > 0".into()));
        }
        if self.compression.level > 9 {
            return Err(Error::Config("compression.level must be <= 9".into()));
        }
        let ttl_driven = self.freshness == FreshnessMode::Ttl || self.eternal;
        if ttl_driven && self.ttl_secs == 0 && !self.eternal {
            return Err(Error::Config("ttl must be > 0 under the ttl policy".into()));
        }
        if self.ttl_secs > ETERNAL_HORIZON.as_secs() {
            return Err(Error::Config(format!(
                "ttl must be <= {} (one year)",
                ETERNAL_HORIZON.as_secs()
            )));
        }
        if ttl_driven
            && !self.cache_control.contains(TTL_PLACEHOLDER)
            && !self.cache_control.contains("max-age")
        {
            return Err(Error::Config(format!(
                "cache_control \"{}\" has neither max-age nor {}",
                self.cache_control, TTL_PLACEHOLDER
            )));
        }
        Ok(())
    }

    /// Population wait bound
    pub fn population_timeout(&self) -> Duration {
        Duration::from_secs(self.population_timeout_secs)
    }

    /// Freshness lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// The freshness policy this configuration selects
    pub fn freshness_policy(&self) -> FreshnessPolicy {
        if self.eternal {
            return FreshnessPolicy::eternal();
        }
        match self.freshness {
            FreshnessMode::Resource => FreshnessPolicy::external_resource(self.ttl()),
            FreshnessMode::Ttl => FreshnessPolicy::ttl(self.ttl()),
        }
    }

    /// Bypass parameter, if one is configured
    pub fn bypass_parameter(&self) -> Option<&str> {
        let param = self.bypass_parameter.trim();
        (!param.is_empty()).then_some(param)
    }
}
