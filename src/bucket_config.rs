//! # Bucket Configuration Normalization
//!
//! Turns the raw, user-authored bucket configuration tree (deserialized
//! from file or environment via [`crate::config::Config`]) into the
//! normalized [`BucketType`] values the [`crate::engine::Engine`] and
//! [`crate::resolver`] operate on.
//!
//! Shortcuts (`per_second`, `per_minute`, `per_hour`, `per_day`) are
//! resolved into an explicit `(interval_ms, per_interval)` pair, a missing
//! `size` defaults to `per_interval`, and a missing `ttl` is derived from
//! how long a full bucket takes to drain. Malformed input - a bad regex,
//! a `size` of zero, an `until` that doesn't parse - is a loud
//! `ThrottlerError::Config` raised once at load time, never a runtime
//! take/put error.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use regex::RegexBuilder;
use serde::Deserialize;

use crate::error::ThrottlerError;

/// Default cap on how long a key may live in the store before `EXPIRE`
/// reclaims it, used when neither an explicit `ttl` nor a computable
/// drain time is available.
pub const DEFAULT_GLOBAL_TTL_SECS: u64 = 7 * 24 * 3600;

/// Capacity of each bucket type's regex-override LRU cache.
const OVERRIDE_CACHE_CAPACITY: usize = 50;

/// The fully resolved parameters of a single bucket instance: either the
/// type's own defaults or the effective values after an override has been
/// applied. Cheap to copy; resolution never allocates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveBucket {
    pub size: u64,
    pub per_interval: u64,
    pub interval_ms: u64,
    pub unlimited: bool,
    pub ttl_secs: u64,
}

impl EffectiveBucket {
    /// Milliseconds required to drip one token, `0.0` for a fixed bucket
    /// (no refill) or an unlimited bucket.
    pub fn drip_interval_ms(&self) -> f64 {
        if self.unlimited || self.per_interval == 0 {
            0.0
        } else {
            self.interval_ms as f64 / self.per_interval as f64
        }
    }
}

/// A normalized override: the effective parameters to use in place of the
/// type's defaults, plus an optional absolute expiry.
#[derive(Debug, Clone, Copy)]
pub struct BucketOverride {
    pub bucket: EffectiveBucket,
    pub until: Option<DateTime<Utc>>,
}

impl BucketOverride {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.until.map_or(true, |until| until >= now)
    }
}

/// A fully normalized bucket type: defaults plus its exact-name and
/// regex-matched overrides. Constructed once at startup and shared behind
/// an `Arc` - the override cache is the only interior mutability here.
pub struct BucketType {
    pub default: EffectiveBucket,
    pub overrides: HashMap<String, BucketOverride>,
    /// Regex overrides, insertion order preserved so the first listed
    /// match always wins ties.
    pub overrides_match: Vec<(regex::Regex, BucketOverride)>,
    overrides_cache: Mutex<LruCache<String, EffectiveBucket>>,
    pub skip_n_calls: u32,
}

impl std::fmt::Debug for BucketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketType")
            .field("default", &self.default)
            .field("overrides", &self.overrides.len())
            .field("overrides_match", &self.overrides_match.len())
            .field("skip_n_calls", &self.skip_n_calls)
            .finish()
    }
}

impl BucketType {
    pub fn cached_override(&self, key: &str) -> Option<EffectiveBucket> {
        let mut cache = self.overrides_cache.lock().expect("override cache mutex poisoned");
        cache.get(key).copied()
    }

    pub fn cache_override(&self, key: &str, bucket: EffectiveBucket) {
        let mut cache = self.overrides_cache.lock().expect("override cache mutex poisoned");
        cache.put(key.to_string(), bucket);
    }
}

/// Raw, user-authored bucket type as it appears in configuration files or
/// `config_override` request bodies. Every field is optional; normalization
/// fills in the rest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBucketConfig {
    pub size: Option<u64>,
    pub per_interval: Option<u64>,
    pub interval: Option<u64>,
    pub per_second: Option<u64>,
    pub per_minute: Option<u64>,
    pub per_hour: Option<u64>,
    pub per_day: Option<u64>,
    #[serde(default)]
    pub unlimited: bool,
    pub ttl: Option<u64>,
    #[serde(default)]
    pub skip_n_calls: u32,
    #[serde(default)]
    pub overrides: HashMap<String, RawOverrideConfig>,
}

/// Raw override entry: the same shape as [`RawBucketConfig`] minus nested
/// overrides, plus `until` and an optional `match` regex. An entry with a
/// `match` field is a regex override; otherwise its map key is the exact
/// name it applies to.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOverrideConfig {
    pub size: Option<u64>,
    pub per_interval: Option<u64>,
    pub interval: Option<u64>,
    pub per_second: Option<u64>,
    pub per_minute: Option<u64>,
    pub per_hour: Option<u64>,
    pub per_day: Option<u64>,
    #[serde(default)]
    pub unlimited: bool,
    pub ttl: Option<u64>,
    pub until: Option<String>,
    #[serde(rename = "match")]
    pub match_pattern: Option<String>,
}

fn shortcut_interval(raw_interval: Option<u64>, raw_per_interval: Option<u64>, per_second: Option<u64>, per_minute: Option<u64>, per_hour: Option<u64>, per_day: Option<u64>) -> (u64, u64) {
    if let Some(n) = per_second {
        (1_000, n)
    } else if let Some(n) = per_minute {
        (60_000, n)
    } else if let Some(n) = per_hour {
        (3_600_000, n)
    } else if let Some(n) = per_day {
        (86_400_000, n)
    } else {
        (raw_interval.unwrap_or(0), raw_per_interval.unwrap_or(0))
    }
}

#[allow(clippy::too_many_arguments)]
fn normalize_effective(
    size: Option<u64>,
    per_interval: Option<u64>,
    interval: Option<u64>,
    per_second: Option<u64>,
    per_minute: Option<u64>,
    per_hour: Option<u64>,
    per_day: Option<u64>,
    unlimited: bool,
    ttl_override: Option<u64>,
    global_ttl_cap: u64,
) -> Result<EffectiveBucket, ThrottlerError> {
    let (interval_ms, per_interval) = shortcut_interval(interval, per_interval, per_second, per_minute, per_hour, per_day);

    if !unlimited && interval_ms > 0 && per_interval == 0 {
        return Err(ThrottlerError::Config(
            "bucket declares an interval but no per_interval refill amount".into(),
        ));
    }

    let size = size.unwrap_or(per_interval);
    if size == 0 && !unlimited {
        return Err(ThrottlerError::Config("bucket size must be at least 1".into()));
    }

    let ttl_secs = if let Some(t) = ttl_override {
        t.min(global_ttl_cap).max(1)
    } else if per_interval > 0 && interval_ms > 0 {
        ((size.saturating_mul(interval_ms)) / per_interval / 1000)
            .max(1)
            .min(global_ttl_cap)
    } else {
        global_ttl_cap
    };

    Ok(EffectiveBucket { size, per_interval, interval_ms, unlimited, ttl_secs })
}

pub fn normalize_override(raw: &RawOverrideConfig, global_ttl_cap: u64) -> Result<BucketOverride, ThrottlerError> {
    let bucket = normalize_effective(
        raw.size, raw.per_interval, raw.interval, raw.per_second, raw.per_minute, raw.per_hour, raw.per_day,
        raw.unlimited, raw.ttl, global_ttl_cap,
    )?;

    let until = match &raw.until {
        Some(s) => Some(
            DateTime::parse_from_rfc3339(s)
                .map_err(|e| ThrottlerError::Config(format!("invalid 'until' timestamp {s:?}: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    Ok(BucketOverride { bucket, until })
}

/// Builds a [`BucketType`] from its raw configuration. Expired overrides
/// (`until` already in the past) are dropped here rather than carried
/// forward, matching the documented "behaves as absent" semantics without
/// paying a clock read per resolve for dead entries.
pub fn normalize_bucket(raw: &RawBucketConfig, global_ttl_cap: u64) -> Result<BucketType, ThrottlerError> {
    let default = normalize_effective(
        raw.size, raw.per_interval, raw.interval, raw.per_second, raw.per_minute, raw.per_hour, raw.per_day,
        raw.unlimited, raw.ttl, global_ttl_cap,
    )?;

    let now = Utc::now();
    let mut overrides = HashMap::new();
    let mut overrides_match = Vec::new();

    for (name, raw_override) in &raw.overrides {
        let bucket_override = normalize_override(raw_override, global_ttl_cap)?;
        if !bucket_override.is_live(now) {
            continue;
        }

        match &raw_override.match_pattern {
            Some(pattern) => {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ThrottlerError::Config(format!("invalid override regex {pattern:?}: {e}")))?;
                overrides_match.push((re, bucket_override));
            }
            None => {
                overrides.insert(name.clone(), bucket_override);
            }
        }
    }

    Ok(BucketType {
        default,
        overrides,
        overrides_match,
        overrides_cache: Mutex::new(LruCache::new(
            NonZeroUsize::new(OVERRIDE_CACHE_CAPACITY).expect("cache capacity is nonzero"),
        )),
        skip_n_calls: raw.skip_n_calls,
    })
}

/// Normalizes an entire bucket type registry, failing loudly on the first
/// malformed entry rather than silently falling back to a default - bucket
/// definitions govern admission control and a silent fallback there would
/// be worse than refusing to start.
pub fn normalize_registry(
    raw: &HashMap<String, RawBucketConfig>,
    global_ttl_cap: u64,
) -> Result<HashMap<String, BucketType>, ThrottlerError> {
    raw.iter()
        .map(|(name, cfg)| normalize_bucket(cfg, global_ttl_cap).map(|bt| (name.clone(), bt)))
        .collect()
}
