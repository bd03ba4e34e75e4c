//! # Bucket Resolver
//!
//! Implements the precedence chain that turns a `(bucket_type, key,
//! call_override)` triple into the [`EffectiveBucket`] parameters actually
//! used for a `take`/`put`/`get` call:
//!
//! 1. an explicit per-call override, if present, always wins and is never
//!    cached (it's specific to this one call);
//! 2. an exact-name override whose `until` hasn't passed;
//! 3. a cached regex-match result for this key;
//! 4. the first live regex override, in configuration order, whose pattern
//!    matches the key - cached for subsequent calls;
//! 5. the bucket type's own defaults.

use chrono::Utc;

use crate::bucket_config::{BucketType, EffectiveBucket};

pub fn resolve(bucket_type: &BucketType, key: &str, call_override: Option<EffectiveBucket>) -> EffectiveBucket {
    if let Some(eff) = call_override {
        return eff;
    }

    let now = Utc::now();

    if let Some(o) = bucket_type.overrides.get(key) {
        if o.is_live(now) {
            return o.bucket;
        }
    }

    if let Some(cached) = bucket_type.cached_override(key) {
        return cached;
    }

    for (re, o) in &bucket_type.overrides_match {
        if o.is_live(now) && re.is_match(key) {
            bucket_type.cache_override(key, o.bucket);
            return o.bucket;
        }
    }

    bucket_type.default
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_config::{normalize_bucket, RawBucketConfig, RawOverrideConfig};
    use std::collections::HashMap;

    fn raw_override(size: u64, pattern: Option<&str>) -> RawOverrideConfig {
        RawOverrideConfig {
            size: Some(size),
            per_interval: None,
            interval: None,
            per_second: Some(1),
            per_minute: None,
            per_hour: None,
            per_day: None,
            unlimited: false,
            ttl: None,
            until: None,
            match_pattern: pattern.map(String::from),
        }
    }

    #[test]
    fn call_override_wins_over_everything() {
        let raw = RawBucketConfig { size: Some(10), per_second: Some(1), ..Default::default() };
        let bt = normalize_bucket(&raw, 3600).unwrap();
        let call_eff = EffectiveBucket { size: 999, per_interval: 1, interval_ms: 1000, unlimited: false, ttl_secs: 10 };
        let resolved = resolve(&bt, "anything", Some(call_eff));
        assert_eq!(resolved.size, 999);
    }

    #[test]
    fn exact_name_override_beats_regex_override() {
        let mut overrides = HashMap::new();
        overrides.insert("alice".to_string(), raw_override(50, None));
        overrides.insert("vip-*".to_string(), raw_override(100, Some("^vip-")));
        let raw = RawBucketConfig { size: Some(10), per_second: Some(1), overrides, ..Default::default() };
        let bt = normalize_bucket(&raw, 3600).unwrap();

        assert_eq!(resolve(&bt, "alice", None).size, 50);
    }

    #[test]
    fn first_matching_regex_in_insertion_order_wins() {
        let mut overrides = HashMap::new();
        overrides.insert("first".to_string(), raw_override(11, Some("^vip-")));
        overrides.insert("second".to_string(), raw_override(22, Some("^vip-")));
        let raw = RawBucketConfig { size: Some(10), per_second: Some(1), overrides, ..Default::default() };
        let bt = normalize_bucket(&raw, 3600).unwrap();

        assert_eq!(resolve(&bt, "vip-789", None).size, 11);
    }

    #[test]
    fn unmatched_key_falls_back_to_default() {
        let raw = RawBucketConfig { size: Some(10), per_second: Some(1), ..Default::default() };
        let bt = normalize_bucket(&raw, 3600).unwrap();
        assert_eq!(resolve(&bt, "nobody", None).size, 10);
    }

    #[test]
    fn regex_match_is_cached_after_first_resolve() {
        let mut overrides = HashMap::new();
        overrides.insert("vip-*".to_string(), raw_override(100, Some("^vip-")));
        let raw = RawBucketConfig { size: Some(10), per_second: Some(1), overrides, ..Default::default() };
        let bt = normalize_bucket(&raw, 3600).unwrap();

        assert!(bt.cached_override("vip-123").is_none());
        let first = resolve(&bt, "vip-123", None);
        assert_eq!(bt.cached_override("vip-123"), Some(first));
    }
}
