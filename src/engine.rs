//! # Rate-Limiter Engine
//!
//! The public `take`/`wait`/`put`/`get`/`reset_all` surface, sitting on top
//! of bucket resolution ([`crate::resolver`]) and the store
//! ([`crate::store::Store`]). This is the unwrapped core: no retry, no
//! timeout, no circuit breaker - those live in [`crate::resilience`], which
//! wraps an `Engine` to become the crate's top-level `RateLimiter`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;

use crate::bucket_config::{self, BucketType, EffectiveBucket, RawOverrideConfig};
use crate::error::{validation_code, ThrottlerError};
use crate::store::SharedStore;

/// How many tokens a call affects. Deserializes from either an absent
/// field (one token), a plain non-negative integer, or the literal string
/// `"all"` - invalid shapes (fractions, negative numbers, arbitrary
/// strings, booleans) are rejected by `serde` itself before engine logic
/// ever runs, which is this crate's native equivalent of validating a
/// dynamically-typed `count` field.
#[derive(Debug, Clone, Copy, Default)]
pub enum Count {
    #[default]
    One,
    N(u64),
    All,
}

impl Count {
    pub fn resolve(self, size: u64) -> u64 {
        match self {
            Count::One => 1,
            Count::N(n) => n,
            Count::All => size,
        }
    }
}

impl<'de> Deserialize<'de> for Count {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Count::N(n)),
            Raw::Text(s) if s == "all" => Ok(Count::All),
            Raw::Text(s) => Err(serde::de::Error::custom(format!("count must be a non-negative integer or \"all\", got {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TakeOptions {
    pub count: Option<Count>,
    pub config_override: Option<RawOverrideConfig>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TakeResult {
    pub conformant: bool,
    pub remaining: i64,
    pub reset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PutResult {
    pub remaining: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GetResult {
    pub remaining: i64,
    pub limit: u64,
    pub reset: u64,
}

/// Opportunistic local admission cache, consulted only for bucket types
/// configured with `skip_n_calls > 0` (the default is `0`, i.e. off). Once
/// a `take` against the store confirms `count` tokens under `n` remaining,
/// up to `n` subsequent calls for the same key are admitted locally
/// without a store round trip, trading a small amount of over-admission
/// accuracy for latency.
#[derive(Debug, Clone, Copy)]
struct SkipCacheEntry {
    calls_remaining: u32,
    last_result: TakeResult,
}

pub struct Engine {
    store: SharedStore,
    buckets: Arc<HashMap<String, BucketType>>,
    prefix: String,
    skip_cache: Mutex<HashMap<String, SkipCacheEntry>>,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// `ceil((now_ms + (size - remaining) * drip_interval) / 1000)` for a
/// refilling bucket, `0` for a fixed one - the same formula the `take`
/// script computes server-side, recomputed locally since `get` never
/// writes and the script returns no reset timestamp of its own.
fn reset_secs(effective: &EffectiveBucket, remaining: i64, now_ms: u64) -> u64 {
    if effective.per_interval == 0 || effective.interval_ms == 0 {
        return 0;
    }
    let deficit = (effective.size as i64 - remaining).max(0) as f64;
    let reset_ms = now_ms as f64 + deficit * effective.drip_interval_ms();
    (reset_ms / 1000.0).ceil() as u64
}

impl Engine {
    pub fn new(store: SharedStore, buckets: Arc<HashMap<String, BucketType>>, prefix: impl Into<String>) -> Self {
        Self { store, buckets, prefix: prefix.into(), skip_cache: Mutex::new(HashMap::new()) }
    }

    fn bucket_type(&self, bucket_type: &str) -> Result<&BucketType, ThrottlerError> {
        if bucket_type.is_empty() {
            return Err(ThrottlerError::validation(validation_code::MISSING_TYPE, "bucket type must not be empty"));
        }
        self.buckets
            .get(bucket_type)
            .ok_or_else(|| ThrottlerError::validation(validation_code::UNKNOWN_TYPE, format!("unknown bucket type {bucket_type:?}")))
    }

    fn full_key(&self, bucket_type: &str, key: &str) -> String {
        format!("{}{}:{}", self.prefix, bucket_type, key)
    }

    fn validate_key(&self, key: &str) -> Result<(), ThrottlerError> {
        if key.is_empty() {
            return Err(ThrottlerError::validation(validation_code::MISSING_KEY, "key must not be empty"));
        }
        Ok(())
    }

    fn resolve(&self, bt: &BucketType, key: &str, opts: &TakeOptions) -> Result<EffectiveBucket, ThrottlerError> {
        let call_override = opts
            .config_override
            .as_ref()
            .map(|raw| bucket_config::normalize_override(raw, bucket_config::DEFAULT_GLOBAL_TTL_SECS))
            .transpose()
            .map_err(|_| ThrottlerError::validation(validation_code::BAD_CONFIG_OVERRIDE, "invalid config_override"))?
            .map(|o| o.bucket);
        Ok(crate::resolver::resolve(bt, key, call_override))
    }

    pub async fn take(&self, bucket_type: &str, key: &str, opts: TakeOptions) -> Result<TakeResult, ThrottlerError> {
        self.validate_key(key)?;
        let bt = self.bucket_type(bucket_type)?;
        let effective = self.resolve(bt, key, &opts)?;

        if effective.unlimited {
            return Ok(TakeResult { conformant: true, remaining: effective.size as i64, reset: now_secs(), limit: effective.size });
        }

        let tokens = opts.count.unwrap_or_default().resolve(effective.size);
        let cache_key = format!("{bucket_type}:{key}");

        if bt.skip_n_calls > 0 {
            let mut cache = self.skip_cache.lock().await;
            if let Some(entry) = cache.get_mut(&cache_key) {
                if entry.calls_remaining > 0 && entry.last_result.conformant {
                    entry.calls_remaining -= 1;
                    return Ok(entry.last_result);
                }
            }
        }

        let full_key = self.full_key(bucket_type, key);
        let outcome = self.store.take(&full_key, &effective, tokens).await?;
        let result = TakeResult { conformant: outcome.conformant, remaining: outcome.remaining, reset: outcome.reset_ms.div_ceil(1000), limit: effective.size };

        if bt.skip_n_calls > 0 {
            let mut cache = self.skip_cache.lock().await;
            cache.insert(cache_key, SkipCacheEntry { calls_remaining: bt.skip_n_calls, last_result: result });
        }

        Ok(result)
    }

    /// Blocks, retrying `take` until it conforms or a non-retriable error
    /// occurs. Has no built-in timeout - a caller that wants one composes
    /// it externally with `tokio::time::timeout`.
    pub fn wait<'a>(
        &'a self,
        bucket_type: &'a str,
        key: &'a str,
        opts: TakeOptions,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<TakeResult, ThrottlerError>> + Send + 'a>> {
        Box::pin(async move {
            let result = self.take(bucket_type, key, opts.clone()).await?;
            if result.conformant {
                return Ok(result);
            }

            let bt = self.bucket_type(bucket_type)?;
            let effective = self.resolve(bt, key, &opts)?;
            let tokens = opts.count.clone().unwrap_or_default().resolve(effective.size) as i64;
            let deficit = (tokens - result.remaining).max(1) as f64;
            let min_wait_ms = (deficit * effective.drip_interval_ms()).max(1.0) as u64;

            tokio::time::sleep(std::time::Duration::from_millis(min_wait_ms)).await;
            self.wait(bucket_type, key, opts).await
        })
    }

    pub async fn put(&self, bucket_type: &str, key: &str, count: i64) -> Result<PutResult, ThrottlerError> {
        self.validate_key(key)?;
        let bt = self.bucket_type(bucket_type)?;
        let effective = crate::resolver::resolve(bt, key, None);

        if effective.unlimited {
            return Ok(PutResult { remaining: effective.size as i64 });
        }

        let full_key = self.full_key(bucket_type, key);
        let outcome = self.store.put(&full_key, &effective, count).await?;
        Ok(PutResult { remaining: outcome.remaining })
    }

    pub async fn get(&self, bucket_type: &str, key: &str) -> Result<GetResult, ThrottlerError> {
        self.validate_key(key)?;
        let bt = self.bucket_type(bucket_type)?;
        let effective = crate::resolver::resolve(bt, key, None);

        if effective.unlimited {
            return Ok(GetResult { remaining: effective.size as i64, limit: effective.size, reset: now_secs() });
        }

        let full_key = self.full_key(bucket_type, key);
        let outcome = self.store.get(&full_key, &effective).await?;
        let reset = reset_secs(&effective, outcome.remaining, outcome.now_ms);
        Ok(GetResult { remaining: outcome.remaining, limit: effective.size, reset })
    }

    pub async fn reset_all(&self) -> Result<(), ThrottlerError> {
        self.skip_cache.lock().await.clear();
        self.store.flush_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_config::RawBucketConfig;
    use crate::scripts::{GetOutcome, PutOutcome, TakeOutcome};
    use crate::store::{DriverEvent, Store};
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::{broadcast, Mutex as TMutex};

    /// In-memory reimplementation of the three scripts' pure arithmetic,
    /// with a controllable clock, so invariant tests don't need a live
    /// Redis instance.
    struct MockStore {
        clock_ms: AtomicI64,
        data: TMutex<Map<String, (i64, i64)>>, // full_key -> (last_drip_ms, remaining)
    }

    impl MockStore {
        fn new() -> Self {
            Self { clock_ms: AtomicI64::new(0), data: TMutex::new(Map::new()) }
        }

        fn advance(&self, ms: i64) {
            self.clock_ms.fetch_add(ms, Ordering::SeqCst);
        }

        fn now(&self) -> i64 {
            self.clock_ms.load(Ordering::SeqCst)
        }

        fn drip(&self, last_drip: i64, remaining: i64, eff: &EffectiveBucket, now: i64) -> (i64, i64) {
            if eff.per_interval == 0 || eff.interval_ms == 0 {
                return (last_drip, remaining);
            }
            let elapsed = now - last_drip;
            if elapsed <= 0 {
                return (last_drip, remaining);
            }
            let drip_ms = eff.interval_ms as f64 / eff.per_interval as f64;
            let dripped = (elapsed as f64 / drip_ms).floor() as i64;
            if dripped <= 0 {
                return (last_drip, remaining);
            }
            let new_remaining = (remaining + dripped).min(eff.size as i64);
            let new_drip = last_drip + (dripped as f64 * drip_ms) as i64;
            (new_drip, new_remaining)
        }
    }

    #[async_trait]
    impl Store for MockStore {
        async fn take(&self, full_key: &str, eff: &EffectiveBucket, tokens: u64) -> Result<TakeOutcome, ThrottlerError> {
            let now = self.now();
            let mut data = self.data.lock().await;
            let (last_drip, remaining) = data.get(full_key).copied().unwrap_or((now, eff.size as i64));
            let (last_drip, remaining) = self.drip(last_drip, remaining, eff, now);

            let conformant = remaining >= tokens as i64;
            let new_remaining = if conformant { remaining - tokens as i64 } else { remaining };

            if new_remaining >= eff.size as i64 {
                data.remove(full_key);
            } else {
                data.insert(full_key.to_string(), (last_drip, new_remaining));
            }

            let reset_ms = if eff.per_interval > 0 && eff.interval_ms > 0 && new_remaining < eff.size as i64 {
                let drip_ms = eff.interval_ms as f64 / eff.per_interval as f64;
                let deficit = (eff.size as i64 - new_remaining) as f64;
                now + (deficit * drip_ms).ceil() as i64
            } else {
                now
            };

            Ok(TakeOutcome { remaining: new_remaining, conformant, now_ms: now as u64, reset_ms: reset_ms as u64 })
        }

        async fn put(&self, full_key: &str, eff: &EffectiveBucket, tokens: i64) -> Result<PutOutcome, ThrottlerError> {
            let now = self.now();
            let mut data = self.data.lock().await;
            let (last_drip, remaining) = data.get(full_key).copied().unwrap_or((now, eff.size as i64));
            let (last_drip, remaining) = self.drip(last_drip, remaining, eff, now);
            let new_remaining = remaining + tokens;

            if new_remaining >= eff.size as i64 {
                data.remove(full_key);
            } else {
                data.insert(full_key.to_string(), (last_drip, new_remaining));
            }

            Ok(PutOutcome { remaining: new_remaining, now_ms: now as u64 })
        }

        async fn get(&self, full_key: &str, eff: &EffectiveBucket) -> Result<GetOutcome, ThrottlerError> {
            let now = self.now();
            let data = self.data.lock().await;
            let (last_drip, remaining) = data.get(full_key).copied().unwrap_or((now, eff.size as i64));
            let (_, remaining) = self.drip(last_drip, remaining, eff, now);
            Ok(GetOutcome { remaining, now_ms: now as u64 })
        }

        async fn flush_all(&self) -> Result<(), ThrottlerError> {
            self.data.lock().await.clear();
            Ok(())
        }

        async fn scan(&self, _pattern: &str) -> Result<Vec<String>, ThrottlerError> {
            Ok(self.data.lock().await.keys().cloned().collect())
        }

        async fn ping(&self) -> Result<(), ThrottlerError> {
            Ok(())
        }

        async fn reconnect(&self) -> Result<(), ThrottlerError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ThrottlerError> {
            Ok(())
        }

        fn is_clustered(&self) -> bool {
            false
        }

        fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
            broadcast::channel(1).1
        }
    }

    fn engine_with(buckets: Map<String, RawBucketConfig>) -> (Engine, Arc<MockStore>) {
        let normalized = bucket_config::normalize_registry(&buckets, bucket_config::DEFAULT_GLOBAL_TTL_SECS).unwrap();
        let store = Arc::new(MockStore::new());
        let engine = Engine::new(store.clone(), Arc::new(normalized), "test:");
        (engine, store)
    }

    fn basic_bucket() -> Map<String, RawBucketConfig> {
        let mut buckets = Map::new();
        buckets.insert("api".to_string(), RawBucketConfig { size: Some(10), per_second: Some(1), ..Default::default() });
        buckets
    }

    #[tokio::test]
    async fn scenario_1_basic_take() {
        let (engine, _store) = engine_with(basic_bucket());
        let result = engine.take("api", "alice", TakeOptions::default()).await.unwrap();
        assert!(result.conformant);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.limit, 10);
    }

    #[tokio::test]
    async fn scenario_2_denies_when_exhausted() {
        let (engine, _store) = engine_with(basic_bucket());
        for _ in 0..10 {
            engine.take("api", "bob", TakeOptions::default()).await.unwrap();
        }
        let result = engine.take("api", "bob", TakeOptions::default()).await.unwrap();
        assert!(!result.conformant);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn scenario_3_drip_refills_over_time() {
        let (engine, store) = engine_with(basic_bucket());
        for _ in 0..10 {
            engine.take("api", "carol", TakeOptions::default()).await.unwrap();
        }
        store.advance(3_000);
        let result = engine.take("api", "carol", TakeOptions::default()).await.unwrap();
        assert!(result.conformant);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn scenario_4_full_is_absent() {
        let (engine, store) = engine_with(basic_bucket());
        engine.take("api", "dave", TakeOptions::default()).await.unwrap();
        engine.put("api", "dave", 1).await.unwrap();
        assert!(store.data.lock().await.get("test:api:dave").is_none());
    }

    #[tokio::test]
    async fn scenario_5_unknown_bucket_type_is_validation_error() {
        let (engine, _store) = engine_with(basic_bucket());
        let err = engine.take("nope", "erin", TakeOptions::default()).await.unwrap_err();
        assert!(matches!(err, ThrottlerError::Validation { code, .. } if code == validation_code::UNKNOWN_TYPE));
    }

    #[tokio::test]
    async fn scenario_6_negative_put() {
        let (engine, _store) = engine_with(basic_bucket());
        let result = engine.put("api", "frank", -3).await.unwrap();
        assert_eq!(result.remaining, 7);
    }

    #[tokio::test]
    async fn unlimited_bucket_never_touches_store() {
        let mut buckets = Map::new();
        buckets.insert("unthrottled".to_string(), RawBucketConfig { unlimited: true, ..Default::default() });
        let (engine, store) = engine_with(buckets);
        let result = engine.take("unthrottled", "anyone", TakeOptions::default()).await.unwrap();
        assert!(result.conformant);
        assert!(store.data.lock().await.is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_validation_error() {
        let (engine, _store) = engine_with(basic_bucket());
        let err = engine.take("api", "", TakeOptions::default()).await.unwrap_err();
        assert!(matches!(err, ThrottlerError::Validation { code, .. } if code == validation_code::MISSING_KEY));
    }

    #[tokio::test]
    async fn take_reset_rounds_up_to_the_next_whole_second() {
        let mut buckets = Map::new();
        buckets.insert("api".to_string(), RawBucketConfig { size: Some(10), per_second: Some(5), ..Default::default() });
        let (engine, store) = engine_with(buckets);
        store.advance(1_425_920_267_000);

        let result = engine.take("api", "1.1.1.1", TakeOptions { count: Some(Count::N(1)), config_override: None }).await.unwrap();
        assert!(result.conformant);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.reset, 1_425_920_268);
    }

    #[tokio::test]
    async fn denied_take_reports_reset_at_now_not_a_future_drip() {
        let mut buckets = Map::new();
        buckets.insert("api".to_string(), RawBucketConfig { size: Some(10), per_second: Some(5), ..Default::default() });
        let (engine, store) = engine_with(buckets);
        store.advance(1_425_920_267_000);

        let result = engine.take("api", "1.1.1.1", TakeOptions { count: Some(Count::N(12)), config_override: None }).await.unwrap();
        assert!(!result.conformant);
        assert_eq!(result.remaining, 10);
        assert_eq!(result.reset, 1_425_920_267);
    }

    #[tokio::test]
    async fn get_reports_the_drip_based_reset_without_consuming() {
        let mut buckets = Map::new();
        buckets.insert("api".to_string(), RawBucketConfig { size: Some(10), per_second: Some(5), ..Default::default() });
        let (engine, _store) = engine_with(buckets);

        engine.take("api", "henry", TakeOptions { count: Some(Count::N(3)), config_override: None }).await.unwrap();
        let result = engine.get("api", "henry").await.unwrap();
        assert_eq!(result.remaining, 7);
        // drip_ms = 1000/5 = 200; deficit of 3 tokens -> 600ms -> rounds up to 1s.
        assert_eq!(result.reset, 1);
    }

    #[tokio::test]
    async fn fixed_bucket_reports_zero_reset() {
        let mut buckets = Map::new();
        buckets.insert("quota".to_string(), RawBucketConfig { size: Some(5), ..Default::default() });
        let (engine, _store) = engine_with(buckets);

        engine.take("quota", "ivan", TakeOptions::default()).await.unwrap();
        let result = engine.get("quota", "ivan").await.unwrap();
        assert_eq!(result.reset, 0);
    }

    #[tokio::test]
    async fn put_honors_an_exact_name_override() {
        let mut overrides = Map::new();
        overrides.insert(
            "vip".to_string(),
            RawOverrideConfig {
                size: Some(100),
                per_interval: None,
                interval: None,
                per_second: Some(5),
                per_minute: None,
                per_hour: None,
                per_day: None,
                unlimited: false,
                ttl: None,
                until: None,
                match_pattern: None,
            },
        );
        let mut buckets = Map::new();
        buckets.insert("api".to_string(), RawBucketConfig { size: Some(10), per_second: Some(5), overrides, ..Default::default() });
        let (engine, _store) = engine_with(buckets);

        let result = engine.put("api", "vip", -30).await.unwrap();
        // Without the override this would clamp against a size-10 default;
        // the override's size-100 bucket has room for the full debit.
        assert_eq!(result.remaining, 70);
    }

    #[tokio::test]
    async fn wait_blocks_until_conformant() {
        let mut buckets = Map::new();
        buckets.insert("api".to_string(), RawBucketConfig { size: Some(1), per_second: Some(1), ..Default::default() });
        let (engine, store) = engine_with(buckets);

        engine.take("api", "greta", TakeOptions::default()).await.unwrap();
        store.advance(1_000);

        let result = engine.wait("api", "greta", TakeOptions::default()).await.unwrap();
        assert!(result.conformant);
    }
}
