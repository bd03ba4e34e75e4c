//! # Resilience Wrapper
//!
//! Wraps every call into the [`crate::engine::Engine`] with bounded retry,
//! a per-attempt timeout, and a hand-rolled circuit breaker. Kept as a
//! small state machine rather than a `tower` layer stack because the
//! breaker's one bespoke rule - validation errors never count as failures
//! - doesn't fall naturally out of `tower::retry`/a generic breaker layer
//! without enough customization that the generic layer stops paying for
//! itself. `RateLimiter`, the crate's top-level public type, is this
//! wrapper around an `Engine`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bucket_config::BucketType;
use crate::engine::{Engine, GetResult, PutResult, TakeOptions, TakeResult};
use crate::error::ThrottlerError;
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 1, backoff_min_ms: 10, backoff_max_ms: 30 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 10, base_cooldown: Duration::from_secs(1), max_cooldown: Duration::from_secs(3) }
    }
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { retry_at: Instant, cooldown: Duration },
    HalfOpen { cooldown: Duration },
}

struct Breaker {
    state: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
}

impl Breaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self { state: Mutex::new(BreakerState::Closed { consecutive_failures: 0 }), config }
    }

    async fn admit(&self) -> Result<(), ThrottlerError> {
        let mut state = self.state.lock().await;
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::HalfOpen { .. } => Ok(()),
            BreakerState::Open { retry_at, cooldown } => {
                if Instant::now() >= retry_at {
                    *state = BreakerState::HalfOpen { cooldown };
                    Ok(())
                } else {
                    Err(ThrottlerError::BreakerOpen)
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        *state = BreakerState::Closed { consecutive_failures: 0 };
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        let next_cooldown = match *state {
            BreakerState::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    Some(self.config.base_cooldown)
                } else {
                    *state = BreakerState::Closed { consecutive_failures: failures };
                    None
                }
            }
            BreakerState::HalfOpen { cooldown } => Some((cooldown * 2).min(self.config.max_cooldown)),
            BreakerState::Open { cooldown, .. } => Some(cooldown),
        };

        if let Some(cooldown) = next_cooldown {
            *state = BreakerState::Open { retry_at: Instant::now() + cooldown, cooldown };
        }
    }
}

/// The crate's top-level rate limiter: an [`Engine`] wrapped in retry,
/// timeout, and a circuit breaker.
pub struct RateLimiter {
    engine: Engine,
    retry: RetryConfig,
    breaker: Breaker,
    command_timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: SharedStore,
        buckets: Arc<std::collections::HashMap<String, BucketType>>,
        prefix: impl Into<String>,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
        command_timeout: Duration,
    ) -> Self {
        Self { engine: Engine::new(store, buckets, prefix), retry, breaker: Breaker::new(breaker), command_timeout }
    }

    async fn call<F, Fut, T>(&self, op: F) -> Result<T, ThrottlerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ThrottlerError>>,
    {
        self.breaker.admit().await?;

        let mut attempt = 0;
        loop {
            let outcome = tokio::time::timeout(self.command_timeout, op())
                .await
                .unwrap_or_else(|_| Err(ThrottlerError::Transport("command timed out".into())));

            match outcome {
                Ok(value) => {
                    self.breaker.record_success().await;
                    return Ok(value);
                }
                Err(err) if !err.is_retriable() => return Err(err),
                Err(err) => {
                    self.breaker.record_failure().await;
                    if attempt >= self.retry.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    let jitter_ms = rand::thread_rng().gen_range(self.retry.backoff_min_ms..=self.retry.backoff_max_ms);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
            }
        }
    }

    pub async fn take(&self, bucket_type: &str, key: &str, opts: TakeOptions) -> Result<TakeResult, ThrottlerError> {
        self.call(|| self.engine.take(bucket_type, key, opts.clone())).await
    }

    pub async fn wait(&self, bucket_type: &str, key: &str, opts: TakeOptions) -> Result<TakeResult, ThrottlerError> {
        // `wait` already retries internally against the engine until
        // conformant; the resilience layer still bounds each underlying
        // store round trip, but does not re-wrap the whole blocking loop
        // in the breaker/retry budget meant for single calls.
        self.engine.wait(bucket_type, key, opts).await
    }

    pub async fn put(&self, bucket_type: &str, key: &str, count: i64) -> Result<PutResult, ThrottlerError> {
        self.call(|| self.engine.put(bucket_type, key, count)).await
    }

    pub async fn get(&self, bucket_type: &str, key: &str) -> Result<GetResult, ThrottlerError> {
        self.call(|| self.engine.get(bucket_type, key)).await
    }

    pub async fn reset_all(&self) -> Result<(), ThrottlerError> {
        self.call(|| self.engine.reset_all()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_rejects_fast() {
        let breaker = Breaker::new(CircuitBreakerConfig { failure_threshold: 2, base_cooldown: Duration::from_millis(50), max_cooldown: Duration::from_millis(200) });
        breaker.admit().await.unwrap();
        breaker.record_failure().await;
        breaker.admit().await.unwrap();
        breaker.record_failure().await;

        assert!(matches!(breaker.admit().await, Err(ThrottlerError::BreakerOpen)));
    }

    #[tokio::test]
    async fn breaker_recovers_to_closed_after_success() {
        let breaker = Breaker::new(CircuitBreakerConfig { failure_threshold: 1, base_cooldown: Duration::from_millis(10), max_cooldown: Duration::from_millis(20) });
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        breaker.admit().await.unwrap(); // half-open
        breaker.record_success().await;
        assert!(matches!(*breaker.state.lock().await, BreakerState::Closed { consecutive_failures: 0 }));
    }

    #[tokio::test]
    async fn validation_errors_never_count_against_breaker() {
        let breaker = Arc::new(Breaker::new(CircuitBreakerConfig { failure_threshold: 1, base_cooldown: Duration::from_secs(1), max_cooldown: Duration::from_secs(1) }));
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_clone = attempts.clone();
        let call = || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ThrottlerError::validation(101, "bad")) }
        };

        let result = call().await;
        assert!(result.is_err());
        assert!(breaker.admit().await.is_ok());
    }
}
