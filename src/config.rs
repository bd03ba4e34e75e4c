//! # Configuration Loading
//!
//! Layers an optional config file under `THROTTLER_`-prefixed environment
//! variables (via the `config` crate, with `.env` loaded first through
//! `dotenv`), exactly the way the teacher crate already did for its own,
//! much smaller, settings struct. Bucket definitions are safety-critical,
//! so a missing `uri`/`nodes` or a missing/malformed `buckets` table is a
//! fatal [`ThrottlerError::Config`] - server-only concerns (bind address,
//! log level) still fall back to sane defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::bucket_config::{self, BucketType, DEFAULT_GLOBAL_TTL_SECS, RawBucketConfig};
use crate::error::ThrottlerError;
use crate::ping::PingConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub uri: Option<String>,
    pub nodes: Option<Vec<String>>,
    pub buckets: HashMap<String, RawBucketConfig>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    pub global_ttl_secs: Option<u64>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,
    #[serde(default)]
    pub ping_max_failed_attempts: Option<u32>,
    #[serde(default)]
    pub ping_reconnect_on_failure: bool,
    #[serde(default)]
    pub retry_max_retries: Option<u32>,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default)]
    pub breaker_failure_threshold: Option<u32>,
}

fn default_prefix() -> String {
    "throttler:".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from an optional file plus `THROTTLER_`-prefixed
    /// environment variables, `.env` included. Unlike the teacher's
    /// best-effort server config, a bucket tree that fails to parse - or
    /// is simply absent - is a startup-aborting error, since it would
    /// otherwise mean every request passes through with no rate limiting
    /// at all.
    pub fn load(path: &str) -> Result<Self, ThrottlerError> {
        dotenv::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("THROTTLER").separator("__"))
            .build()
            .map_err(|e| ThrottlerError::Config(format!("failed to build configuration: {e}")))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ThrottlerError::Config(format!("failed to parse configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ThrottlerError> {
        if self.uri.is_none() && self.nodes.is_none() {
            return Err(ThrottlerError::Config("configuration must set either `uri` or `nodes`".into()));
        }
        if self.buckets.is_empty() {
            return Err(ThrottlerError::Config("configuration must declare at least one bucket type".into()));
        }
        Ok(())
    }

    pub fn global_ttl_cap(&self) -> u64 {
        self.global_ttl_secs.unwrap_or(DEFAULT_GLOBAL_TTL_SECS)
    }

    pub fn normalized_buckets(&self) -> Result<HashMap<String, BucketType>, ThrottlerError> {
        bucket_config::normalize_registry(&self.buckets, self.global_ttl_cap())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig { max_retries: self.retry_max_retries.unwrap_or(1), ..RetryConfig::default() }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold.unwrap_or(10),
            ..CircuitBreakerConfig::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.unwrap_or(75))
    }

    pub fn ping_config(&self) -> PingConfig {
        PingConfig {
            interval: Duration::from_secs(self.ping_interval_secs.unwrap_or(2)),
            max_failed_attempts: self.ping_max_failed_attempts.unwrap_or(5),
        }
    }

    /// Whether the ping monitor should force an actual reconnect once
    /// `max_failed_attempts` consecutive pings have failed. Defaults to
    /// `false` - observing a string of failures is not itself a mandate to
    /// act on them.
    pub fn ping_reconnect_on_failure(&self) -> bool {
        self.ping_reconnect_on_failure
    }
}
