//! # Service Orchestrator
//!
//! Owns the lifetime of everything a running instance needs: the store
//! connection, the normalized bucket registry, the [`RateLimiter`], and the
//! background [`PingMonitor`]. `server.rs` builds one `Throttler` at
//! startup and hands clones of its `Arc<RateLimiter>` to handlers; `close()`
//! is the single place that tears all of it down for a graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bucket_config::BucketType;
use crate::config::Config;
use crate::error::{validation_code, ThrottlerError};
use crate::metrics::MetricsCollector;
use crate::ping::PingMonitor;
use crate::resilience::RateLimiter;
use crate::store::{self, SharedStore};
use crate::validation::RequestValidator;

pub struct Throttler {
    pub limiter: Arc<RateLimiter>,
    pub metrics: MetricsCollector,
    pub validator: RequestValidator,
    store: SharedStore,
    ping: Option<PingMonitor>,
    closed: AtomicBool,
}

impl Throttler {
    pub async fn connect(config: &Config) -> Result<Self, ThrottlerError> {
        let buckets: HashMap<String, BucketType> = config.normalized_buckets()?;
        let store = store::connect(config.uri.as_deref(), config.nodes.as_deref()).await?;

        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            Arc::new(buckets),
            config.prefix.clone(),
            config.retry_config(),
            config.breaker_config(),
            config.command_timeout(),
        ));

        let ping = if store.is_clustered() {
            None
        } else {
            let reconnect_on_failure = config.ping_reconnect_on_failure();
            Some(PingMonitor::start(
                store.clone(),
                config.ping_config(),
                Arc::new(move || {
                    if reconnect_on_failure {
                        tracing::warn!("ping monitor exceeded max failed attempts, reconnecting");
                    }
                    reconnect_on_failure
                }),
            ))
        };

        Ok(Self {
            limiter,
            metrics: MetricsCollector::new(),
            validator: RequestValidator::new(),
            store,
            ping,
            closed: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn subscribe_ping(&self) -> Option<tokio::sync::broadcast::Receiver<crate::ping::PingEvent>> {
        self.ping.as_ref().map(|p| p.subscribe())
    }

    pub fn failed_pings(&self) -> u32 {
        self.ping.as_ref().map_or(0, |p| p.failed_pings())
    }

    /// Tears the service down. A second call returns a validation error with
    /// code [`validation_code::ALREADY_CLOSED`] rather than silently
    /// succeeding, so callers can't mistake a double-close for a clean one.
    pub async fn close(&mut self) -> Result<(), ThrottlerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ThrottlerError::validation(validation_code::ALREADY_CLOSED, "throttler is already closed"));
        }

        if let Some(mut ping) = self.ping.take() {
            ping.stop();
        }
        self.store.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
