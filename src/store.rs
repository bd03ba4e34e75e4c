//! # Store Driver
//!
//! Wraps the Redis-compatible connection the [`crate::engine::Engine`]
//! issues `take`/`put`/`get` against. [`Store`] is a trait rather than a
//! concrete struct so unit tests can substitute [`tests::MockStore`] for a
//! real connection - the same split the teacher crate drew between a
//! "local" and "distributed" rate limiter, generalized here into a proper
//! seam.
//!
//! [`RedisStore`] supports both a single node (`redis::Client`) and a
//! cluster (`redis::cluster_async::ClusterClient`) without introducing any
//! dependency beyond the `redis` crate's own `cluster`/`cluster-async`
//! features. Retry lives exclusively in [`crate::resilience`] - this module
//! never retries a failed command itself, it only reports what happened.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster_async::ClusterConnection;
use redis::cluster::ClusterClientBuilder;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::{broadcast, Mutex};

use crate::bucket_config::EffectiveBucket;
use crate::error::ThrottlerError;
use crate::scripts::{self, GetOutcome, PutOutcome, TakeOutcome};

/// Status events the driver reports on its own time, independent of any
/// particular caller's request - the typed-stream replacement for an
/// event-emitter `ready`/`error`/`node error` trio.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Ready,
    TransportError(String),
    NodeError(String),
    Closed,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn take(&self, full_key: &str, eff: &EffectiveBucket, tokens: u64) -> Result<TakeOutcome, ThrottlerError>;
    async fn put(&self, full_key: &str, eff: &EffectiveBucket, tokens: i64) -> Result<PutOutcome, ThrottlerError>;
    async fn get(&self, full_key: &str, eff: &EffectiveBucket) -> Result<GetOutcome, ThrottlerError>;
    async fn flush_all(&self) -> Result<(), ThrottlerError>;
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, ThrottlerError>;
    async fn ping(&self) -> Result<(), ThrottlerError>;
    /// Forces the underlying connection to drop and re-establish. Used by
    /// the ping monitor once `reconnect_if_failed` opts into acting on a
    /// string of failed pings, rather than only observing them.
    async fn reconnect(&self) -> Result<(), ThrottlerError>;
    async fn close(&self) -> Result<(), ThrottlerError>;
    fn is_clustered(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}

enum Backend {
    Single { client: Client, conn: Mutex<ConnectionManager> },
    Cluster { conn: Mutex<ClusterConnection> },
}

/// Production [`Store`] backed by a real Redis-compatible server or
/// cluster.
pub struct RedisStore {
    backend: Backend,
    take_script: Script,
    put_script: Script,
    get_script: Script,
    events: broadcast::Sender<DriverEvent>,
}

impl RedisStore {
    pub async fn connect_single(uri: &str) -> Result<Self, ThrottlerError> {
        let client = Client::open(uri).map_err(|e| ThrottlerError::Config(format!("invalid redis uri: {e}")))?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self::new(Backend::Single { client, conn: Mutex::new(conn) }))
    }

    pub async fn connect_cluster(nodes: &[String]) -> Result<Self, ThrottlerError> {
        let client = ClusterClientBuilder::new(nodes.to_vec())
            .build()
            .map_err(|e| ThrottlerError::Config(format!("invalid cluster nodes: {e}")))?;
        let conn = client.get_async_connection().await?;
        Ok(Self::new(Backend::Cluster { conn: Mutex::new(conn) }))
    }

    fn new(backend: Backend) -> Self {
        let (tx, _rx) = broadcast::channel(32);
        Self {
            backend,
            take_script: scripts::take_script(),
            put_script: scripts::put_script(),
            get_script: scripts::get_script(),
            events: tx,
        }
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    async fn reconnect_single_if_readonly(&self, err: &ThrottlerError) {
        if let Backend::Single { client, conn } = &self.backend {
            if matches!(err, ThrottlerError::Store(msg) if msg.starts_with("READONLY")) {
                if let Ok(fresh) = ConnectionManager::new(client.clone()).await {
                    *conn.lock().await = fresh;
                    tracing::warn!("store reported READONLY, reconnected");
                }
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn take(&self, full_key: &str, eff: &EffectiveBucket, tokens: u64) -> Result<TakeOutcome, ThrottlerError> {
        let result: redis::Value = match &self.backend {
            Backend::Single { conn, .. } => {
                let mut conn = conn.lock().await;
                self.take_script
                    .key(full_key)
                    .arg(eff.size)
                    .arg(eff.per_interval)
                    .arg(eff.interval_ms)
                    .arg(eff.ttl_secs)
                    .arg(tokens)
                    .arg(-1i64)
                    .invoke_async(&mut *conn)
                    .await?
            }
            Backend::Cluster { conn } => {
                let mut conn = conn.lock().await;
                self.take_script
                    .key(full_key)
                    .arg(eff.size)
                    .arg(eff.per_interval)
                    .arg(eff.interval_ms)
                    .arg(eff.ttl_secs)
                    .arg(tokens)
                    .arg(-1i64)
                    .invoke_async(&mut *conn)
                    .await?
            }
        };
        let outcome = scripts::parse_take_reply(result).map_err(ThrottlerError::from)?;
        tracing::debug!(key = full_key, remaining = outcome.remaining, conformant = outcome.conformant, "take");
        Ok(outcome)
    }

    async fn put(&self, full_key: &str, eff: &EffectiveBucket, tokens: i64) -> Result<PutOutcome, ThrottlerError> {
        let result: redis::Value = match &self.backend {
            Backend::Single { conn, .. } => {
                let mut conn = conn.lock().await;
                self.put_script
                    .key(full_key)
                    .arg(eff.size)
                    .arg(eff.per_interval)
                    .arg(eff.interval_ms)
                    .arg(eff.ttl_secs)
                    .arg(tokens)
                    .arg(-1i64)
                    .invoke_async(&mut *conn)
                    .await?
            }
            Backend::Cluster { conn } => {
                let mut conn = conn.lock().await;
                self.put_script
                    .key(full_key)
                    .arg(eff.size)
                    .arg(eff.per_interval)
                    .arg(eff.interval_ms)
                    .arg(eff.ttl_secs)
                    .arg(tokens)
                    .arg(-1i64)
                    .invoke_async(&mut *conn)
                    .await?
            }
        };
        scripts::parse_put_reply(result).map_err(ThrottlerError::from)
    }

    async fn get(&self, full_key: &str, eff: &EffectiveBucket) -> Result<GetOutcome, ThrottlerError> {
        let result: redis::Value = match &self.backend {
            Backend::Single { conn, .. } => {
                let mut conn = conn.lock().await;
                self.get_script
                    .key(full_key)
                    .arg(eff.size)
                    .arg(eff.per_interval)
                    .arg(eff.interval_ms)
                    .arg(-1i64)
                    .invoke_async(&mut *conn)
                    .await?
            }
            Backend::Cluster { conn } => {
                let mut conn = conn.lock().await;
                self.get_script
                    .key(full_key)
                    .arg(eff.size)
                    .arg(eff.per_interval)
                    .arg(eff.interval_ms)
                    .arg(-1i64)
                    .invoke_async(&mut *conn)
                    .await?
            }
        };
        scripts::parse_get_reply(result).map_err(ThrottlerError::from)
    }

    async fn flush_all(&self) -> Result<(), ThrottlerError> {
        match &self.backend {
            Backend::Single { conn, .. } => {
                let mut conn = conn.lock().await;
                redis::cmd("FLUSHDB").query_async::<_, ()>(&mut *conn).await?;
            }
            Backend::Cluster { conn } => {
                let mut conn = conn.lock().await;
                redis::cmd("FLUSHDB").query_async::<_, ()>(&mut *conn).await?;
            }
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, ThrottlerError> {
        let mut keys = Vec::new();
        match &self.backend {
            Backend::Single { conn, .. } => {
                let mut conn = conn.lock().await;
                let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
            }
            Backend::Cluster { conn } => {
                let mut conn = conn.lock().await;
                let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), ThrottlerError> {
        let result = match &self.backend {
            Backend::Single { conn, .. } => {
                let mut conn = conn.lock().await;
                redis::cmd("PING").query_async::<_, String>(&mut *conn).await
            }
            Backend::Cluster { conn } => {
                let mut conn = conn.lock().await;
                redis::cmd("PING").query_async::<_, String>(&mut *conn).await
            }
        };
        match result {
            Ok(_) => {
                self.emit(DriverEvent::Ready);
                Ok(())
            }
            Err(e) => {
                let err = ThrottlerError::from(e);
                self.reconnect_single_if_readonly(&err).await;
                self.emit(DriverEvent::TransportError(err.to_string()));
                Err(err)
            }
        }
    }

    async fn reconnect(&self) -> Result<(), ThrottlerError> {
        match &self.backend {
            Backend::Single { client, conn } => {
                let fresh = ConnectionManager::new(client.clone()).await?;
                *conn.lock().await = fresh;
                tracing::warn!("forced reconnect of single-node connection");
                self.emit(DriverEvent::Ready);
                Ok(())
            }
            // Cluster mode has no ping monitor (see `Throttler::connect`), so
            // this path is never driven by a failed-ping reconnect; the
            // cluster client already manages its own node reconnects.
            Backend::Cluster { .. } => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), ThrottlerError> {
        self.emit(DriverEvent::Closed);
        Ok(())
    }

    fn is_clustered(&self) -> bool {
        matches!(self.backend, Backend::Cluster { .. })
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

pub type SharedStore = Arc<dyn Store>;

pub async fn connect(uri: Option<&str>, nodes: Option<&[String]>) -> Result<SharedStore, ThrottlerError> {
    if let Some(nodes) = nodes {
        if nodes.is_empty() {
            return Err(ThrottlerError::Config("`nodes` was provided but is empty".into()));
        }
        return Ok(Arc::new(RedisStore::connect_cluster(nodes).await?));
    }
    let uri = uri.ok_or_else(|| ThrottlerError::Config("neither `uri` nor `nodes` was configured".into()))?;
    Ok(Arc::new(RedisStore::connect_single(uri).await?))
}
