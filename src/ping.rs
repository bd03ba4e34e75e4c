//! # Ping Monitor
//!
//! Single-node liveness probing: a `tokio::time::interval` loop issuing
//! `PING` against the store, counting consecutive failures, and, once
//! `max_failed_attempts` is exceeded, consulting `reconnect_if_failed`
//! (default `false`) before forcing the driver to disconnect and
//! reconnect via [`crate::store::Store::reconnect`]. Skipped entirely in
//! cluster mode ([`crate::store::Store::is_clustered`]), where node-level
//! health is the cluster client's own concern.
//!
//! A `generation` counter plays the role the original event-loop-based
//! implementation gave `pingTaskId`: every `stop()` bumps it, so a ping
//! future that was already in flight when `stop()` was called discards its
//! result instead of acting on state that's no longer current.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::store::SharedStore;

#[derive(Debug, Clone)]
pub enum PingEvent {
    Success { duration: Duration },
    Error { message: String, duration: Duration },
    Reconnect,
    ReconnectDryRun,
}

#[derive(Debug, Clone, Copy)]
pub struct PingConfig {
    pub interval: Duration,
    pub max_failed_attempts: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(2), max_failed_attempts: 5 }
    }
}

pub struct PingMonitor {
    generation: Arc<AtomicU64>,
    failed_pings: Arc<AtomicU32>,
    handle: Option<JoinHandle<()>>,
    events: broadcast::Sender<PingEvent>,
}

impl PingMonitor {
    /// Starts the monitor. `reconnect_if_failed` is consulted once
    /// `max_failed_attempts` consecutive pings have failed; returning
    /// `true` triggers an actual reconnect, `false` only emits
    /// `ReconnectDryRun` (useful for observing without acting).
    pub fn start(
        store: SharedStore,
        config: PingConfig,
        reconnect_if_failed: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(32);
        let generation = Arc::new(AtomicU64::new(0));
        let failed_pings = Arc::new(AtomicU32::new(0));

        let handle = if store.is_clustered() {
            None
        } else {
            let tx = tx.clone();
            let generation = generation.clone();
            let failed_pings = failed_pings.clone();
            let my_generation = generation.load(Ordering::SeqCst);

            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.interval);
                loop {
                    ticker.tick().await;
                    if generation.load(Ordering::SeqCst) != my_generation {
                        return;
                    }

                    let start = std::time::Instant::now();
                    let result = store.ping().await;
                    let duration = start.elapsed();

                    if generation.load(Ordering::SeqCst) != my_generation {
                        return;
                    }

                    match result {
                        Ok(()) => {
                            failed_pings.store(0, Ordering::SeqCst);
                            let _ = tx.send(PingEvent::Success { duration });
                        }
                        Err(e) => {
                            let failures = failed_pings.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = tx.send(PingEvent::Error { message: e.to_string(), duration });

                            if failures >= config.max_failed_attempts {
                                let jitter = rand::thread_rng().gen_range(0.0..0.1)
                                    * config.interval.as_millis() as f64
                                    * config.max_failed_attempts as f64;
                                tokio::time::sleep(Duration::from_millis(jitter as u64)).await;

                                if reconnect_if_failed() {
                                    if let Err(e) = store.reconnect().await {
                                        tracing::warn!(error = %e, "forced reconnect failed");
                                    }
                                    let _ = tx.send(PingEvent::Reconnect);
                                } else {
                                    let _ = tx.send(PingEvent::ReconnectDryRun);
                                }
                                failed_pings.store(0, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }))
        };

        Self { generation, failed_pings, handle, events: tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PingEvent> {
        self.events.subscribe()
    }

    pub fn failed_pings(&self) -> u32 {
        self.failed_pings.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for PingMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
