//! # Operation Metrics
//!
//! Counts only - no external exporter is wired up, matching the ambient
//! observability scope this crate carries. Callers can surface
//! [`ThrottleMetrics`] however they like (a log line, a debug endpoint);
//! the collector itself just keeps per-bucket-type counters in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub last_reset: u64,
}

impl Default for ThrottleMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            allowed_requests: 0,
            throttled_requests: 0,
            last_reset: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
        }
    }
}

/// Per-bucket-type request counters, shared across handler tasks.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    by_bucket_type: Arc<RwLock<HashMap<String, ThrottleMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_take(&self, bucket_type: &str, conformant: bool) {
        let mut metrics = self.by_bucket_type.write().await;
        let entry = metrics.entry(bucket_type.to_string()).or_default();
        entry.total_requests += 1;
        if conformant {
            entry.allowed_requests += 1;
        } else {
            entry.throttled_requests += 1;
        }
    }

    pub async fn get(&self, bucket_type: &str) -> Option<ThrottleMetrics> {
        self.by_bucket_type.read().await.get(bucket_type).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, ThrottleMetrics> {
        self.by_bucket_type.read().await.clone()
    }

    pub async fn global(&self) -> ThrottleMetrics {
        let metrics = self.by_bucket_type.read().await;
        let mut global = ThrottleMetrics::default();
        for entry in metrics.values() {
            global.total_requests += entry.total_requests;
            global.allowed_requests += entry.allowed_requests;
            global.throttled_requests += entry.throttled_requests;
        }
        global
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_allowed_and_throttled_separately() {
        let metrics = MetricsCollector::new();
        metrics.record_take("api", true).await;
        metrics.record_take("api", false).await;
        metrics.record_take("api", true).await;

        let snapshot = metrics.get("api").await.unwrap();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.allowed_requests, 2);
        assert_eq!(snapshot.throttled_requests, 1);
    }

    #[tokio::test]
    async fn global_aggregates_across_bucket_types() {
        let metrics = MetricsCollector::new();
        metrics.record_take("api", true).await;
        metrics.record_take("uploads", false).await;

        let global = metrics.global().await;
        assert_eq!(global.total_requests, 2);
        assert_eq!(global.allowed_requests, 1);
        assert_eq!(global.throttled_requests, 1);
    }
}
