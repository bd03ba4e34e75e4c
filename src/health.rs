//! # Health/Readiness Reporting
//!
//! Builds the structured status body the `/health`/`/ready` handlers
//! return. Readiness is judged from the ping monitor's cached failure
//! count rather than a synchronous probe, so a readiness check never waits
//! on the store - that would turn a liveness concern into a store round
//! trip per request.

use std::time::SystemTime;

use serde::Serialize;

use crate::throttler::Throttler;

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: String,
    pub clustered: bool,
    pub failed_pings: u32,
}

pub struct HealthChecker;

impl HealthChecker {
    pub fn check(throttler: &Throttler) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();
        let failed_pings = throttler.failed_pings();

        let store = ServiceStatus {
            status: if failed_pings == 0 { "healthy".to_string() } else { "degraded".to_string() },
            clustered: throttler.store().is_clustered(),
            failed_pings,
        };

        HealthStatus {
            status: store.status.clone(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus { store },
        }
    }
}
