use crate::loader::InventoryCache;
use crate::store::StoreMetricsSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub scope: String,
    pub simulated: bool,
    pub cache_backend: &'static str,
    pub cache_available: bool,
    pub store: StoreMetricsSnapshot,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    pub is_syncing: bool,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, cache: &InventoryCache) -> KernelHealth {
        let status = cache.get_status();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            scope: status.scope,
            simulated: status.simulated,
            cache_backend: status.backend,
            cache_available: status.backend_available,
            store: cache.store().metrics(),
            last_sync: status.last_sync,
            is_syncing: status.is_syncing,
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::InventorySettings;
    use crate::simulation::SimulatedConnector;
    use crate::store::CacheStore;

    #[tokio::test]
    async fn test_health_reports_cache_and_mqtt_state() {
        let cache = InventoryCache::new(
            InventorySettings { simulate: true, ..InventorySettings::default() },
            Arc::new(SimulatedConnector),
            CacheStore::unavailable(),
        );
        let tracker = HealthTracker::new();
        assert_eq!(tracker.get_health(&cache).mqtt_status, "disabled");

        tracker.mark_mqtt_connecting();
        tracker.increment_reconnects();
        let health = tracker.get_health(&cache);
        assert_eq!(health.mqtt_status, "reconnecting");
        assert_eq!(health.mqtt_reconnects, 1);
        assert_eq!(health.cache_backend, "unavailable");
        assert!(!health.cache_available);
        assert!(health.simulated);
        assert!(health.scope.starts_with("sim-"));
    }
}
