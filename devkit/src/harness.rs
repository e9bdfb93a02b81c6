/*!
Test Harness pour le cache d'inventaire VMForge

Monte un `InventoryCache` branché sur un `FakeVCenter` et un store mémoire,
enregistre tous les événements émis et fournit des attentes bornées.
*/

use crate::fake_vcenter::FakeVCenter;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use vmforge_kernel::fetchers::DatacenterFilter;
use vmforge_kernel::retry::RetryPolicy;
use vmforge_kernel::{
    CacheEvent, CacheStore, Credentials, EventKind, InventoryCache, InventorySettings, ResourceKind,
    SyncSettings, SyncWorker,
};

const POLL: Duration = Duration::from_millis(10);
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

pub struct HarnessBuilder {
    vcenter: FakeVCenter,
    store: CacheStore,
    settings: InventorySettings,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            vcenter: FakeVCenter::lab(),
            store: CacheStore::memory(),
            settings: InventorySettings {
                credentials: Credentials::new(
                    "vcenter.lab.local",
                    "administrator@vsphere.local",
                    "VMware1!",
                ),
                connect_retry: RetryPolicy::no_retry(),
                ..InventorySettings::default()
            },
        }
    }

    pub fn vcenter(mut self, vcenter: FakeVCenter) -> Self {
        self.vcenter = vcenter;
        self
    }

    /// Partager un store entre plusieurs harness (isolation des scopes)
    pub fn store(mut self, store: CacheStore) -> Self {
        self.store = store;
        self
    }

    pub fn credentials(mut self, server: &str, username: &str, password: &str) -> Self {
        self.settings.credentials = Credentials::new(server, username, password);
        self
    }

    pub fn ttl(mut self, kind: ResourceKind, secs: u64) -> Self {
        self.settings.ttl.set(kind, secs);
        self
    }

    pub fn datacenters(mut self, csv: &str) -> Self {
        self.settings.datacenter_filter = DatacenterFilter::from_csv(csv);
        self
    }

    pub fn simulate(mut self, simulate: bool) -> Self {
        self.settings.simulate = simulate;
        self
    }

    pub fn simulate_on_failure(mut self, enabled: bool) -> Self {
        self.settings.simulate_on_failure = enabled;
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.snapshot_path = Some(path.into());
        self
    }

    /// À appeler dans un runtime tokio
    pub fn build(self) -> TestHarness {
        env_logger::try_init().ok(); // Init logging pour tests

        let cache = InventoryCache::new(self.settings, Arc::new(self.vcenter.clone()), self.store);
        let events: Arc<Mutex<Vec<CacheEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = events.clone();
        cache.add_listener(move |event| {
            recorder.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
        });
        log::info!("🧪 Harness ready on scope {}", cache.scope());

        TestHarness {
            vcenter: self.vcenter,
            cache,
            events,
        }
    }
}

pub struct TestHarness {
    pub vcenter: FakeVCenter,
    pub cache: InventoryCache,
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    /// Harness par défaut : inventaire de labo, store mémoire
    pub fn new() -> Self {
        HarnessBuilder::new().build()
    }

    pub fn sync_worker(&self, interval: Duration, cooldown: Duration) -> SyncWorker {
        SyncWorker::new(self.cache.clone(), SyncSettings { interval, cooldown })
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn event_kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn count_events(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Attend le premier événement `kind` dont `data[field] == value`
    pub async fn wait_for_event_with(
        &self,
        kind: EventKind,
        field: &str,
        value: &str,
    ) -> Result<CacheEvent> {
        let deadline = Instant::now() + DEFAULT_WAIT;
        loop {
            let found = self
                .events()
                .into_iter()
                .find(|e| {
                    e.kind == kind && e.data.get(field).and_then(|v| v.as_str()) == Some(value)
                });
            if let Some(event) = found {
                return Ok(event);
            }
            if Instant::now() >= deadline {
                bail!("no {kind:?} event with {field}={value} within {DEFAULT_WAIT:?}");
            }
            sleep(POLL).await;
        }
    }

    pub async fn wait_for_event(&self, kind: EventKind) -> Result<CacheEvent> {
        self.wait_for_events(kind, 1).await?;
        self.events()
            .into_iter()
            .find(|e| e.kind == kind)
            .ok_or_else(|| anyhow::anyhow!("event {kind:?} vanished"))
    }

    /// Attend qu'au moins `count` événements `kind` aient été reçus
    pub async fn wait_for_events(&self, kind: EventKind, count: usize) -> Result<()> {
        let deadline = Instant::now() + DEFAULT_WAIT;
        while self.count_events(kind) < count {
            if Instant::now() >= deadline {
                bail!(
                    "expected {count} {kind:?} events within {DEFAULT_WAIT:?}, got {}",
                    self.count_events(kind)
                );
            }
            sleep(POLL).await;
        }
        Ok(())
    }

    pub async fn wait_until(&self, what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
        let deadline = Instant::now() + DEFAULT_WAIT;
        while !check() {
            if Instant::now() >= deadline {
                bail!("condition not reached within {DEFAULT_WAIT:?}: {what}");
            }
            sleep(POLL).await;
        }
        Ok(())
    }

    /// Toutes les sessions ouvertes ont été refermées
    pub async fn wait_sessions_closed(&self) -> Result<()> {
        let vcenter = self.vcenter.clone();
        self.wait_until("every vCenter session disconnected", move || {
            vcenter.sessions_opened() == vcenter.disconnects()
        })
        .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_records_load_events() {
        let harness = TestHarness::new();
        let listing = harness.cache.get_datacenters(true).await;
        assert_eq!(listing.items.len(), 2);

        harness.wait_for_event(EventKind::LoadingCompleted).await.unwrap();
        assert_eq!(harness.event_kinds()[0], EventKind::LoadingStarted);
    }
}
