/**
 * SYNC - Resynchronisation périodique des scopes déjà utilisés
 *
 * RÔLE :
 * Tâche longue durée qui, à intervalle fixe, re-fetch et réconcilie tout ce
 * qui a déjà été chargé (datacenters, clusters par datacenter, ressources et
 * templates par cluster) sans jamais bloquer les lectures.
 *
 * FONCTIONNEMENT :
 * - Une seule passe à la fois dans le process (try_lock) : un déclenchement
 *   pendant une passe renvoie la progression courante, rien n'est mis en file
 * - Cooldown depuis la dernière passe (sauf déclenchement forcé)
 * - Une session vCenter pour toute la passe, templates en dernier
 * - Progression publiée à chaque étape (événement sync_progress)
 * - Erreurs loggées + enregistrées dans le statut, la boucle ne s'arrête jamais
 * - Arrêt : signal watch + join borné par l'appelant
 */

use crate::events::EventKind;
use crate::loader::{InventoryCache, LoadError, LoadedScopes, SessionGuard};
use crate::status::SyncProgress;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub cooldown: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub steps: usize,
    pub failures: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Passe lancée en tâche de fond
    Started,
    AlreadyRunning { progress: Option<SyncProgress> },
    CoolingDown { remaining_secs: u64 },
    NothingToSync,
}

#[derive(Clone)]
pub struct SyncWorker {
    cache: InventoryCache,
    settings: SyncSettings,
    gate: Arc<Mutex<()>>,
    last_pass: Arc<parking_lot::Mutex<Option<Instant>>>,
}

pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Demande l'arrêt et attend au plus `drain` la fin de la passe en cours
    pub async fn shutdown(self, drain: Duration) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(drain, &mut task).await.is_err() {
            warn!(?drain, "background sync still running, aborting");
            task.abort();
        }
    }
}

impl SyncWorker {
    pub fn new(cache: InventoryCache, settings: SyncSettings) -> Self {
        Self {
            cache,
            settings,
            gate: Arc::new(Mutex::new(())),
            last_pass: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Verrou de passe ou raison du refus
    fn admit(&self, force: bool) -> Result<OwnedMutexGuard<()>, SyncOutcome> {
        let Ok(turn) = self.gate.clone().try_lock_owned() else {
            return Err(SyncOutcome::AlreadyRunning {
                progress: self.cache.status().lock().sync_progress(),
            });
        };
        if !force {
            if let Some(last) = *self.last_pass.lock() {
                let elapsed = last.elapsed();
                if elapsed < self.settings.cooldown {
                    return Err(SyncOutcome::CoolingDown {
                        remaining_secs: (self.settings.cooldown - elapsed).as_secs(),
                    });
                }
            }
        }
        if self.cache.loaded_scopes().is_empty() {
            return Err(SyncOutcome::NothingToSync);
        }
        Ok(turn)
    }

    /// Exécute une passe et attend sa fin
    pub async fn run_now(&self, force: bool) -> SyncOutcome {
        match self.admit(force) {
            Ok(turn) => SyncOutcome::Completed(self.run_pass(turn).await),
            Err(outcome) => outcome,
        }
    }

    /// Lance une passe en arrière-plan (déclenchement HTTP)
    pub fn start(&self, force: bool) -> SyncOutcome {
        match self.admit(force) {
            Ok(turn) => {
                let worker = self.clone();
                tokio::spawn(async move {
                    worker.run_pass(turn).await;
                });
                SyncOutcome::Started
            }
            Err(outcome) => outcome,
        }
    }

    fn record_step(
        &self,
        label: String,
        result: Result<usize, LoadError>,
        failures: &mut Vec<String>,
    ) -> bool {
        let failed = match &result {
            Ok(count) => {
                debug!(step = %label, count, "sync step done");
                false
            }
            Err(e) => {
                warn!(step = %label, error = %e, "sync step failed");
                failures.push(format!("{label}: {e}"));
                true
            }
        };
        let progress = self.cache.status().lock().sync_step(label, failed);
        if let Some(progress) = progress {
            self.cache
                .emit(EventKind::SyncProgress, serde_json::to_value(&progress).unwrap_or_default());
        }
        // vCenter perdu : inutile d'enchaîner les étapes restantes
        matches!(&result, Err(e) if e.is_connectivity())
    }

    async fn run_pass(&self, _turn: OwnedMutexGuard<()>) -> SyncReport {
        let started = Instant::now();
        let scopes = self.cache.loaded_scopes();
        let total = scopes.step_count();
        self.cache.status().lock().sync_started(total);
        info!(
            total,
            clusters = scopes.cluster_resources.len(),
            scope = %self.cache.scope(),
            "background sync started"
        );

        let mut failures = Vec::new();
        let since = OffsetDateTime::now_utc();
        let error = match self.cache.open_session().await {
            Ok(mut session) => {
                let aborted = self.sync_scopes(&mut session, &scopes, since, &mut failures).await;
                session.close().await;
                aborted.or_else(|| {
                    (!failures.is_empty())
                        .then(|| format!("{} sync step(s) failed", failures.len()))
                })
            }
            Err(e) => {
                warn!(error = %e, "background sync cannot reach vCenter, retrying next interval");
                Some(e.to_string())
            }
        };

        self.cache.status().lock().sync_finished(error.clone());
        *self.last_pass.lock() = Some(Instant::now());
        self.cache.save_snapshot().await;

        let report = SyncReport {
            steps: total,
            failures,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        };
        info!(
            steps = report.steps,
            failures = report.failures.len(),
            duration_ms = report.duration_ms,
            "background sync completed"
        );
        self.cache.emit(
            EventKind::BackgroundSyncCompleted,
            json!({
                "steps": report.steps,
                "failures": report.failures.len(),
                "duration_ms": report.duration_ms,
                "error": report.error,
            }),
        );
        report
    }

    /// `Some(erreur)` si la passe a été interrompue (vCenter injoignable)
    async fn sync_scopes(
        &self,
        session: &mut SessionGuard,
        scopes: &LoadedScopes,
        since: OffsetDateTime,
        failures: &mut Vec<String>,
    ) -> Option<String> {
        let stop = |label: String, result: Result<usize, LoadError>, failures: &mut Vec<String>| {
            let error = result.as_ref().err().map(|e| e.to_string());
            self.record_step(label, result, failures).then_some(error).flatten()
        };

        if scopes.datacenters {
            let result = self.cache.sync_datacenters(session, since).await;
            if let Some(e) = stop("datacenters".into(), result, failures) {
                return Some(e);
            }
        }
        for datacenter in &scopes.clusters {
            let result = self.cache.sync_clusters(session, datacenter, since).await;
            if let Some(e) = stop(format!("clusters:{datacenter}"), result, failures) {
                return Some(e);
            }
        }
        for cluster_id in &scopes.cluster_resources {
            let result = self.cache.sync_cluster(session, cluster_id, since).await.map(|_| 3);
            if let Some(e) = stop(format!("resources:{cluster_id}"), result, failures) {
                return Some(e);
            }
        }
        // les templates sont les plus lents : en dernier, pour ne pas retarder le reste
        for cluster_id in &scopes.templates {
            let result = self.cache.sync_templates_for(session, cluster_id, since).await;
            if let Some(e) = stop(format!("templates:{cluster_id}"), result, failures) {
                return Some(e);
            }
        }
        None
    }

    /// Boucle périodique ; le premier tick (immédiat) est sauté
    pub fn spawn(&self) -> SyncHandle {
        let (shutdown, mut stop_rx) = watch::channel(false);
        let worker = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(worker.settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            info!(interval_secs = worker.settings.interval.as_secs(), "background sync scheduled");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match worker.run_now(false).await {
                            SyncOutcome::Completed(_) => {}
                            other => debug!(outcome = ?other, "scheduled sync skipped"),
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("background sync stopped");
        });
        SyncHandle { shutdown, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CacheEvent;
    use crate::loader::InventorySettings;
    use crate::scope::Credentials;
    use crate::simulation::SimulatedConnector;
    use crate::store::CacheStore;

    fn simulated_cache() -> InventoryCache {
        let settings = InventorySettings {
            credentials: Credentials::new("vcenter.test", "admin", "secret"),
            simulate: true,
            ..InventorySettings::default()
        };
        InventoryCache::new(settings, Arc::new(SimulatedConnector), CacheStore::memory())
    }

    fn quick() -> SyncSettings {
        SyncSettings {
            interval: Duration::from_millis(50),
            cooldown: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_nothing_loaded_means_nothing_to_sync() {
        let worker = SyncWorker::new(simulated_cache(), quick());
        assert!(matches!(worker.run_now(true).await, SyncOutcome::NothingToSync));
    }

    #[tokio::test]
    async fn test_pass_resyncs_loaded_scopes_and_reports_progress() {
        let cache = simulated_cache();
        let events = Arc::new(parking_lot::Mutex::new(Vec::<CacheEvent>::new()));
        let sink = events.clone();
        cache.add_listener(move |e| sink.lock().push(e.clone()));

        let datacenter = cache.get_datacenters(true).await.items[0].name.clone();
        cache.get_clusters(&datacenter, true).await;

        let worker = SyncWorker::new(cache.clone(), quick());
        let SyncOutcome::Completed(report) = worker.run_now(true).await else {
            panic!("sync should run");
        };
        assert_eq!(report.steps, 2);
        assert!(report.failures.is_empty());
        assert!(report.error.is_none());

        let status = cache.get_status();
        assert!(status.last_sync.is_some());
        assert!(!status.is_syncing);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let kinds: Vec<EventKind> = events.lock().iter().map(|e| e.kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::SyncProgress).count(), 2);
        assert_eq!(kinds.last(), Some(&EventKind::BackgroundSyncCompleted));
    }

    #[tokio::test]
    async fn test_cooldown_skips_unforced_trigger() {
        let cache = simulated_cache();
        cache.get_datacenters(true).await;
        let worker = SyncWorker::new(cache, quick());

        assert!(matches!(worker.run_now(false).await, SyncOutcome::Completed(_)));
        assert!(matches!(
            worker.run_now(false).await,
            SyncOutcome::CoolingDown { remaining_secs } if remaining_secs <= 60
        ));
        assert!(matches!(worker.run_now(true).await, SyncOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_trigger_during_pass_reports_progress() {
        let cache = simulated_cache();
        cache.get_datacenters(true).await;
        let worker = SyncWorker::new(cache, quick());

        let _running = worker.gate.clone().try_lock_owned().unwrap();
        assert!(matches!(worker.run_now(true).await, SyncOutcome::AlreadyRunning { .. }));
        assert!(matches!(worker.start(true), SyncOutcome::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_scheduled_loop_runs_and_stops() {
        let cache = simulated_cache();
        cache.get_datacenters(true).await;
        let settings = SyncSettings {
            interval: Duration::from_millis(30),
            cooldown: Duration::ZERO,
        };
        let worker = SyncWorker::new(cache.clone(), settings);
        let handle = worker.spawn();

        for _ in 0..100 {
            if cache.get_status().last_sync.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.get_status().last_sync.is_some());
        handle.shutdown(Duration::from_secs(2)).await;
    }
}
