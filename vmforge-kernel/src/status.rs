//! Suivi des chargements : état par (type, clé) et état de la synchro de fond.
//!
//! Clés : "all" pour les datacenters, le nom du datacenter pour les clusters,
//! l'id du cluster pour les ressources d'un cluster.

use crate::models::ResourceKind;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

pub const ALL_DATACENTERS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    NotLoaded,
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KindStatus {
    pub loading: BTreeSet<String>,
    pub loaded_for: BTreeSet<String>,
    pub errors: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub current: Option<String>,
    pub failures: usize,
}

impl SyncProgress {
    pub fn new(total_steps: usize) -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            total_steps,
            completed_steps: 0,
            current: None,
            failures: 0,
        }
    }
}

/// Vue sérialisable renvoyée par `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub scope: String,
    pub simulated: bool,
    pub backend: &'static str,
    pub backend_available: bool,
    pub kinds: BTreeMap<ResourceKind, KindStatus>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    pub is_syncing: bool,
    pub sync_progress: Option<SyncProgress>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct LoadTracker {
    kinds: BTreeMap<ResourceKind, KindStatus>,
    last_sync: Option<OffsetDateTime>,
    sync_progress: Option<SyncProgress>,
    error: Option<String>,
}

impl LoadTracker {
    fn kind_mut(&mut self, kind: ResourceKind) -> &mut KindStatus {
        self.kinds.entry(kind).or_default()
    }

    /// `false` si un chargement est déjà en vol pour cette clé
    pub fn begin(&mut self, kind: ResourceKind, key: &str) -> bool {
        self.kind_mut(kind).loading.insert(key.to_string())
    }

    pub fn succeed(&mut self, kind: ResourceKind, key: &str) {
        let status = self.kind_mut(kind);
        status.loading.remove(key);
        status.errors.remove(key);
        status.loaded_for.insert(key.to_string());
        status.last_update = Some(OffsetDateTime::now_utc());
    }

    pub fn fail(&mut self, kind: ResourceKind, key: &str, error: impl Into<String>) {
        let error = error.into();
        let status = self.kind_mut(kind);
        status.loading.remove(key);
        status.errors.insert(key.to_string(), error.clone());
        self.error = Some(error);
    }

    /// Libère la clé sans changer d'état (chargement abandonné)
    pub fn release(&mut self, kind: ResourceKind, key: &str) {
        self.kind_mut(kind).loading.remove(key);
    }

    pub fn phase(&self, kind: ResourceKind, key: &str) -> LoadPhase {
        let Some(status) = self.kinds.get(&kind) else {
            return LoadPhase::NotLoaded;
        };
        if status.loading.contains(key) {
            LoadPhase::Loading
        } else if status.errors.contains_key(key) {
            LoadPhase::Error
        } else if status.loaded_for.contains(key) {
            LoadPhase::Loaded
        } else {
            LoadPhase::NotLoaded
        }
    }

    /// Dernière erreur de chargement encore active pour cette clé
    pub fn error_for(&self, kind: ResourceKind, key: &str) -> Option<String> {
        self.kinds.get(&kind).and_then(|s| s.errors.get(key).cloned())
    }

    pub fn is_loading(&self, kind: ResourceKind, key: &str) -> bool {
        self.kinds.get(&kind).is_some_and(|s| s.loading.contains(key))
    }

    pub fn loaded_keys(&self, kind: ResourceKind) -> Vec<String> {
        self.kinds
            .get(&kind)
            .map(|s| s.loaded_for.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Oublie les scopes chargés (clear_cache) ; les chargements en vol restent suivis
    pub fn forget(&mut self, kind: Option<ResourceKind>) {
        let kinds: Vec<ResourceKind> = match kind {
            Some(kind) => vec![kind],
            None => ResourceKind::ALL.to_vec(),
        };
        for k in kinds {
            let status = self.kind_mut(k);
            status.loaded_for.clear();
            status.errors.clear();
            status.last_update = None;
        }
        if kind.is_none() {
            self.error = None;
        }
    }

    pub fn sync_started(&mut self, total_steps: usize) {
        self.sync_progress = Some(SyncProgress::new(total_steps));
    }

    pub fn sync_step(&mut self, label: impl Into<String>, failed: bool) -> Option<SyncProgress> {
        let progress = self.sync_progress.as_mut()?;
        progress.completed_steps += 1;
        progress.current = Some(label.into());
        if failed {
            progress.failures += 1;
        }
        Some(progress.clone())
    }

    pub fn sync_finished(&mut self, error: Option<String>) {
        self.sync_progress = None;
        self.last_sync = Some(OffsetDateTime::now_utc());
        self.error = error;
    }

    pub fn sync_progress(&self) -> Option<SyncProgress> {
        self.sync_progress.clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_progress.is_some()
    }

    pub fn last_sync(&self) -> Option<OffsetDateTime> {
        self.last_sync
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub fn snapshot(
        &self,
        scope: &str,
        simulated: bool,
        backend: &'static str,
        backend_available: bool,
    ) -> CacheStatus {
        let mut kinds = self.kinds.clone();
        for kind in ResourceKind::ALL {
            kinds.entry(kind).or_default();
        }
        CacheStatus {
            scope: scope.to_string(),
            simulated,
            backend,
            backend_available,
            kinds,
            last_sync: self.last_sync,
            is_syncing: self.is_syncing(),
            sync_progress: self.sync_progress.clone(),
            error: self.error.clone(),
        }
    }
}
