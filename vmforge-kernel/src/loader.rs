/**
 * LOADER - Orchestrateur hiérarchique du cache d'inventaire vSphere
 *
 * RÔLE :
 * Service unique (construit au démarrage, injecté partout) qui répond aux
 * lectures datacenters → clusters → ressources d'un cluster, en combinant
 * mémoire, cache store, snapshot disque, fetch vCenter et données simulées.
 *
 * FONCTIONNEMENT :
 * - Lecture : mémoire → store → (snapshot déjà chargé en mémoire) → fetch
 * - force=false : frais => réponse immédiate ; sinon chargement en tâche de
 *   fond + réponse "au mieux" (données périmées ou jeu par défaut, loading=true)
 * - force=true : connect → fetch → delta → store → réponse, dans l'appel
 * - Un seul chargement en vol par (type, scope) : coalescer par clé + état
 *   "loading" du LoadTracker
 * - Une session vCenter par passe, réutilisée pour pools/datastores/réseaux ;
 *   les templates (lents) partent dans une tâche séparée qui reçoit la session
 *   et la ferme elle-même
 *
 * UTILITÉ :
 * - Les appelants ne reçoivent jamais d'erreur brute : toujours un `Listing`
 *   étiqueté (source, stale, loading, error)
 */

use crate::coalesce::LoadCoalescer;
use crate::delta::reconcile;
use crate::events::{CacheEvent, EventBus, EventKind, ListenerId};
use crate::fetchers::{self, DatacenterFilter};
use crate::models::{
    CacheEntry, Cluster, ClusterInventory, DataSource, Datacenter, Datastore, Listing, Network,
    Resource, ResourceKind, ResourcePool, Template,
};
use crate::retry::{retry_blocking, RetryPolicy};
use crate::scope::{Credentials, KeySpace, ScopeKey};
use crate::simulation::{self, SimulatedConnector};
use crate::snapshot::{ClusterEntries, InventorySnapshot};
use crate::state::{new_state, Shared};
use crate::status::{CacheStatus, LoadTracker, ALL_DATACENTERS};
use crate::store::CacheStore;
use crate::vcenter::{InventorySession, VCenterConnector, VCenterError};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    VCenter(#[from] VCenterError),
    #[error("inventory worker failed: {0}")]
    Worker(String),
}

impl LoadError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, LoadError::VCenter(e) if e.is_connectivity())
    }
}

/// TTL par type de ressource, en secondes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    pub datacenters: u64,
    pub clusters: u64,
    pub resource_pools: u64,
    pub datastores: u64,
    pub networks: u64,
    pub templates: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            datacenters: 3600,
            clusters: 3600,
            resource_pools: 1800,
            datastores: 900,
            networks: 900,
            templates: 7200,
        }
    }
}

impl TtlPolicy {
    pub fn secs(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Datacenter => self.datacenters,
            ResourceKind::Cluster => self.clusters,
            ResourceKind::ResourcePool => self.resource_pools,
            ResourceKind::Datastore => self.datastores,
            ResourceKind::Network => self.networks,
            ResourceKind::Template => self.templates,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, secs: u64) {
        match kind {
            ResourceKind::Datacenter => self.datacenters = secs,
            ResourceKind::Cluster => self.clusters = secs,
            ResourceKind::ResourcePool => self.resource_pools = secs,
            ResourceKind::Datastore => self.datastores = secs,
            ResourceKind::Network => self.networks = secs,
            ResourceKind::Template => self.templates = secs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InventorySettings {
    pub credentials: Credentials,
    pub datacenter_filter: DatacenterFilter,
    pub connect_timeout: Duration,
    pub connect_retry: RetryPolicy,
    pub ttl: TtlPolicy,
    pub key_prefix: String,
    /// Toujours servir l'inventaire simulé (scope "sim-...")
    pub simulate: bool,
    /// vCenter injoignable => jeu simulé (jamais mis en cache)
    pub simulate_on_failure: bool,
    pub snapshot_path: Option<PathBuf>,
    /// Attente max des tâches templates à l'arrêt
    pub drain_timeout: Duration,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            datacenter_filter: DatacenterFilter::default(),
            connect_timeout: Duration::from_secs(30),
            connect_retry: RetryPolicy::default(),
            ttl: TtlPolicy::default(),
            key_prefix: "vmforge".to_string(),
            simulate: false,
            simulate_on_failure: true,
            snapshot_path: None,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Accès au bon champ de `ClusterEntries` pour un type rattaché à un cluster
pub trait ClusterScoped: Resource {
    fn slot(entries: &ClusterEntries) -> &Option<CacheEntry<Self>>;
    fn slot_mut(entries: &mut ClusterEntries) -> &mut Option<CacheEntry<Self>>;
}

macro_rules! cluster_scoped {
    ($ty:ty, $field:ident) => {
        impl ClusterScoped for $ty {
            fn slot(entries: &ClusterEntries) -> &Option<CacheEntry<Self>> {
                &entries.$field
            }
            fn slot_mut(entries: &mut ClusterEntries) -> &mut Option<CacheEntry<Self>> {
                &mut entries.$field
            }
        }
    };
}

cluster_scoped!(ResourcePool, resource_pools);
cluster_scoped!(Datastore, datastores);
cluster_scoped!(Network, networks);
cluster_scoped!(Template, templates);

/// Session vCenter possédée par une passe de chargement.
/// Les appels passent par le pool bloquant ; la déconnexion aussi, même en cas d'erreur.
pub struct SessionGuard {
    session: Option<Box<dyn InventorySession>>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn InventorySession>) -> Self {
        Self { session: Some(session) }
    }

    pub async fn run<T, F>(&mut self, call: F) -> Result<T, LoadError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn InventorySession) -> Result<T, VCenterError> + Send + 'static,
    {
        let session = self
            .session
            .take()
            .ok_or_else(|| LoadError::Worker("vCenter session already closed".into()))?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = call(session.as_ref());
            (session, result)
        })
        .await
        .map_err(|e| LoadError::Worker(e.to_string()))?;
        self.session = Some(session);
        Ok(result?)
    }

    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || session.disconnect()).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || session.disconnect());
                }
                Err(_) => session.disconnect(),
            }
        }
    }
}

#[derive(Default)]
struct MemoryTier {
    datacenters: Option<CacheEntry<Datacenter>>,
    /// par nom de datacenter
    clusters: HashMap<String, CacheEntry<Cluster>>,
    /// par id de cluster
    resources: HashMap<String, ClusterEntries>,
    cluster_index: HashMap<String, Cluster>,
}

/// Scopes déjà peuplés, rejoués par la synchro de fond
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedScopes {
    pub datacenters: bool,
    pub clusters: Vec<String>,
    pub cluster_resources: Vec<String>,
    pub templates: Vec<String>,
}

impl LoadedScopes {
    pub fn step_count(&self) -> usize {
        usize::from(self.datacenters)
            + self.clusters.len()
            + self.cluster_resources.len()
            + self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }
}

struct Inner {
    settings: InventorySettings,
    connector: Arc<dyn VCenterConnector>,
    store: CacheStore,
    keys: KeySpace,
    simulated: bool,
    memory: Shared<MemoryTier>,
    status: Shared<LoadTracker>,
    coalescer: LoadCoalescer,
    events: EventBus,
    template_tasks: Shared<JoinSet<()>>,
    snapshot_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct InventoryCache {
    inner: Arc<Inner>,
}

fn memory_source<T>(entry: &CacheEntry<T>) -> DataSource {
    if entry.origin == DataSource::Snapshot {
        DataSource::Snapshot
    } else {
        DataSource::Memory
    }
}

/// Remplace seulement par une génération plus récente
fn keep_newest<T>(slot: &mut Option<CacheEntry<T>>, entry: CacheEntry<T>) {
    if slot.as_ref().map_or(true, |current| entry.fetched_at >= current.fetched_at) {
        *slot = Some(entry);
    }
}

fn relabel<T>(mut listing: Listing<T>, source: DataSource) -> Listing<T> {
    listing.source = source;
    listing
}

impl InventoryCache {
    /// À construire dans un runtime tokio (bus d'événements)
    pub fn new(
        settings: InventorySettings,
        connector: Arc<dyn VCenterConnector>,
        store: CacheStore,
    ) -> Self {
        let simulated = settings.simulate;
        let (scope, connector): (ScopeKey, Arc<dyn VCenterConnector>) = if simulated {
            (ScopeKey::simulated(&settings.credentials), Arc::new(SimulatedConnector))
        } else {
            (ScopeKey::derive(&settings.credentials), connector)
        };
        info!(
            scope = %scope,
            connector = connector.name(),
            backend = store.backend_kind(),
            "inventory cache ready"
        );
        let keys = KeySpace::new(settings.key_prefix.clone(), scope);
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                store,
                keys,
                simulated,
                memory: new_state(MemoryTier::default()),
                status: new_state(LoadTracker::default()),
                coalescer: LoadCoalescer::new(),
                events: EventBus::new(),
                template_tasks: new_state(JoinSet::new()),
                snapshot_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        self.inner.keys.scope()
    }

    pub fn is_simulated(&self) -> bool {
        self.inner.simulated
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &InventorySettings {
        &self.inner.settings
    }

    fn live_source(&self) -> DataSource {
        if self.inner.simulated {
            DataSource::Simulated
        } else {
            DataSource::Live
        }
    }

    fn ttl(&self, kind: ResourceKind) -> u64 {
        self.inner.settings.ttl.secs(kind)
    }

    pub(crate) fn emit(&self, kind: EventKind, data: serde_json::Value) {
        self.inner.events.emit(kind, data);
    }

    pub(crate) fn status(&self) -> &Shared<LoadTracker> {
        &self.inner.status
    }

    // ----- abonnements & statut ---------------------------------------------

    pub fn add_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_listener(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    pub fn get_status(&self) -> CacheStatus {
        self.inner.status.lock().snapshot(
            self.scope().as_str(),
            self.inner.simulated,
            self.inner.store.backend_kind(),
            self.inner.store.is_available(),
        )
    }

    // ----- lecture mémoire / store -------------------------------------------

    /// Entrée fraîche en mémoire, sinon celle du store (plus récente ou seule dispo)
    async fn cached<T: Resource>(
        &self,
        memory: Option<CacheEntry<T>>,
        key: &str,
    ) -> Option<(CacheEntry<T>, DataSource)> {
        if let Some(entry) = memory.as_ref().filter(|e| e.is_fresh()) {
            return Some((entry.clone(), memory_source(entry)));
        }
        if let Some(stored) = self.inner.store.get_json::<CacheEntry<T>>(key).await {
            let newer = memory.as_ref().map_or(true, |m| stored.fetched_at > m.fetched_at);
            if stored.is_fresh() || newer {
                return Some((stored, DataSource::Store));
            }
        }
        memory.map(|entry| {
            let source = memory_source(&entry);
            (entry, source)
        })
    }

    async fn cached_datacenters(&self) -> Option<(CacheEntry<Datacenter>, DataSource)> {
        let memory = self.inner.memory.lock().datacenters.clone();
        let key = self.inner.keys.key(ResourceKind::Datacenter, None);
        let found = self.cached(memory, &key).await;
        if let Some((entry, DataSource::Store)) = &found {
            keep_newest(&mut self.inner.memory.lock().datacenters, entry.clone());
        }
        found
    }

    async fn cached_clusters(
        &self,
        datacenter_name: &str,
    ) -> Option<(CacheEntry<Cluster>, DataSource)> {
        let memory = self.inner.memory.lock().clusters.get(datacenter_name).cloned();
        let key = self.inner.keys.key(ResourceKind::Cluster, Some(datacenter_name));
        let found = self.cached(memory, &key).await;
        if let Some((entry, DataSource::Store)) = &found {
            let mut memory = self.inner.memory.lock();
            for cluster in &entry.items {
                memory.cluster_index.insert(cluster.id.clone(), cluster.clone());
            }
            let mut slot = memory.clusters.remove(datacenter_name);
            keep_newest(&mut slot, entry.clone());
            if let Some(slot) = slot {
                memory.clusters.insert(datacenter_name.to_string(), slot);
            }
        }
        found
    }

    async fn cached_slot<T: ClusterScoped>(
        &self,
        cluster_id: &str,
    ) -> Option<(CacheEntry<T>, DataSource)> {
        let memory = self
            .inner
            .memory
            .lock()
            .resources
            .get(cluster_id)
            .and_then(|e| T::slot(e).clone());
        let key = self.inner.keys.key(T::KIND, Some(cluster_id));
        let found = self.cached(memory, &key).await;
        if let Some((entry, DataSource::Store)) = &found {
            let mut memory = self.inner.memory.lock();
            let entries = memory.resources.entry(cluster_id.to_string()).or_default();
            keep_newest(T::slot_mut(entries), entry.clone());
        }
        found
    }

    /// Taille de la génération en mémoire si elle a été produite après `since`
    fn slot_fetched_since<T: ClusterScoped>(
        &self,
        cluster_id: &str,
        since: OffsetDateTime,
    ) -> Option<usize> {
        let memory = self.inner.memory.lock();
        let entry = T::slot(memory.resources.get(cluster_id)?).as_ref()?;
        (entry.fetched_at >= since).then_some(entry.items.len())
    }

    // ----- session & suivi ---------------------------------------------------

    pub(crate) async fn open_session(&self) -> Result<SessionGuard, LoadError> {
        let credentials = self.inner.settings.credentials.clone();
        if !self.inner.simulated && !credentials.is_complete() {
            return Err(VCenterError::Authentication {
                server: credentials.server.clone(),
                username: credentials.username.clone(),
            }
            .into());
        }
        let connector = self.inner.connector.clone();
        let policy = self.inner.settings.connect_retry.clone();
        let timeout = self.inner.settings.connect_timeout;
        let session = tokio::task::spawn_blocking(move || {
            retry_blocking(&policy, VCenterError::is_retryable, |attempt| {
                debug!(server = %credentials.server, attempt, "connecting to vCenter");
                connector.connect(&credentials, timeout)
            })
        })
        .await
        .map_err(|e| LoadError::Worker(e.to_string()))??;
        Ok(SessionGuard::new(session))
    }

    /// Enveloppe un chargement : état loading/loaded/error + événements
    async fn tracked<T, F>(&self, kind: ResourceKind, key: &str, load: F) -> Result<T, LoadError>
    where
        F: Future<Output = Result<T, LoadError>>,
    {
        self.inner.status.lock().begin(kind, key);
        self.emit(EventKind::LoadingStarted, json!({ "type": kind, "key": key }));
        let result = load.await;
        match &result {
            Ok(_) => {
                self.inner.status.lock().succeed(kind, key);
                self.emit(EventKind::LoadingCompleted, json!({ "type": kind, "key": key }));
            }
            Err(e) => {
                warn!(%kind, key, error = %e, "inventory load failed");
                self.inner.status.lock().fail(kind, key, e.to_string());
                self.emit(
                    EventKind::LoadingError,
                    json!({ "type": kind, "key": key, "error": e.to_string() }),
                );
            }
        }
        result
    }

    /// Réconcilie, écrit la nouvelle génération (+ delta) dans le store, renvoie l'entrée
    async fn commit<T: Resource>(
        &self,
        qualifier: Option<&str>,
        existing: Option<&CacheEntry<T>>,
        incoming: Vec<T>,
    ) -> CacheEntry<T> {
        let previous: &[T] = existing.map(|e| e.items.as_slice()).unwrap_or(&[]);
        let reconciliation = reconcile(previous, incoming);
        let ttl = self.ttl(T::KIND);
        let entry = CacheEntry::new(reconciliation.merged.clone(), ttl, self.live_source());

        let key = self.inner.keys.key(T::KIND, qualifier);
        let expiry = Duration::from_secs(ttl);
        if !self.inner.store.set_json(&key, &entry, expiry).await {
            debug!(key, "cache store write skipped, memory stays authoritative");
        }
        let delta = reconciliation.metadata(T::KIND, qualifier);
        self.inner
            .store
            .set_json(&self.inner.keys.delta_key(T::KIND, qualifier), &delta, expiry)
            .await;
        if reconciliation.has_changes() {
            info!(
                kind = %T::KIND,
                qualifier = qualifier.unwrap_or("-"),
                added = delta.added_count,
                removed = delta.removed_count,
                updated = delta.updated_count,
                "inventory changed"
            );
        }
        entry
    }

    // ----- datacenters -------------------------------------------------------

    pub async fn get_datacenters(&self, force: bool) -> Listing<Datacenter> {
        if !force {
            if let Some((entry, source)) = self.cached_datacenters().await {
                if entry.is_fresh() {
                    return Listing::from_entry(&entry, source);
                }
                self.spawn_datacenters_load();
                return Listing::from_entry(&entry, source).loading(true);
            }
            self.spawn_datacenters_load();
            return relabel(simulation::default_datacenters(), DataSource::Placeholder)
                .loading(true);
        }

        match self.load_datacenters().await {
            Ok(entry) => Listing::from_entry(&entry, self.live_source()),
            Err(e) => match self.cached_datacenters().await {
                Some((entry, source)) => {
                    Listing::from_entry(&entry, source).with_error(e.to_string())
                }
                None => self.fallback(simulation::default_datacenters(), &e),
            },
        }
    }

    /// Jeu par défaut quand rien n'est disponible : simulé si la politique le permet
    fn fallback<T: Resource>(&self, defaults: Listing<T>, error: &LoadError) -> Listing<T> {
        let source = if self.inner.settings.simulate_on_failure && error.is_connectivity() {
            DataSource::Simulated
        } else {
            DataSource::Placeholder
        };
        relabel(defaults, source).with_error(error.to_string())
    }

    fn spawn_datacenters_load(&self) {
        if !self.inner.status.lock().begin(ResourceKind::Datacenter, ALL_DATACENTERS) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.load_datacenters().await;
        });
    }

    async fn load_datacenters(&self) -> Result<CacheEntry<Datacenter>, LoadError> {
        self.tracked(ResourceKind::Datacenter, ALL_DATACENTERS, async {
            let started = OffsetDateTime::now_utc();
            let _turn = self.inner.coalescer.acquire(ResourceKind::Datacenter.as_str()).await;
            let current = self.inner.memory.lock().datacenters.clone();
            if let Some(entry) = current.filter(|e| e.fetched_at >= started) {
                return Ok(entry);
            }
            let mut session = self.open_session().await?;
            let entry = self.refresh_datacenters(&mut session).await;
            session.close().await;
            if entry.is_ok() {
                self.persist_in_background();
            }
            entry
        })
        .await
    }

    async fn refresh_datacenters(
        &self,
        session: &mut SessionGuard,
    ) -> Result<CacheEntry<Datacenter>, LoadError> {
        let filter = self.inner.settings.datacenter_filter.clone();
        let incoming = session.run(move |s| fetchers::fetch_datacenters(s, &filter)).await?;
        let existing = self.cached_datacenters().await.map(|(e, _)| e);
        let entry = self.commit(None, existing.as_ref(), incoming).await;
        self.inner.memory.lock().datacenters = Some(entry.clone());
        Ok(entry)
    }

    /// `since` : début de la passe ; une génération plus récente est réutilisée telle quelle
    pub(crate) async fn sync_datacenters(
        &self,
        session: &mut SessionGuard,
        since: OffsetDateTime,
    ) -> Result<usize, LoadError> {
        self.tracked(ResourceKind::Datacenter, ALL_DATACENTERS, async {
            let _turn = self.inner.coalescer.acquire(ResourceKind::Datacenter.as_str()).await;
            let current = self.inner.memory.lock().datacenters.clone();
            if let Some(entry) = current.filter(|e| e.fetched_at >= since) {
                return Ok(entry.items.len());
            }
            Ok(self.refresh_datacenters(session).await?.items.len())
        })
        .await
    }

    // ----- clusters ----------------------------------------------------------

    pub async fn get_clusters(&self, datacenter_name: &str, force: bool) -> Listing<Cluster> {
        let canonical = self.canonical_datacenter(datacenter_name).await;
        let datacenter_name = canonical.as_str();
        if !force {
            if let Some((entry, source)) = self.cached_clusters(datacenter_name).await {
                if entry.is_fresh() {
                    return Listing::from_entry(&entry, source);
                }
                self.spawn_clusters_load(datacenter_name);
                return Listing::from_entry(&entry, source).loading(true);
            }
            self.spawn_clusters_load(datacenter_name);
            return relabel(simulation::default_clusters(datacenter_name), DataSource::Placeholder)
                .loading(true);
        }

        match self.load_clusters(datacenter_name).await {
            Ok(entry) => Listing::from_entry(&entry, self.live_source()),
            Err(e) => match self.cached_clusters(datacenter_name).await {
                Some((entry, source)) => {
                    Listing::from_entry(&entry, source).with_error(e.to_string())
                }
                None => self.fallback(simulation::default_clusters(datacenter_name), &e),
            },
        }
    }

    /// Nom exact d'un datacenter connu (comparaison insensible à la casse) :
    /// clés mémoire, store et statut utilisent toutes cette forme
    async fn canonical_datacenter(&self, name: &str) -> String {
        let name = name.trim();
        self.cached_datacenters()
            .await
            .and_then(|(entry, _)| {
                entry.items.into_iter().find(|dc| dc.name.eq_ignore_ascii_case(name))
            })
            .map_or_else(|| name.to_string(), |dc| dc.name)
    }

    fn spawn_clusters_load(&self, datacenter_name: &str) {
        if !self.inner.status.lock().begin(ResourceKind::Cluster, datacenter_name) {
            return;
        }
        let this = self.clone();
        let name = datacenter_name.to_string();
        tokio::spawn(async move {
            let _ = this.load_clusters(&name).await;
        });
    }

    async fn load_clusters(&self, datacenter_name: &str) -> Result<CacheEntry<Cluster>, LoadError> {
        self.tracked(ResourceKind::Cluster, datacenter_name, async {
            let started = OffsetDateTime::now_utc();
            let _turn = self.inner.coalescer.acquire(&format!("clusters:{datacenter_name}")).await;
            let current = self.inner.memory.lock().clusters.get(datacenter_name).cloned();
            if let Some(entry) = current.filter(|e| e.fetched_at >= started) {
                return Ok(entry);
            }
            let mut session = self.open_session().await?;
            let entry = self.refresh_clusters(&mut session, datacenter_name).await;
            session.close().await;
            if entry.is_ok() {
                self.persist_in_background();
            }
            entry
        })
        .await
    }

    async fn resolve_datacenter(
        &self,
        session: &mut SessionGuard,
        name: &str,
    ) -> Result<Datacenter, LoadError> {
        let matches = |dc: &Datacenter| dc.name.eq_ignore_ascii_case(name);
        if let Some((entry, _)) = self.cached_datacenters().await {
            if let Some(dc) = entry.items.iter().find(|dc| matches(dc)) {
                return Ok(dc.clone());
            }
        }
        let filter = self.inner.settings.datacenter_filter.clone();
        let datacenters = session.run(move |s| fetchers::fetch_datacenters(s, &filter)).await?;
        datacenters
            .into_iter()
            .find(|dc| matches(dc))
            .ok_or_else(|| VCenterError::NotFound(format!("datacenter {name}")).into())
    }

    async fn refresh_clusters(
        &self,
        session: &mut SessionGuard,
        datacenter_name: &str,
    ) -> Result<CacheEntry<Cluster>, LoadError> {
        let datacenter = self.resolve_datacenter(session, datacenter_name).await?;
        let incoming = session.run(move |s| fetchers::fetch_clusters(s, &datacenter)).await?;
        let existing = self.cached_clusters(datacenter_name).await.map(|(e, _)| e);
        let entry = self.commit(Some(datacenter_name), existing.as_ref(), incoming).await;

        let mut memory = self.inner.memory.lock();
        for cluster in &entry.items {
            memory.cluster_index.insert(cluster.id.clone(), cluster.clone());
        }
        memory.clusters.insert(datacenter_name.to_string(), entry.clone());
        Ok(entry)
    }

    pub(crate) async fn sync_clusters(
        &self,
        session: &mut SessionGuard,
        datacenter_name: &str,
        since: OffsetDateTime,
    ) -> Result<usize, LoadError> {
        self.tracked(ResourceKind::Cluster, datacenter_name, async {
            let _turn = self.inner.coalescer.acquire(&format!("clusters:{datacenter_name}")).await;
            let current = self.inner.memory.lock().clusters.get(datacenter_name).cloned();
            if let Some(entry) = current.filter(|e| e.fetched_at >= since) {
                return Ok(entry.items.len());
            }
            Ok(self.refresh_clusters(session, datacenter_name).await?.items.len())
        })
        .await
    }

    // ----- ressources d'un cluster -------------------------------------------

    pub async fn get_resources(
        &self,
        cluster_id: &str,
        cluster_name: Option<&str>,
        force: bool,
    ) -> ClusterInventory {
        if force {
            return match self.load_cluster(cluster_id, cluster_name).await {
                Ok(_) => self.assemble_inventory(cluster_id, cluster_name, None).await,
                Err(e) => {
                    let inventory =
                        self.assemble_inventory(cluster_id, cluster_name, Some(&e)).await;
                    if inventory.datastores.source == DataSource::Placeholder {
                        self.fallback_inventory(cluster_id, cluster_name, &e)
                    } else {
                        inventory
                    }
                }
            };
        }

        let pools = self.cached_slot::<ResourcePool>(cluster_id).await;
        let datastores = self.cached_slot::<Datastore>(cluster_id).await;
        let networks = self.cached_slot::<Network>(cluster_id).await;
        let templates = self.cached_slot::<Template>(cluster_id).await;

        let trio_fresh = pools.as_ref().is_some_and(|(e, _)| e.is_fresh())
            && datastores.as_ref().is_some_and(|(e, _)| e.is_fresh())
            && networks.as_ref().is_some_and(|(e, _)| e.is_fresh());
        let templates_fresh = templates.as_ref().is_some_and(|(e, _)| e.is_fresh());

        if !trio_fresh {
            self.spawn_cluster_load(cluster_id, cluster_name);
        } else if !templates_fresh {
            self.spawn_templates_load(cluster_id, cluster_name);
        }
        self.assemble_inventory(cluster_id, cluster_name, None).await
    }

    fn cluster_name_for(&self, cluster_id: &str, given: Option<&str>) -> Option<String> {
        self.inner
            .memory
            .lock()
            .cluster_index
            .get(cluster_id)
            .map(|c| c.name.clone())
            .or_else(|| given.map(str::to_string))
    }

    /// Vue courante d'un cluster ; les types absents sont remplacés par le jeu par défaut
    async fn assemble_inventory(
        &self,
        cluster_id: &str,
        cluster_name: Option<&str>,
        error: Option<&LoadError>,
    ) -> ClusterInventory {
        let mut defaults: Option<ClusterInventory> = None;
        let mut default_for = || -> ClusterInventory {
            defaults
                .get_or_insert_with(|| simulation::default_resources(cluster_id, cluster_name))
                .clone()
        };
        // erreur globale du chargement, sinon dernière erreur propre à chaque type
        let error = error.map(|e| e.to_string());
        let [pools_state, datastores_state, networks_state, templates_state] = {
            let status = self.inner.status.lock();
            let states = ResourceKind::CLUSTER_SCOPED.map(|kind| {
                let failure = error.clone().or_else(|| status.error_for(kind, cluster_id));
                (status.is_loading(kind, cluster_id), failure)
            });
            states
        };
        fn finish<T: Resource>(
            listing: Listing<T>,
            (loading, error): (bool, Option<String>),
        ) -> Listing<T> {
            let listing = listing.loading(loading);
            match error {
                Some(e) => listing.with_error(e),
                None => listing,
            }
        }

        let resource_pools = match self.cached_slot::<ResourcePool>(cluster_id).await {
            Some((entry, source)) => Listing::from_entry(&entry, source),
            None => relabel(default_for().resource_pools, DataSource::Placeholder),
        };
        let datastores = match self.cached_slot::<Datastore>(cluster_id).await {
            Some((entry, source)) => Listing::from_entry(&entry, source),
            None => relabel(default_for().datastores, DataSource::Placeholder),
        };
        let networks = match self.cached_slot::<Network>(cluster_id).await {
            Some((entry, source)) => Listing::from_entry(&entry, source),
            None => relabel(default_for().networks, DataSource::Placeholder),
        };
        let cached_templates = self.cached_slot::<Template>(cluster_id).await;
        let placeholder_templates = cached_templates.is_none();
        let templates = match cached_templates {
            Some((entry, source)) => Listing::from_entry(&entry, source),
            None => {
                let datacenter_id = self
                    .inner
                    .memory
                    .lock()
                    .cluster_index
                    .get(cluster_id)
                    .map(|c| c.datacenter_id.clone())
                    .unwrap_or_default();
                Listing::placeholder(vec![Template::loading_placeholder(&datacenter_id)])
            }
        };

        ClusterInventory {
            cluster_id: cluster_id.to_string(),
            cluster_name: self.cluster_name_for(cluster_id, cluster_name),
            resource_pools: finish(resource_pools, pools_state),
            datastores: finish(datastores, datastores_state),
            networks: finish(networks, networks_state),
            templates: finish(
                templates,
                (templates_state.0 || placeholder_templates, templates_state.1),
            ),
        }
    }

    fn fallback_inventory(
        &self,
        cluster_id: &str,
        cluster_name: Option<&str>,
        error: &LoadError,
    ) -> ClusterInventory {
        let defaults = simulation::default_resources(cluster_id, cluster_name);
        ClusterInventory {
            cluster_id: defaults.cluster_id,
            cluster_name: defaults.cluster_name,
            resource_pools: self.fallback(defaults.resource_pools, error),
            datastores: self.fallback(defaults.datastores, error),
            networks: self.fallback(defaults.networks, error),
            templates: self.fallback(defaults.templates, error),
        }
    }

    fn spawn_cluster_load(&self, cluster_id: &str, cluster_name: Option<&str>) {
        if !self.inner.status.lock().begin(ResourceKind::Datastore, cluster_id) {
            return;
        }
        let this = self.clone();
        let id = cluster_id.to_string();
        let name = cluster_name.map(str::to_string);
        tokio::spawn(async move {
            let _ = this.load_cluster(&id, name.as_deref()).await;
        });
    }

    async fn resolve_cluster(
        &self,
        session: &mut SessionGuard,
        cluster_id: &str,
        cluster_name: Option<&str>,
    ) -> Result<Cluster, LoadError> {
        if let Some(cluster) = self.inner.memory.lock().cluster_index.get(cluster_id).cloned() {
            return Ok(cluster);
        }
        let cluster = if self.inner.simulated {
            simulation::resolve_cluster(cluster_id, cluster_name)
        } else {
            let filter = self.inner.settings.datacenter_filter.clone();
            let id = cluster_id.to_string();
            session.run(move |s| fetchers::locate_cluster(s, &id, &filter)).await?
        };
        self.inner
            .memory
            .lock()
            .cluster_index
            .insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    /// Pools, datastores et réseaux sur une même session, puis templates en tâche séparée
    async fn load_cluster(
        &self,
        cluster_id: &str,
        cluster_name: Option<&str>,
    ) -> Result<(), LoadError> {
        const TRIO: [ResourceKind; 3] =
            [ResourceKind::ResourcePool, ResourceKind::Datastore, ResourceKind::Network];
        {
            let mut status = self.inner.status.lock();
            for kind in TRIO {
                status.begin(kind, cluster_id);
            }
        }
        for kind in TRIO {
            self.emit(EventKind::LoadingStarted, json!({ "type": kind, "key": cluster_id }));
        }

        let started = OffsetDateTime::now_utc();
        let outcome: Result<Option<(SessionGuard, Cluster)>, LoadError> = async {
            let _turn = self.inner.coalescer.acquire(&format!("resources:{cluster_id}")).await;
            if self.slot_fetched_since::<Datastore>(cluster_id, started).is_some() {
                let mut status = self.inner.status.lock();
                for kind in TRIO {
                    status.succeed(kind, cluster_id);
                }
                return Ok(None);
            }
            let mut session = self.open_session().await?;
            let cluster = self.resolve_cluster(&mut session, cluster_id, cluster_name).await?;
            self.refresh_cluster(&mut session, &cluster).await?;
            Ok(Some((session, cluster)))
        }
        .await;

        match outcome {
            Ok(handoff) => {
                if let Some((session, cluster)) = handoff {
                    self.spawn_templates_with(session, cluster);
                    self.persist_in_background();
                }
                for kind in TRIO {
                    self.emit(
                        EventKind::LoadingCompleted,
                        json!({ "type": kind, "key": cluster_id }),
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!(cluster = cluster_id, error = %e, "cluster resources load failed");
                {
                    let mut status = self.inner.status.lock();
                    for kind in TRIO {
                        status.fail(kind, cluster_id, e.to_string());
                    }
                }
                for kind in TRIO {
                    self.emit(
                        EventKind::LoadingError,
                        json!({ "type": kind, "key": cluster_id, "error": e.to_string() }),
                    );
                }
                Err(e)
            }
        }
    }

    async fn refresh_slot<T, F>(
        &self,
        session: &mut SessionGuard,
        cluster: &Cluster,
        fetch: F,
    ) -> Result<usize, LoadError>
    where
        T: ClusterScoped,
        F: FnOnce(&dyn InventorySession, &Cluster) -> Result<Vec<T>, VCenterError> + Send + 'static,
    {
        let target = cluster.clone();
        let incoming = session.run(move |s| fetch(s, &target)).await?;
        let existing = self.cached_slot::<T>(&cluster.id).await.map(|(e, _)| e);
        let entry = self.commit(Some(&cluster.id), existing.as_ref(), incoming).await;
        let count = entry.items.len();

        let mut memory = self.inner.memory.lock();
        let entries = memory.resources.entry(cluster.id.clone()).or_default();
        entries.cluster = Some(cluster.clone());
        *T::slot_mut(entries) = Some(entry);
        Ok(count)
    }

    /// Échec partiel : un type en erreur garde sa génération précédente.
    /// Erreur seulement si les trois types ont échoué.
    async fn refresh_cluster(
        &self,
        session: &mut SessionGuard,
        cluster: &Cluster,
    ) -> Result<(), LoadError> {
        let pools = self
            .refresh_slot::<ResourcePool, _>(session, cluster, |s, c| {
                fetchers::fetch_resource_pools(s, c)
            })
            .await;
        let datastores = self
            .refresh_slot::<Datastore, _>(session, cluster, |s, c| fetchers::fetch_datastores(s, c))
            .await;
        let networks = self
            .refresh_slot::<Network, _>(session, cluster, |s, c| fetchers::fetch_networks(s, c))
            .await;
        let results = [
            (ResourceKind::ResourcePool, pools),
            (ResourceKind::Datastore, datastores),
            (ResourceKind::Network, networks),
        ];

        let mut first_error = None;
        let mut succeeded = 0;
        {
            let mut status = self.inner.status.lock();
            for (kind, result) in &results {
                match result {
                    Ok(count) => {
                        debug!(
                            cluster = %cluster.name,
                            %kind,
                            count,
                            "cluster resources refreshed"
                        );
                        status.succeed(*kind, &cluster.id);
                        succeeded += 1;
                    }
                    Err(e) => {
                        warn!(
                            cluster = %cluster.name,
                            %kind,
                            error = %e,
                            "keeping previous generation"
                        );
                        status.fail(*kind, &cluster.id, e.to_string());
                        first_error.get_or_insert_with(|| e.clone());
                    }
                }
            }
        }
        match first_error {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(()),
        }
    }

    pub(crate) async fn sync_cluster(
        &self,
        session: &mut SessionGuard,
        cluster_id: &str,
        since: OffsetDateTime,
    ) -> Result<Cluster, LoadError> {
        let _turn = self.inner.coalescer.acquire(&format!("resources:{cluster_id}")).await;
        let cluster = self.resolve_cluster(session, cluster_id, None).await?;
        if self.slot_fetched_since::<Datastore>(cluster_id, since).is_some() {
            debug!(cluster = cluster_id, "resources refreshed meanwhile, skipping fetch");
            return Ok(cluster);
        }
        self.refresh_cluster(session, &cluster).await?;
        Ok(cluster)
    }

    // ----- templates ---------------------------------------------------------

    async fn refresh_templates(
        &self,
        session: &mut SessionGuard,
        cluster: &Cluster,
        since: OffsetDateTime,
    ) -> Result<usize, LoadError> {
        let _turn = self.inner.coalescer.acquire(&format!("templates:{}", cluster.id)).await;
        if let Some(count) = self.slot_fetched_since::<Template>(&cluster.id, since) {
            return Ok(count);
        }
        let datacenter_id = cluster.datacenter_id.clone();
        self.refresh_slot::<Template, _>(session, cluster, move |s, _| {
            fetchers::fetch_templates(s, &datacenter_id)
        })
        .await
    }

    pub(crate) async fn sync_templates(
        &self,
        session: &mut SessionGuard,
        cluster: &Cluster,
        since: OffsetDateTime,
    ) -> Result<usize, LoadError> {
        let refresh = self.refresh_templates(session, cluster, since);
        self.tracked(ResourceKind::Template, &cluster.id, refresh)
            .await
    }

    pub(crate) async fn sync_templates_for(
        &self,
        session: &mut SessionGuard,
        cluster_id: &str,
        since: OffsetDateTime,
    ) -> Result<usize, LoadError> {
        let cluster = self.resolve_cluster(session, cluster_id, None).await?;
        self.sync_templates(session, &cluster, since).await
    }

    /// La tâche reçoit la session : c'est elle qui la ferme
    fn spawn_templates_with(&self, session: SessionGuard, cluster: Cluster) {
        if !self.inner.status.lock().begin(ResourceKind::Template, &cluster.id) {
            return;
        }
        let this = self.clone();
        let mut tasks = self.inner.template_tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let mut session = session;
            let since = OffsetDateTime::now_utc();
            let loaded = this.sync_templates(&mut session, &cluster, since).await;
            session.close().await;
            if loaded.is_ok() {
                this.save_snapshot().await;
            }
        });
    }

    fn spawn_templates_load(&self, cluster_id: &str, cluster_name: Option<&str>) {
        if !self.inner.status.lock().begin(ResourceKind::Template, cluster_id) {
            return;
        }
        let this = self.clone();
        let id = cluster_id.to_string();
        let name = cluster_name.map(str::to_string);
        let mut tasks = self.inner.template_tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let started = OffsetDateTime::now_utc();
            let loaded = this
                .tracked(ResourceKind::Template, &id, async {
                    let mut session = this.open_session().await?;
                    let cluster = this.resolve_cluster(&mut session, &id, name.as_deref()).await?;
                    let count = this.refresh_templates(&mut session, &cluster, started).await;
                    session.close().await;
                    count
                })
                .await;
            if let Ok(count) = loaded {
                debug!(cluster = %id, count, "templates backfilled");
                this.save_snapshot().await;
            }
        });
    }

    // ----- administration ----------------------------------------------------

    /// Scopes peuplés, pour la synchro de fond
    pub fn loaded_scopes(&self) -> LoadedScopes {
        let status = self.inner.status.lock();
        let clusters_loaded = |kind| status.loaded_keys(kind);
        let mut cluster_resources = clusters_loaded(ResourceKind::Datastore);
        for kind in [ResourceKind::ResourcePool, ResourceKind::Network] {
            for id in clusters_loaded(kind) {
                if !cluster_resources.contains(&id) {
                    cluster_resources.push(id);
                }
            }
        }
        cluster_resources.sort();
        LoadedScopes {
            datacenters: !status.loaded_keys(ResourceKind::Datacenter).is_empty(),
            clusters: status.loaded_keys(ResourceKind::Cluster),
            cluster_resources,
            templates: status.loaded_keys(ResourceKind::Template),
        }
    }

    /// Supprime store + mémoire pour un type (ou tout le scope)
    pub async fn clear_cache(&self, kind: Option<ResourceKind>) -> usize {
        let removed = self.inner.store.delete_matching(&self.inner.keys.pattern(kind)).await;
        {
            let mut memory = self.inner.memory.lock();
            match kind {
                None => *memory = MemoryTier::default(),
                Some(ResourceKind::Datacenter) => memory.datacenters = None,
                Some(ResourceKind::Cluster) => {
                    memory.clusters.clear();
                    memory.cluster_index.clear();
                }
                Some(ResourceKind::ResourcePool) => {
                    memory.resources.values_mut().for_each(|e| e.resource_pools = None)
                }
                Some(ResourceKind::Datastore) => {
                    memory.resources.values_mut().for_each(|e| e.datastores = None)
                }
                Some(ResourceKind::Network) => {
                    memory.resources.values_mut().for_each(|e| e.networks = None)
                }
                Some(ResourceKind::Template) => {
                    memory.resources.values_mut().for_each(|e| e.templates = None)
                }
            }
            memory.resources.retain(|_, e| !e.is_empty());
        }
        self.inner.status.lock().forget(kind);
        if kind.is_none() {
            if let Some(path) = &self.inner.settings.snapshot_path {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "cannot remove inventory snapshot"
                        );
                    }
                }
            }
        }
        let label = kind.map_or("all", |k| k.name());
        info!(kind = label, removed, "inventory cache cleared");
        self.emit(EventKind::CacheCleared, json!({ "type": label, "removed_keys": removed }));
        removed
    }

    /// Marque périmé sans perdre les données : la prochaine lecture relance un chargement
    pub async fn invalidate(&self, kind: Option<ResourceKind>) -> usize {
        let removed = self.inner.store.delete_matching(&self.inner.keys.pattern(kind)).await;
        let wants = |k: ResourceKind| kind.map_or(true, |wanted| wanted == k);
        let mut expired = 0;
        {
            let mut memory = self.inner.memory.lock();
            if wants(ResourceKind::Datacenter) {
                if let Some(entry) = memory.datacenters.as_mut() {
                    entry.expire();
                    expired += 1;
                }
            }
            if wants(ResourceKind::Cluster) {
                for entry in memory.clusters.values_mut() {
                    entry.expire();
                    expired += 1;
                }
            }
            for entries in memory.resources.values_mut() {
                if wants(ResourceKind::ResourcePool) {
                    expired +=
                        entries.resource_pools.as_mut().map(|e| e.expire()).is_some() as usize;
                }
                if wants(ResourceKind::Datastore) {
                    expired += entries.datastores.as_mut().map(|e| e.expire()).is_some() as usize;
                }
                if wants(ResourceKind::Network) {
                    expired += entries.networks.as_mut().map(|e| e.expire()).is_some() as usize;
                }
                if wants(ResourceKind::Template) {
                    expired += entries.templates.as_mut().map(|e| e.expire()).is_some() as usize;
                }
            }
        }
        let label = kind.map_or("all", |k| k.name());
        info!(kind = label, expired, removed, "inventory cache invalidated");
        expired
    }

    // ----- snapshot ----------------------------------------------------------

    fn build_snapshot(&self) -> InventorySnapshot {
        let memory = self.inner.memory.lock();
        let mut snapshot = InventorySnapshot::new(self.scope().as_str());
        snapshot.datacenters = memory.datacenters.clone();
        snapshot.clusters_by_datacenter =
            memory.clusters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        snapshot.resources_by_cluster = memory
            .resources
            .iter()
            .filter(|(_, e)| !e.is_empty())
            .map(|(id, entries)| {
                let mut entries = entries.clone();
                if entries.cluster.is_none() {
                    entries.cluster = memory.cluster_index.get(id).cloned();
                }
                (id.clone(), entries)
            })
            .collect();
        snapshot
    }

    fn persist_in_background(&self) {
        if self.inner.settings.snapshot_path.is_none() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.save_snapshot().await;
        });
    }

    pub async fn save_snapshot(&self) -> bool {
        let Some(path) = self.inner.settings.snapshot_path.clone() else {
            return false;
        };
        let _turn = self.inner.snapshot_lock.lock().await;
        let snapshot = self.build_snapshot();
        if snapshot.is_empty() {
            return false;
        }
        match snapshot.save(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "inventory snapshot written");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot write inventory snapshot");
                false
            }
        }
    }

    /// Démarrage à chaud depuis le snapshot si le store est vide ou injoignable
    pub async fn warm_start(&self) -> bool {
        let Some(path) = self.inner.settings.snapshot_path.clone() else {
            return false;
        };
        let datacenters_key = self.inner.keys.key(ResourceKind::Datacenter, None);
        if self.inner.store.is_available() && self.inner.store.exists(&datacenters_key).await {
            debug!("cache store already populated, snapshot not needed");
            return false;
        }
        let snapshot = match InventorySnapshot::load(&path).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable inventory snapshot");
                return false;
            }
        };
        if snapshot.scope != self.scope().as_str() {
            info!(path = %path.display(), "snapshot belongs to another scope, ignored");
            return false;
        }

        fn mark<T>(entry: &mut Option<CacheEntry<T>>) {
            if let Some(e) = entry.as_mut() {
                e.origin = DataSource::Snapshot;
            }
        }

        let mut loaded: Vec<(ResourceKind, String)> = Vec::new();
        let (datacenters, clusters) = {
            let mut memory = self.inner.memory.lock();
            let mut dcs = snapshot.datacenters;
            mark(&mut dcs);
            if dcs.is_some() {
                loaded.push((ResourceKind::Datacenter, ALL_DATACENTERS.to_string()));
            }
            memory.datacenters = dcs;
            for (name, mut entry) in snapshot.clusters_by_datacenter {
                entry.origin = DataSource::Snapshot;
                for cluster in &entry.items {
                    memory.cluster_index.insert(cluster.id.clone(), cluster.clone());
                }
                loaded.push((ResourceKind::Cluster, name.clone()));
                memory.clusters.insert(name, entry);
            }
            for (id, mut entries) in snapshot.resources_by_cluster {
                mark(&mut entries.resource_pools);
                mark(&mut entries.datastores);
                mark(&mut entries.networks);
                mark(&mut entries.templates);
                for kind in ResourceKind::CLUSTER_SCOPED {
                    let present = match kind {
                        ResourceKind::ResourcePool => entries.resource_pools.is_some(),
                        ResourceKind::Datastore => entries.datastores.is_some(),
                        ResourceKind::Network => entries.networks.is_some(),
                        _ => entries.templates.is_some(),
                    };
                    if present {
                        loaded.push((kind, id.clone()));
                    }
                }
                if let Some(cluster) = entries.cluster.clone() {
                    memory.cluster_index.insert(id.clone(), cluster);
                }
                memory.resources.insert(id, entries);
            }
            (
                memory.datacenters.as_ref().map_or(0, |e| e.items.len()),
                memory.resources.len(),
            )
        };
        {
            let mut status = self.inner.status.lock();
            for (kind, key) in &loaded {
                status.succeed(*kind, key);
            }
        }
        info!(datacenters, clusters, "inventory warm-started from snapshot");
        self.emit(
            EventKind::CacheLoadedFromDisk,
            json!({
                "path": path.display().to_string(),
                "datacenters": datacenters,
                "clusters": clusters,
            }),
        );
        true
    }

    /// Attend les tâches templates (borné) puis écrit un dernier snapshot
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.inner.template_tasks.lock());
        let pending = tasks.len();
        let drained = tokio::time::timeout(self.inner.settings.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending, "template tasks still running at shutdown, aborting");
            tasks.abort_all();
        }
        self.save_snapshot().await;
        info!("inventory cache stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcenter::{
        RawCluster, RawDatacenter, RawDatastore, RawHost, RawNetwork, RawResourcePool, RawTemplate,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Simulateur instrumenté : compte les énumérations de datacenters
    #[derive(Clone, Default)]
    struct Counting {
        datacenter_calls: Arc<AtomicU32>,
        fail: Arc<std::sync::atomic::AtomicBool>,
        slow: Arc<std::sync::atomic::AtomicBool>,
    }

    struct CountingSession {
        inner: crate::simulation::SimulatedSession,
        calls: Arc<AtomicU32>,
        slow: bool,
    }

    impl InventorySession for CountingSession {
        fn datacenters(&self) -> Result<Vec<RawDatacenter>, VCenterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(if self.slow { 400 } else { 30 }));
            self.inner.datacenters()
        }
        fn clusters(&self, dc: &str) -> Result<Vec<RawCluster>, VCenterError> {
            self.inner.clusters(dc)
        }
        fn hosts(&self, c: &str) -> Result<Vec<RawHost>, VCenterError> {
            self.inner.hosts(c)
        }
        fn resource_pools(&self, c: &str) -> Result<Vec<RawResourcePool>, VCenterError> {
            self.inner.resource_pools(c)
        }
        fn datastores(&self, dc: &str) -> Result<Vec<RawDatastore>, VCenterError> {
            self.inner.datastores(dc)
        }
        fn networks(&self, dc: &str) -> Result<Vec<RawNetwork>, VCenterError> {
            self.inner.networks(dc)
        }
        fn templates(&self, dc: &str) -> Result<Vec<RawTemplate>, VCenterError> {
            self.inner.templates(dc)
        }
        fn disconnect(self: Box<Self>) {}
    }

    impl VCenterConnector for Counting {
        fn connect(
            &self,
            credentials: &Credentials,
            _timeout: Duration,
        ) -> Result<Box<dyn InventorySession>, VCenterError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(VCenterError::Connection {
                    server: credentials.server.clone(),
                    message: "connection refused".into(),
                });
            }
            Ok(Box::new(CountingSession {
                inner: crate::simulation::SimulatedSession,
                calls: self.datacenter_calls.clone(),
                slow: self.slow.load(Ordering::SeqCst),
            }))
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn settings() -> InventorySettings {
        InventorySettings {
            credentials: Credentials::new("vcenter.test", "admin", "secret"),
            connect_retry: RetryPolicy::no_retry(),
            ..InventorySettings::default()
        }
    }

    fn cache(connector: &Counting) -> InventoryCache {
        InventoryCache::new(settings(), Arc::new(connector.clone()), CacheStore::memory())
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_forced_load_goes_live_then_serves_memory() {
        let connector = Counting::default();
        let cache = cache(&connector);

        let live = cache.get_datacenters(true).await;
        assert_eq!(live.source, DataSource::Live);
        assert_eq!(live.items.len(), 2);

        let cached = cache.get_datacenters(false).await;
        assert_eq!(cached.source, DataSource::Memory);
        assert!(!cached.stale);
        assert_eq!(connector.datacenter_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_forced_loads_fetch_once() {
        let connector = Counting::default();
        let cache = cache(&connector);

        let (a, b) = tokio::join!(cache.get_datacenters(true), cache.get_datacenters(true));
        assert_eq!(a.items, b.items);
        assert_eq!(connector.datacenter_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_waiting_behind_a_user_load_reuses_its_result() {
        let connector = Counting::default();
        connector.slow.store(true, Ordering::SeqCst);
        let cache = cache(&connector);

        let user = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_datacenters(true).await })
        };
        let calls = connector.datacenter_calls.clone();
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;

        let pass_started = OffsetDateTime::now_utc();
        let mut session = cache.open_session().await.unwrap();
        let synced = cache.sync_datacenters(&mut session, pass_started).await.unwrap();
        session.close().await;

        assert_eq!(synced, 2);
        assert_eq!(user.await.unwrap().source, DataSource::Live);
        assert_eq!(connector.datacenter_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cold_read_returns_placeholder_and_loads_in_background() {
        let connector = Counting::default();
        let cache = cache(&connector);

        let first = cache.get_datacenters(false).await;
        assert_eq!(first.source, DataSource::Placeholder);
        assert!(first.loading);
        assert!(!first.items.is_empty());

        let calls = connector.datacenter_calls.clone();
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        let watcher = cache.clone();
        wait_until(move || watcher.loaded_scopes().datacenters).await;
        assert_eq!(cache.get_datacenters(false).await.source, DataSource::Memory);
    }

    #[tokio::test]
    async fn test_connection_failure_falls_back_to_simulated_defaults() {
        let connector = Counting::default();
        connector.fail.store(true, Ordering::SeqCst);
        let cache = cache(&connector);

        let listing = cache.get_datacenters(true).await;
        assert_eq!(listing.source, DataSource::Simulated);
        assert!(listing.error.is_some());
        assert!(!listing.items.is_empty());
        let status = cache.get_status();
        assert!(status.kinds[&ResourceKind::Datacenter].errors.contains_key(ALL_DATACENTERS));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_generation() {
        let connector = Counting::default();
        let cache = cache(&connector);
        let first = cache.get_datacenters(true).await;

        connector.fail.store(true, Ordering::SeqCst);
        let second = cache.get_datacenters(true).await;
        assert_eq!(second.items, first.items);
        assert_eq!(second.source, DataSource::Memory);
        assert!(second.error.is_some());
    }

    #[tokio::test]
    async fn test_forced_cluster_load_filters_local_datastores_and_backfills_templates() {
        let connector = Counting::default();
        let cache = cache(&connector);
        let datacenter = cache.get_datacenters(true).await.items[0].name.clone();
        let cluster = cache.get_clusters(&datacenter, true).await.items[0].clone();

        let inventory = cache.get_resources(&cluster.id, None, true).await;
        assert_eq!(inventory.cluster_name.as_deref(), Some(cluster.name.as_str()));
        assert!(inventory.datastores.items.iter().all(|d| !d.name.ends_with("_local")));
        assert_eq!(inventory.resource_pools.items.len(), 3);

        let watcher = cache.clone();
        let id = cluster.id.clone();
        wait_until(move || watcher.loaded_scopes().templates.contains(&id)).await;
        let after = cache.get_resources(&cluster.id, None, false).await;
        assert!(after.templates.items.iter().all(|t| !t.placeholder));
        assert_eq!(after.templates.items.len(), 3);
    }

    #[tokio::test]
    async fn test_cluster_load_events_name_each_type() {
        let connector = Counting::default();
        let cache = cache(&connector);
        let datacenter = cache.get_datacenters(true).await.items[0].name.clone();
        let cluster = cache.get_clusters(&datacenter, true).await.items[0].clone();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cluster_id = cluster.id.clone();
        cache.add_listener(move |event| {
            let ours = event.data["key"] == cluster_id.as_str();
            if ours && event.kind == EventKind::LoadingCompleted {
                if let Some(kind) = event.data["type"].as_str() {
                    sink.lock().push(kind.to_string());
                }
            }
        });
        cache.get_resources(&cluster.id, None, true).await;

        let watcher = seen.clone();
        wait_until(move || watcher.lock().len() >= 4).await;
        let mut kinds = seen.lock().clone();
        kinds.sort();
        assert_eq!(kinds, ["datastore", "network", "resource_pool", "template"]);
    }

    #[tokio::test]
    async fn test_clear_and_invalidate() {
        let connector = Counting::default();
        let cache = cache(&connector);
        cache.get_datacenters(true).await;

        assert!(cache.invalidate(Some(ResourceKind::Datacenter)).await >= 1);
        let stale = cache.get_datacenters(false).await;
        assert!(stale.stale);
        assert!(stale.loading);

        let watcher = cache.clone();
        wait_until(move || {
            !watcher.get_status().kinds[&ResourceKind::Datacenter].loading.contains(ALL_DATACENTERS)
        })
        .await;
        cache.clear_cache(None).await;
        assert!(!cache.loaded_scopes().datacenters);
        assert_eq!(cache.get_datacenters(false).await.source, DataSource::Placeholder);
    }

    #[tokio::test]
    async fn test_simulate_mode_uses_its_own_scope() {
        let connector = Counting::default();
        let mut settings = settings();
        settings.simulate = true;
        let cache =
            InventoryCache::new(settings, Arc::new(connector.clone()), CacheStore::memory());

        assert!(cache.scope().is_simulated());
        let listing = cache.get_datacenters(true).await;
        assert_eq!(listing.source, DataSource::Simulated);
        assert_eq!(connector.datacenter_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_warm_starts_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut with_snapshot = settings();
        with_snapshot.snapshot_path = Some(dir.path().join("inventory.json"));

        let connector = Counting::default();
        let first = InventoryCache::new(
            with_snapshot.clone(),
            Arc::new(connector.clone()),
            CacheStore::memory(),
        );
        first.get_datacenters(true).await;
        assert!(first.save_snapshot().await);

        let second = InventoryCache::new(
            with_snapshot,
            Arc::new(connector.clone()),
            CacheStore::unavailable(),
        );
        assert!(second.warm_start().await);
        let listing = second.get_datacenters(false).await;
        assert_eq!(listing.source, DataSource::Snapshot);
        assert_eq!(connector.datacenter_calls.load(Ordering::SeqCst), 1);
    }
}
