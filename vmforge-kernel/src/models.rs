/**
 * MODÈLES D'INVENTAIRE - Enregistrements normalisés des ressources vSphere
 *
 * RÔLE :
 * Types partagés par tout le moteur de cache : les six familles de ressources
 * (datacenter, cluster, resource pool, datastore, réseau, template), l'enveloppe
 * de cache avec horodatage + TTL, et la réponse `Listing` renvoyée aux appelants.
 *
 * FONCTIONNEMENT :
 * - Chaque ressource implémente le trait `Resource` : identifiant stable (clé de
 *   jointure du delta), nom lisible, comparaison de contenu hors champs volatils
 * - `CacheEntry` = liste complète d'un type pour un scope + date de fetch + TTL
 * - `Listing` = liste servie + provenance (mémoire, store, snapshot, live, simulé)
 */

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Familles de ressources gérées par le cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Datacenter,
    Cluster,
    ResourcePool,
    Datastore,
    Network,
    Template,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Datacenter,
        ResourceKind::Cluster,
        ResourceKind::ResourcePool,
        ResourceKind::Datastore,
        ResourceKind::Network,
        ResourceKind::Template,
    ];

    /// Types rattachés à un cluster (un jeu de clés par cluster id)
    pub const CLUSTER_SCOPED: [ResourceKind; 4] = [
        ResourceKind::ResourcePool,
        ResourceKind::Datastore,
        ResourceKind::Network,
        ResourceKind::Template,
    ];

    /// Segment utilisé dans les clés de cache
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Datacenter => "datacenters",
            ResourceKind::Cluster => "clusters",
            ResourceKind::ResourcePool => "resource_pools",
            ResourceKind::Datastore => "datastores",
            ResourceKind::Network => "networks",
            ResourceKind::Template => "templates",
        }
    }

    /// Nom exposé dans les événements et l'API, identique à la forme serde
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Datacenter => "datacenter",
            ResourceKind::Cluster => "cluster",
            ResourceKind::ResourcePool => "resource_pool",
            ResourceKind::Datastore => "datastore",
            ResourceKind::Network => "network",
            ResourceKind::Template => "template",
        }
    }

    /// Accepte singulier ou pluriel, tirets ou underscores ("resource-pool", "datastores"...)
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        let singular = normalized.strip_suffix('s').unwrap_or(&normalized);
        match singular {
            "datacenter" => Some(ResourceKind::Datacenter),
            "cluster" => Some(ResourceKind::Cluster),
            "resource_pool" | "pool" => Some(ResourceKind::ResourcePool),
            "datastore" => Some(ResourceKind::Datastore),
            "network" => Some(ResourceKind::Network),
            "template" => Some(ResourceKind::Template),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contrat commun à tous les enregistrements d'inventaire
pub trait Resource: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ResourceKind;

    /// Identifiant vCenter, unique par type et par scope
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Égalité sur les champs comparables (les champs volatils sont ignorés)
    fn same_content(&self, other: &Self) -> bool;

    /// Vrai pour les entrées fabriquées en attendant les vraies données
    fn is_placeholder(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: String,
    pub name: String,
    pub vm_folder: Option<String>,
    pub host_folder: Option<String>,
    pub datastore_folder: Option<String>,
    pub network_folder: Option<String>,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub datacenter_id: String,
    pub datacenter_name: String,
    pub host_count: u32,
    #[serde(default)]
    pub drs_enabled: bool,
    #[serde(default)]
    pub ha_enabled: bool,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub id: String,
    pub name: String,
    /// VMFS, NFS, VSAN, VVOL...
    pub datastore_type: String,
    pub capacity_bytes: u64,
    /// Volatil : exclu de la détection "updated"
    pub free_space_bytes: u64,
    pub accessible: bool,
    pub shared_across_cluster: bool,
    pub storage_cluster: Option<String>,
    pub cluster_id: String,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub is_dvs: bool,
    pub vlan_id: Option<u32>,
    pub network_type: String,
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub guest_id: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub datacenter_id: String,
    #[serde(default)]
    pub placeholder: bool,
}

impl Template {
    pub const PLACEHOLDER_ID: &'static str = "placeholder-loading";

    /// Entrée servie pendant l'énumération (lente) des templates
    pub fn loading_placeholder(datacenter_id: &str) -> Self {
        Self {
            id: Self::PLACEHOLDER_ID.to_string(),
            name: "Loading templates...".to_string(),
            guest_id: "otherGuest64".to_string(),
            cpu_count: 2,
            memory_mb: 4096,
            datacenter_id: datacenter_id.to_string(),
            placeholder: true,
        }
    }
}

impl Resource for Datacenter {
    const KIND: ResourceKind = ResourceKind::Datacenter;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn same_content(&self, other: &Self) -> bool {
        self.name == other.name
            && self.vm_folder == other.vm_folder
            && self.host_folder == other.host_folder
            && self.datastore_folder == other.datastore_folder
            && self.network_folder == other.network_folder
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

impl Resource for Cluster {
    const KIND: ResourceKind = ResourceKind::Cluster;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn same_content(&self, other: &Self) -> bool {
        self.name == other.name
            && self.datacenter_id == other.datacenter_id
            && self.datacenter_name == other.datacenter_name
            && self.host_count == other.host_count
            && self.drs_enabled == other.drs_enabled
            && self.ha_enabled == other.ha_enabled
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

impl Resource for ResourcePool {
    const KIND: ResourceKind = ResourceKind::ResourcePool;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn same_content(&self, other: &Self) -> bool {
        self.name == other.name && self.cluster_id == other.cluster_id
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

impl Resource for Datastore {
    const KIND: ResourceKind = ResourceKind::Datastore;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn same_content(&self, other: &Self) -> bool {
        // free_space_bytes bouge en permanence, on ne le compare pas
        self.name == other.name
            && self.datastore_type == other.datastore_type
            && self.capacity_bytes == other.capacity_bytes
            && self.accessible == other.accessible
            && self.shared_across_cluster == other.shared_across_cluster
            && self.storage_cluster == other.storage_cluster
            && self.cluster_id == other.cluster_id
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

impl Resource for Network {
    const KIND: ResourceKind = ResourceKind::Network;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn same_content(&self, other: &Self) -> bool {
        self.name == other.name
            && self.is_dvs == other.is_dvs
            && self.vlan_id == other.vlan_id
            && self.network_type == other.network_type
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

impl Resource for Template {
    const KIND: ResourceKind = ResourceKind::Template;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn same_content(&self, other: &Self) -> bool {
        self.name == other.name
            && self.guest_id == other.guest_id
            && self.cpu_count == other.cpu_count
            && self.memory_mb == other.memory_mb
            && self.datacenter_id == other.datacenter_id
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

/// Provenance des données servies à l'appelant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Memory,
    Store,
    Snapshot,
    Live,
    Simulated,
    Placeholder,
}

/// Liste complète d'un type de ressource pour un scope, avec sa date de fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub items: Vec<T>,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    pub ttl_secs: u64,
    pub origin: DataSource,
}

impl<T> CacheEntry<T> {
    pub fn new(items: Vec<T>, ttl_secs: u64, origin: DataSource) -> Self {
        Self {
            items,
            fetched_at: OffsetDateTime::now_utc(),
            ttl_secs,
            origin,
        }
    }

    /// `None` quand le TTL dépasse la plage représentable : l'entrée n'expire jamais
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        self.fetched_at.checked_add(time::Duration::seconds(ttl))
    }

    pub fn is_fresh_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at().map_or(true, |deadline| now < deadline)
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(OffsetDateTime::now_utc())
    }

    /// Force le passage en "stale" sans perdre les données (invalidate)
    pub fn expire(&mut self) {
        self.ttl_secs = 0;
    }
}

/// Réponse d'une lecture : jamais d'erreur "brute", toujours une liste étiquetée
#[derive(Debug, Clone, Serialize)]
pub struct Listing<T> {
    pub kind: ResourceKind,
    pub items: Vec<T>,
    pub source: DataSource,
    /// Données hors TTL (servies en attendant le refresh)
    pub stale: bool,
    /// Un chargement est en cours pour ce scope
    pub loading: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub fetched_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl<T: Resource> Listing<T> {
    pub fn from_entry(entry: &CacheEntry<T>, source: DataSource) -> Self {
        Self {
            kind: T::KIND,
            items: entry.items.clone(),
            source,
            stale: !entry.is_fresh(),
            loading: false,
            fetched_at: Some(entry.fetched_at),
            error: None,
        }
    }

    pub fn placeholder(items: Vec<T>) -> Self {
        Self {
            kind: T::KIND,
            items,
            source: DataSource::Placeholder,
            stale: true,
            loading: false,
            fetched_at: None,
            error: None,
        }
    }

    pub fn loading(mut self, loading: bool) -> Self {
        self.loading = loading;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|r| r.id()).collect()
    }
}

/// Ressources d'un cluster, telles que renvoyées par `get_resources`
#[derive(Debug, Clone, Serialize)]
pub struct ClusterInventory {
    pub cluster_id: String,
    pub cluster_name: Option<String>,
    pub resource_pools: Listing<ResourcePool>,
    pub datastores: Listing<Datastore>,
    pub networks: Listing<Network>,
    pub templates: Listing<Template>,
}
