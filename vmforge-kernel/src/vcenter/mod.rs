/**
 * VCENTER - Frontière avec l'API d'inventaire vSphere
 *
 * RÔLE :
 * Définit ce dont le moteur de cache a besoin côté vCenter : ouvrir une
 * session (connect avec timeout), énumérer l'inventaire brut, se déconnecter.
 *
 * FONCTIONNEMENT :
 * - `VCenterConnector` fabrique des sessions ; implémenté par le client REST
 *   (production), le simulateur (mode dégradé) et les fakes du devkit
 * - `InventorySession` expose des appels BLOQUANTS : le loader les exécute
 *   toujours sur le pool bloquant de tokio, jamais sur une tâche de requête
 * - Une session n'est jamais partagée entre deux fetchs concurrents
 */

pub mod rest;

pub use rest::RestConnector;

use crate::scope::Credentials;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VCenterError {
    #[error("cannot reach vCenter {server}: {message}")]
    Connection { server: String, message: String },
    #[error("vCenter {server} rejected credentials for {username}")]
    Authentication { server: String, username: String },
    #[error("vCenter call timed out after {0:?}")]
    Timeout(Duration),
    #[error("vCenter API error on {call}: {message}")]
    Api { call: String, message: String },
    #[error("cannot decode vCenter response for {call}: {message}")]
    Decode { call: String, message: String },
    #[error("{0} not found in vCenter inventory")]
    NotFound(String),
}

impl VCenterError {
    /// Les refus d'authentification ne sont jamais rejoués
    pub fn is_retryable(&self) -> bool {
        matches!(self, VCenterError::Connection { .. } | VCenterError::Timeout(_))
    }

    /// Erreurs qui justifient un repli en simulation (vCenter injoignable)
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            VCenterError::Connection { .. }
                | VCenterError::Timeout(_)
                | VCenterError::Authentication { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDatacenter {
    pub id: String,
    pub name: String,
    pub vm_folder: Option<String>,
    pub host_folder: Option<String>,
    pub datastore_folder: Option<String>,
    pub network_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCluster {
    pub id: String,
    pub name: String,
    pub drs_enabled: bool,
    pub ha_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHost {
    pub id: String,
    pub name: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResourcePool {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDatastore {
    pub id: String,
    pub name: String,
    pub datastore_type: String,
    pub capacity: u64,
    pub free_space: u64,
    pub accessible: bool,
    /// Monté par plusieurs hôtes (faux pour un disque local ESXi)
    pub multiple_host_access: bool,
    /// Hôtes qui montent le datastore, quand l'API sait le dire
    pub mounted_hosts: Option<Vec<String>>,
    /// Storage cluster (datastore cluster / SDRS) éventuel
    pub storage_cluster: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RawNetworkKind {
    StandardPortgroup,
    DistributedPortgroup,
    OpaqueNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNetwork {
    pub id: String,
    pub name: String,
    pub kind: RawNetworkKind,
    pub vlan_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTemplate {
    pub id: String,
    pub name: String,
    pub guest_id: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
}

/// Session ouverte sur un vCenter. Tous les appels sont bloquants.
pub trait InventorySession: Send {
    fn datacenters(&self) -> Result<Vec<RawDatacenter>, VCenterError>;
    fn clusters(&self, datacenter_id: &str) -> Result<Vec<RawCluster>, VCenterError>;
    fn hosts(&self, cluster_id: &str) -> Result<Vec<RawHost>, VCenterError>;
    fn resource_pools(&self, cluster_id: &str) -> Result<Vec<RawResourcePool>, VCenterError>;
    fn datastores(&self, datacenter_id: &str) -> Result<Vec<RawDatastore>, VCenterError>;
    fn networks(&self, datacenter_id: &str) -> Result<Vec<RawNetwork>, VCenterError>;
    /// Généralement l'appel le plus lent de tout l'inventaire
    fn templates(&self, datacenter_id: &str) -> Result<Vec<RawTemplate>, VCenterError>;
    fn disconnect(self: Box<Self>);
}

pub trait VCenterConnector: Send + Sync {
    /// Bloquant ; `timeout` borne la tentative de connexion
    fn connect(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Box<dyn InventorySession>, VCenterError>;

    fn name(&self) -> &'static str;
}
