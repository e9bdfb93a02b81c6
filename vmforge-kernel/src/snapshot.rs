/**
 * SNAPSHOT - Copie disque de toute la hiérarchie d'inventaire
 *
 * RÔLE :
 * Démarrage à chaud quand le cache store est vide ou injoignable : la dernière
 * hiérarchie connue (datacenters, clusters par datacenter, ressources par
 * cluster) est relue depuis un fichier JSON local.
 *
 * FONCTIONNEMENT :
 * - Réécrit après chaque synchro réussie et à l'arrêt du service
 * - Écriture atomique : fichier temporaire puis rename
 * - Ignoré si le scope enregistré ne correspond pas aux credentials courants
 */

use crate::models::{CacheEntry, Cluster, Datacenter, Datastore, Network, ResourcePool, Template};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version {found}")]
    Version { found: u32 },
}

/// Ressources d'un cluster, chaque type avec sa propre date de fetch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterEntries {
    pub cluster: Option<Cluster>,
    pub resource_pools: Option<CacheEntry<ResourcePool>>,
    pub datastores: Option<CacheEntry<Datastore>>,
    pub networks: Option<CacheEntry<Network>>,
    pub templates: Option<CacheEntry<Template>>,
}

impl ClusterEntries {
    pub fn is_empty(&self) -> bool {
        self.resource_pools.is_none()
            && self.datastores.is_none()
            && self.networks.is_none()
            && self.templates.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub version: u32,
    pub scope: String,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
    pub datacenters: Option<CacheEntry<Datacenter>>,
    #[serde(default)]
    pub clusters_by_datacenter: BTreeMap<String, CacheEntry<Cluster>>,
    #[serde(default)]
    pub resources_by_cluster: BTreeMap<String, ClusterEntries>,
}

impl InventorySnapshot {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            scope: scope.into(),
            saved_at: OffsetDateTime::now_utc(),
            datacenters: None,
            clusters_by_datacenter: BTreeMap::new(),
            resources_by_cluster: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.datacenters.is_none()
            && self.clusters_by_datacenter.is_empty()
            && self.resources_by_cluster.is_empty()
    }

    /// Charge le snapshot ; `Ok(None)` si le fichier n'existe pas
    pub async fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Self = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version { found: snapshot.version });
        }
        info!(
            path = %path.display(),
            datacenters = snapshot.datacenters.as_ref().map_or(0, |e| e.items.len()),
            clusters = snapshot.resources_by_cluster.len(),
            "inventory snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    pub async fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataSource;

    fn datacenter() -> Datacenter {
        Datacenter {
            id: "datacenter-1".into(),
            name: "DC1".into(),
            vm_folder: Some("group-v1".into()),
            host_folder: None,
            datastore_folder: None,
            network_folder: None,
            placeholder: false,
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("inventory.json");

        let mut snapshot = InventorySnapshot::new("abc");
        snapshot.datacenters = Some(CacheEntry::new(vec![datacenter()], 3600, DataSource::Live));
        snapshot.save(&path).await.unwrap();

        let loaded = InventorySnapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.scope, "abc");
        assert_eq!(loaded.datacenters.unwrap().items, vec![datacenter()]);
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InventorySnapshot::load(&dir.path().join("nope.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_future_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        let mut snapshot = InventorySnapshot::new("abc");
        snapshot.version = 99;
        snapshot.save(&path).await.unwrap();
        assert!(matches!(
            InventorySnapshot::load(&path).await,
            Err(SnapshotError::Version { found: 99 })
        ));
    }
}
