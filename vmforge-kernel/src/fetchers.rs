/**
 * FETCHERS - Traduction de l'inventaire brut vCenter en enregistrements du cache
 *
 * RÔLE :
 * Une fonction par type de ressource, qui reçoit une session DÉJÀ ouverte :
 * la connexion/déconnexion appartient au loader, ce qui permet de réutiliser
 * une seule session pour plusieurs types dans une même passe.
 *
 * FONCTIONNEMENT :
 * - Filtre optionnel par noms de datacenters (insensible à la casse)
 * - Échec partiel toléré : un datacenter (ou un détail d'hôte) qui échoue est
 *   loggé et ignoré, les autres sont conservés
 * - Datastores : seuls les datastores utilisables par TOUS les hôtes du cluster
 *   (ou membres d'un storage cluster) sont gardés ; les disques locaux ESXi
 *   sont écartés
 */

use crate::models::{Cluster, Datacenter, Datastore, Network, ResourcePool, Template};
use crate::vcenter::{InventorySession, RawDatastore, RawNetworkKind, VCenterError};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Liste blanche de datacenters ; vide = tous
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatacenterFilter {
    names: Vec<String>,
}

impl DatacenterFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    /// "DC1, DC2" tel que lu dans la configuration
    pub fn from_csv(value: &str) -> Self {
        Self::new(value.split(','))
    }

    pub fn allows(&self, name: &str) -> bool {
        self.names.is_empty() || self.names.iter().any(|n| *n == name.trim().to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Résultat d'un fetch qui tolère des sous-échecs
#[derive(Debug, Clone)]
pub struct Partial<T> {
    pub items: Vec<T>,
    /// (unité ignorée, cause)
    pub failures: Vec<(String, VCenterError)>,
}

impl<T> Partial<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Tout a échoué : rien d'autoritaire à écrire dans le cache
    pub fn is_total_failure(&self) -> bool {
        self.items.is_empty() && !self.failures.is_empty()
    }

    pub fn first_error(&self) -> Option<&VCenterError> {
        self.failures.first().map(|(_, e)| e)
    }
}

pub fn fetch_datacenters(
    session: &dyn InventorySession,
    filter: &DatacenterFilter,
) -> Result<Vec<Datacenter>, VCenterError> {
    let raw = session.datacenters()?;
    let total = raw.len();
    let datacenters: Vec<Datacenter> = raw
        .into_iter()
        .filter(|dc| filter.allows(&dc.name))
        .map(|dc| Datacenter {
            id: dc.id,
            name: dc.name,
            vm_folder: dc.vm_folder,
            host_folder: dc.host_folder,
            datastore_folder: dc.datastore_folder,
            network_folder: dc.network_folder,
            placeholder: false,
        })
        .collect();
    debug!(total, kept = datacenters.len(), "datacenters fetched");
    Ok(datacenters)
}

/// Clusters d'un datacenter, avec le nombre d'hôtes
pub fn fetch_clusters(
    session: &dyn InventorySession,
    datacenter: &Datacenter,
) -> Result<Vec<Cluster>, VCenterError> {
    let raw = session.clusters(&datacenter.id)?;
    let mut clusters = Vec::with_capacity(raw.len());
    for cluster in raw {
        let host_count = match session.hosts(&cluster.id) {
            Ok(hosts) => hosts.len() as u32,
            Err(e) => {
                warn!(
                    cluster = %cluster.name,
                    error = %e,
                    "host enumeration failed, host count unknown"
                );
                0
            }
        };
        clusters.push(Cluster {
            id: cluster.id,
            name: cluster.name,
            datacenter_id: datacenter.id.clone(),
            datacenter_name: datacenter.name.clone(),
            host_count,
            drs_enabled: cluster.drs_enabled,
            ha_enabled: cluster.ha_enabled,
            placeholder: false,
        });
    }
    Ok(clusters)
}

/// Clusters de plusieurs datacenters ; un datacenter en échec n'arrête pas les autres
pub fn fetch_all_clusters(
    session: &dyn InventorySession,
    datacenters: &[Datacenter],
) -> Partial<Cluster> {
    let mut partial = Partial {
        items: Vec::new(),
        failures: Vec::new(),
    };
    for datacenter in datacenters {
        match fetch_clusters(session, datacenter) {
            Ok(clusters) => partial.items.extend(clusters),
            Err(e) => {
                warn!(datacenter = %datacenter.name, error = %e, "skipping datacenter");
                partial.failures.push((datacenter.name.clone(), e));
            }
        }
    }
    partial
}

/// Retrouve un cluster (et son datacenter) à partir de son seul id
pub fn locate_cluster(
    session: &dyn InventorySession,
    cluster_id: &str,
    filter: &DatacenterFilter,
) -> Result<Cluster, VCenterError> {
    let datacenters = fetch_datacenters(session, filter)?;
    let mut last_error = None;
    for datacenter in &datacenters {
        match fetch_clusters(session, datacenter) {
            Ok(clusters) => {
                if let Some(found) = clusters.into_iter().find(|c| c.id == cluster_id) {
                    return Ok(found);
                }
            }
            Err(e) => {
                warn!(
                    datacenter = %datacenter.name,
                    error = %e,
                    "cannot list clusters while locating"
                );
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| VCenterError::NotFound(format!("cluster {cluster_id}"))))
}

pub fn fetch_resource_pools(
    session: &dyn InventorySession,
    cluster: &Cluster,
) -> Result<Vec<ResourcePool>, VCenterError> {
    Ok(session
        .resource_pools(&cluster.id)?
        .into_iter()
        .map(|p| ResourcePool {
            id: p.id,
            name: p.name,
            cluster_id: cluster.id.clone(),
            placeholder: false,
        })
        .collect())
}

/// Politique de partage : le datastore doit être visible de chaque hôte du cluster
pub fn is_cluster_shared(datastore: &RawDatastore, cluster_hosts: &HashSet<String>) -> bool {
    if !datastore.accessible {
        return false;
    }
    if datastore.storage_cluster.is_some() {
        return true;
    }
    match &datastore.mounted_hosts {
        Some(mounted) => {
            !cluster_hosts.is_empty()
                && cluster_hosts.iter().all(|h| mounted.iter().any(|m| m == h))
        }
        None => datastore.multiple_host_access,
    }
}

pub fn fetch_datastores(
    session: &dyn InventorySession,
    cluster: &Cluster,
) -> Result<Vec<Datastore>, VCenterError> {
    let hosts: HashSet<String> = match session.hosts(&cluster.id) {
        Ok(hosts) => hosts.into_iter().map(|h| h.id).collect(),
        Err(e) => {
            // sans liste d'hôtes, seul le drapeau multi-hôtes peut trancher
            warn!(
                cluster = %cluster.name,
                error = %e,
                "host enumeration failed for datastore filtering"
            );
            HashSet::new()
        }
    };
    let raw = session.datastores(&cluster.datacenter_id)?;
    let total = raw.len();
    let datastores: Vec<Datastore> = raw
        .into_iter()
        .filter(|ds| is_cluster_shared(ds, &hosts))
        .map(|ds| Datastore {
            id: ds.id,
            name: ds.name,
            datastore_type: ds.datastore_type,
            capacity_bytes: ds.capacity,
            free_space_bytes: ds.free_space,
            accessible: ds.accessible,
            shared_across_cluster: true,
            storage_cluster: ds.storage_cluster,
            cluster_id: cluster.id.clone(),
            placeholder: false,
        })
        .collect();
    debug!(cluster = %cluster.name, total, shared = datastores.len(), "datastores filtered");
    Ok(datastores)
}

pub fn fetch_networks(
    session: &dyn InventorySession,
    cluster: &Cluster,
) -> Result<Vec<Network>, VCenterError> {
    Ok(session
        .networks(&cluster.datacenter_id)?
        .into_iter()
        .map(|n| Network {
            is_dvs: n.kind == RawNetworkKind::DistributedPortgroup,
            network_type: match n.kind {
                RawNetworkKind::StandardPortgroup => "standard",
                RawNetworkKind::DistributedPortgroup => "distributed",
                RawNetworkKind::OpaqueNetwork => "opaque",
            }
            .to_string(),
            id: n.id,
            name: n.name,
            vlan_id: n.vlan_id,
            placeholder: false,
        })
        .collect())
}

pub fn fetch_templates(
    session: &dyn InventorySession,
    datacenter_id: &str,
) -> Result<Vec<Template>, VCenterError> {
    Ok(session
        .templates(datacenter_id)?
        .into_iter()
        .map(|t| Template {
            id: t.id,
            name: t.name,
            guest_id: t.guest_id,
            cpu_count: t.cpu_count,
            memory_mb: t.memory_mb,
            datacenter_id: datacenter_id.to_string(),
            placeholder: false,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcenter::{
        RawCluster, RawDatacenter, RawHost, RawNetwork, RawResourcePool, RawTemplate,
    };

    fn raw_ds(name: &str, accessible: bool, multi: bool, mounted: Option<&[&str]>) -> RawDatastore {
        RawDatastore {
            id: format!("datastore-{name}"),
            name: name.to_string(),
            datastore_type: "VMFS".into(),
            capacity: 100,
            free_space: 50,
            accessible,
            multiple_host_access: multi,
            mounted_hosts: mounted.map(|m| m.iter().map(|s| s.to_string()).collect()),
            storage_cluster: None,
        }
    }

    struct OneDatacenter {
        fail_clusters: bool,
    }

    impl InventorySession for OneDatacenter {
        fn datacenters(&self) -> Result<Vec<RawDatacenter>, VCenterError> {
            Ok(["DC1", "DC2"]
                .iter()
                .map(|n| RawDatacenter {
                    id: format!("datacenter-{n}"),
                    name: n.to_string(),
                    vm_folder: None,
                    host_folder: None,
                    datastore_folder: None,
                    network_folder: None,
                })
                .collect())
        }
        fn clusters(&self, datacenter_id: &str) -> Result<Vec<RawCluster>, VCenterError> {
            if self.fail_clusters && datacenter_id == "datacenter-DC1" {
                return Err(VCenterError::Api {
                    call: "cluster.list".into(),
                    message: "boom".into(),
                });
            }
            Ok(vec![RawCluster {
                id: format!("domain-{datacenter_id}"),
                name: "C".into(),
                drs_enabled: true,
                ha_enabled: false,
            }])
        }
        fn hosts(&self, _cluster_id: &str) -> Result<Vec<RawHost>, VCenterError> {
            Ok(["host-1", "host-2"]
                .iter()
                .map(|h| RawHost {
                    id: h.to_string(),
                    name: h.to_string(),
                    connected: true,
                })
                .collect())
        }
        fn resource_pools(&self, _cluster_id: &str) -> Result<Vec<RawResourcePool>, VCenterError> {
            Ok(vec![])
        }
        fn datastores(&self, _datacenter_id: &str) -> Result<Vec<RawDatastore>, VCenterError> {
            Ok(vec![
                raw_ds("SAN-01", true, true, None),
                raw_ds("esx1_local", true, false, None),
                raw_ds("vsan", true, true, Some(&["host-1", "host-2"])),
                raw_ds("half", true, true, Some(&["host-1"])),
            ])
        }
        fn networks(&self, _datacenter_id: &str) -> Result<Vec<RawNetwork>, VCenterError> {
            Ok(vec![RawNetwork {
                id: "dvportgroup-1".into(),
                name: "Prod".into(),
                kind: RawNetworkKind::DistributedPortgroup,
                vlan_id: Some(100),
            }])
        }
        fn templates(&self, _datacenter_id: &str) -> Result<Vec<RawTemplate>, VCenterError> {
            Ok(vec![])
        }
        fn disconnect(self: Box<Self>) {}
    }

    #[test]
    fn test_filter_is_case_insensitive_and_empty_means_all() {
        let filter = DatacenterFilter::from_csv(" dc1 , ");
        assert!(filter.allows("DC1"));
        assert!(!filter.allows("DC2"));
        assert!(DatacenterFilter::default().allows("anything"));
    }

    #[test]
    fn test_datacenters_honor_filter() {
        let session = OneDatacenter { fail_clusters: false };
        let dcs = fetch_datacenters(&session, &DatacenterFilter::from_csv("DC2")).unwrap();
        assert_eq!(dcs.len(), 1);
        assert_eq!(dcs[0].name, "DC2");
    }

    #[test]
    fn test_failed_datacenter_does_not_abort_cluster_fetch() {
        let session = OneDatacenter { fail_clusters: true };
        let dcs = fetch_datacenters(&session, &DatacenterFilter::default()).unwrap();
        let partial = fetch_all_clusters(&session, &dcs);
        assert_eq!(partial.items.len(), 1);
        assert_eq!(partial.items[0].datacenter_name, "DC2");
        assert_eq!(partial.items[0].host_count, 2);
        assert_eq!(partial.failures.len(), 1);
        assert!(!partial.is_total_failure());
    }

    #[test]
    fn test_only_cluster_wide_datastores_are_kept() {
        let session = OneDatacenter { fail_clusters: false };
        let cluster =
            locate_cluster(&session, "domain-datacenter-DC1", &DatacenterFilter::default())
                .unwrap();
        let names: Vec<String> = fetch_datastores(&session, &cluster)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["SAN-01", "vsan"]);
    }

    #[test]
    fn test_shared_policy_edge_cases() {
        let hosts: HashSet<String> = ["h1".to_string()].into();
        assert!(!is_cluster_shared(&raw_ds("x", false, true, None), &hosts));
        let mut in_pod = raw_ds("pod", true, false, Some(&[]));
        in_pod.storage_cluster = Some("group-p1".into());
        assert!(is_cluster_shared(&in_pod, &hosts));
        assert!(!is_cluster_shared(&raw_ds("m", true, true, Some(&["h1"])), &HashSet::new()));
    }

    #[test]
    fn test_unknown_cluster_is_not_found() {
        let session = OneDatacenter { fail_clusters: false };
        let err =
            locate_cluster(&session, "domain-c404", &DatacenterFilter::default()).unwrap_err();
        assert!(matches!(err, VCenterError::NotFound(_)));
    }
}
