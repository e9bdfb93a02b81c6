/**
 * SIMULATION - Faux vCenter déterministe
 *
 * RÔLE :
 * Fournit un inventaire plausible quand le vCenter n'est pas joignable (ou
 * quand `simulate` est activé), pour que l'UI et la génération Terraform
 * suivent exactement les mêmes chemins de code qu'en production.
 *
 * FONCTIONNEMENT :
 * - Implémente `VCenterConnector` : les données passent par les fetchers réels
 * - Ids et noms dérivés (SHA-256) des identifiants datacenter/cluster : deux
 *   appels avec le même id donnent exactement les mêmes enregistrements
 * - Chaque datacenter expose aussi des disques locaux ESXi, que le filtre de
 *   partage doit écarter
 */

use crate::fetchers::{self, DatacenterFilter};
use crate::models::{Cluster, ClusterInventory, DataSource, Datacenter, Listing};
use crate::scope::Credentials;
use crate::vcenter::{
    InventorySession, RawCluster, RawDatacenter, RawDatastore, RawHost, RawNetwork, RawNetworkKind,
    RawResourcePool, RawTemplate, VCenterConnector, VCenterError,
};
use sha2::{Digest, Sha256};
use std::time::Duration;

const DATACENTERS: [&str; 2] = ["SIM-DC-East", "SIM-DC-West"];
const CLUSTERS_PER_DATACENTER: usize = 2;
const HOSTS_PER_CLUSTER: usize = 3;
const GIB: u64 = 1024 * 1024 * 1024;

fn digest(parts: &[&str]) -> [u8; 8] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    head
}

/// Entier stable dérivé d'une suite de segments
fn tag(parts: &[&str]) -> u32 {
    let head = digest(parts);
    u32::from_be_bytes([head[0], head[1], head[2], head[3]])
}

/// Suffixe d'id sur 40 bits : les collisions restent négligeables même pour
/// des centaines d'objets par datacenter
fn short(parts: &[&str]) -> u64 {
    u64::from_be_bytes(digest(parts)) >> 24
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector;

impl VCenterConnector for SimulatedConnector {
    fn connect(
        &self,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<Box<dyn InventorySession>, VCenterError> {
        Ok(Box::new(SimulatedSession))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSession;

impl SimulatedSession {
    fn datacenter_name(datacenter_id: &str) -> String {
        DATACENTERS
            .iter()
            .find(|name| Self::datacenter_id(name) == datacenter_id)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("SIM-DC-{}", short(&["dc", datacenter_id])))
    }

    fn datacenter_id(name: &str) -> String {
        format!("datacenter-{}", short(&["dc", name]))
    }

    fn cluster_ids(datacenter_id: &str) -> Vec<(String, String)> {
        let dc_name = Self::datacenter_name(datacenter_id);
        (1..=CLUSTERS_PER_DATACENTER)
            .map(|i| {
                let index = i.to_string();
                (
                    format!("domain-c{}", short(&["cluster", datacenter_id, &index])),
                    format!("{dc_name}-Cluster-{i:02}"),
                )
            })
            .collect()
    }

    fn host_ids(cluster_id: &str) -> Vec<String> {
        (1..=HOSTS_PER_CLUSTER)
            .map(|i| format!("host-{}", short(&["host", cluster_id, &i.to_string()])))
            .collect()
    }
}

impl InventorySession for SimulatedSession {
    fn datacenters(&self) -> Result<Vec<RawDatacenter>, VCenterError> {
        Ok(DATACENTERS
            .iter()
            .map(|name| {
                let id = Self::datacenter_id(name);
                RawDatacenter {
                    vm_folder: Some(format!("group-v{}", short(&["vm", &id]))),
                    host_folder: Some(format!("group-h{}", short(&["host", &id]))),
                    datastore_folder: Some(format!("group-s{}", short(&["ds", &id]))),
                    network_folder: Some(format!("group-n{}", short(&["net", &id]))),
                    id,
                    name: name.to_string(),
                }
            })
            .collect())
    }

    fn clusters(&self, datacenter_id: &str) -> Result<Vec<RawCluster>, VCenterError> {
        Ok(Self::cluster_ids(datacenter_id)
            .into_iter()
            .map(|(id, name)| RawCluster {
                drs_enabled: tag(&["drs", &id]) % 4 != 0,
                ha_enabled: true,
                id,
                name,
            })
            .collect())
    }

    fn hosts(&self, cluster_id: &str) -> Result<Vec<RawHost>, VCenterError> {
        Ok(Self::host_ids(cluster_id)
            .into_iter()
            .enumerate()
            .map(|(i, id)| RawHost {
                name: format!("esx{:02}.{}.sim.local", i + 1, cluster_id),
                id,
                connected: true,
            })
            .collect())
    }

    fn resource_pools(&self, cluster_id: &str) -> Result<Vec<RawResourcePool>, VCenterError> {
        Ok(["Resources", "Production", "Development"]
            .iter()
            .map(|&name| RawResourcePool {
                id: format!("resgroup-{}", short(&["pool", cluster_id, name])),
                name: name.to_string(),
            })
            .collect())
    }

    fn datastores(&self, datacenter_id: &str) -> Result<Vec<RawDatastore>, VCenterError> {
        let mut out = Vec::new();
        for i in 1..=2u64 {
            let name = format!("SIM-SAN-{i:02}");
            out.push(RawDatastore {
                id: format!("datastore-{}", short(&["san", datacenter_id, &name])),
                capacity: 4096 * GIB,
                free_space: (1024 + u64::from(tag(&["free", datacenter_id, &name]) % 2048))
                    * GIB,
                name,
                datastore_type: "VMFS".into(),
                accessible: true,
                multiple_host_access: true,
                mounted_hosts: None,
                storage_cluster: None,
            });
        }
        out.push(RawDatastore {
            id: format!("datastore-{}", short(&["pod", datacenter_id])),
            name: "SIM-NFS-POD-01".into(),
            datastore_type: "NFS".into(),
            capacity: 8192 * GIB,
            free_space: 6000 * GIB,
            accessible: true,
            multiple_host_access: true,
            mounted_hosts: None,
            storage_cluster: Some(format!("group-p{}", short(&["pod-group", datacenter_id]))),
        });
        for (cluster_id, _) in Self::cluster_ids(datacenter_id) {
            let hosts = Self::host_ids(&cluster_id);
            out.push(RawDatastore {
                id: format!("datastore-{}", short(&["vsan", &cluster_id])),
                name: format!("vsanDatastore-{cluster_id}"),
                datastore_type: "VSAN".into(),
                capacity: 2048 * GIB,
                free_space: 900 * GIB,
                accessible: true,
                multiple_host_access: true,
                mounted_hosts: Some(hosts.clone()),
                storage_cluster: None,
            });
            for (i, host) in hosts.iter().enumerate() {
                out.push(RawDatastore {
                    id: format!("datastore-{}", short(&["local", host])),
                    name: format!("esx{:02}_local", i + 1),
                    datastore_type: "VMFS".into(),
                    capacity: 500 * GIB,
                    free_space: 400 * GIB,
                    accessible: true,
                    multiple_host_access: false,
                    mounted_hosts: Some(vec![host.clone()]),
                    storage_cluster: None,
                });
            }
        }
        Ok(out)
    }

    fn networks(&self, datacenter_id: &str) -> Result<Vec<RawNetwork>, VCenterError> {
        let mut out = vec![RawNetwork {
            id: format!("network-{}", short(&["net", datacenter_id, "VM Network"])),
            name: "VM Network".into(),
            kind: RawNetworkKind::StandardPortgroup,
            vlan_id: Some(0),
        }];
        for segment in ["Prod", "Dev", "Mgmt"] {
            let vlan = 100 + tag(&["vlan", datacenter_id, segment]) % 900;
            out.push(RawNetwork {
                id: format!("dvportgroup-{}", short(&["dvpg", datacenter_id, segment])),
                name: format!("dvPG-{segment}-{vlan}"),
                kind: RawNetworkKind::DistributedPortgroup,
                vlan_id: Some(vlan),
            });
        }
        Ok(out)
    }

    fn templates(&self, datacenter_id: &str) -> Result<Vec<RawTemplate>, VCenterError> {
        Ok([
            ("rhel9-template", "rhel9_64Guest", 2, 4096),
            ("ubuntu-22.04-template", "ubuntu64Guest", 2, 4096),
            ("win2022-template", "windows2019srvNext_64Guest", 4, 8192),
        ]
        .iter()
        .map(|&(name, guest, cpu, mem)| RawTemplate {
            id: format!("vm-{}", short(&["tpl", datacenter_id, name])),
            name: name.to_string(),
            guest_id: guest.to_string(),
            cpu_count: cpu,
            memory_mb: mem,
        })
        .collect())
    }

    fn disconnect(self: Box<Self>) {}
}

// Jeux par défaut servis quand rien d'autre n'est disponible.
// Les erreurs sont impossibles côté simulateur ; on replie sur une liste vide.

pub fn default_datacenters() -> Listing<Datacenter> {
    let items = fetchers::fetch_datacenters(&SimulatedSession, &DatacenterFilter::default())
        .unwrap_or_default();
    simulated_listing(items)
}

pub fn default_clusters(datacenter_name: &str) -> Listing<Cluster> {
    let datacenter = default_datacenter(datacenter_name);
    let items = fetchers::fetch_clusters(&SimulatedSession, &datacenter).unwrap_or_default();
    simulated_listing(items)
}

/// Cluster synthétisé quand l'id n'existe pas dans l'inventaire simulé
pub fn synthesize_cluster(cluster_id: &str, cluster_name: Option<&str>) -> Cluster {
    let datacenter = default_datacenter(DATACENTERS[0]);
    Cluster {
        id: cluster_id.to_string(),
        name: cluster_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("SIM-Cluster-{}", short(&["cluster-name", cluster_id]))),
        datacenter_id: datacenter.id,
        datacenter_name: datacenter.name,
        host_count: HOSTS_PER_CLUSTER as u32,
        drs_enabled: true,
        ha_enabled: true,
        placeholder: false,
    }
}

/// Trouve le cluster simulé par id (ou le synthétise)
pub fn resolve_cluster(cluster_id: &str, cluster_name: Option<&str>) -> Cluster {
    fetchers::locate_cluster(&SimulatedSession, cluster_id, &DatacenterFilter::default())
        .unwrap_or_else(|_| synthesize_cluster(cluster_id, cluster_name))
}

pub fn default_resources(cluster_id: &str, cluster_name: Option<&str>) -> ClusterInventory {
    let cluster = resolve_cluster(cluster_id, cluster_name);
    let session = SimulatedSession;
    ClusterInventory {
        cluster_id: cluster.id.clone(),
        cluster_name: Some(cluster.name.clone()),
        resource_pools: simulated_listing(
            fetchers::fetch_resource_pools(&session, &cluster).unwrap_or_default(),
        ),
        datastores: simulated_listing(
            fetchers::fetch_datastores(&session, &cluster).unwrap_or_default(),
        ),
        networks: simulated_listing(
            fetchers::fetch_networks(&session, &cluster).unwrap_or_default(),
        ),
        templates: simulated_listing(
            fetchers::fetch_templates(&session, &cluster.datacenter_id).unwrap_or_default(),
        ),
    }
}

fn default_datacenter(name: &str) -> Datacenter {
    let id = SimulatedSession::datacenter_id(name);
    Datacenter {
        id,
        name: name.to_string(),
        vm_folder: None,
        host_folder: None,
        datastore_folder: None,
        network_folder: None,
        placeholder: false,
    }
}

fn simulated_listing<T: crate::models::Resource>(items: Vec<T>) -> Listing<T> {
    let mut listing = Listing::placeholder(items);
    listing.source = DataSource::Simulated;
    listing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_resources_are_deterministic() {
        let first = default_resources("domain-c42", None);
        let second = default_resources("domain-c42", None);
        assert_eq!(first.resource_pools.items, second.resource_pools.items);
        assert_eq!(first.datastores.items, second.datastores.items);
        assert_eq!(first.networks.items, second.networks.items);
        assert_eq!(first.cluster_name, second.cluster_name);
        assert!(!first.resource_pools.items.is_empty());
    }

    #[test]
    fn test_local_datastores_are_filtered_out() {
        let clusters = default_clusters("SIM-DC-East");
        let cluster = &clusters.items[0];
        let inventory = default_resources(&cluster.id, Some(&cluster.name));
        let names: Vec<&str> =
            inventory.datastores.items.iter().map(|d| d.name.as_str()).collect();
        assert!(names.iter().all(|n| !n.ends_with("_local")), "{names:?}");
        assert!(names.contains(&"SIM-SAN-01"));
        assert!(names.iter().any(|n| n.starts_with("vsanDatastore-")));
        assert!(names.contains(&"SIM-NFS-POD-01"));
    }

    #[test]
    fn test_known_cluster_is_resolved_in_its_datacenter() {
        let clusters = default_clusters("SIM-DC-West");
        assert_eq!(clusters.items.len(), CLUSTERS_PER_DATACENTER);
        let resolved = resolve_cluster(&clusters.items[1].id, None);
        assert_eq!(resolved.datacenter_name, "SIM-DC-West");
        assert_eq!(resolved.host_count, HOSTS_PER_CLUSTER as u32);
    }

    #[test]
    fn test_unknown_cluster_is_synthesized() {
        let cluster = resolve_cluster("domain-c999999", Some("Edge"));
        assert_eq!(cluster.name, "Edge");
        assert_eq!(cluster.datacenter_name, DATACENTERS[0]);
    }

    #[test]
    fn test_default_datacenters_are_labeled_simulated() {
        let listing = default_datacenters();
        assert_eq!(listing.items.len(), DATACENTERS.len());
        assert_eq!(listing.source, DataSource::Simulated);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let session = SimulatedSession;
        let mut seen = std::collections::HashSet::new();
        for datacenter in session.datacenters().unwrap() {
            assert!(seen.insert(datacenter.id.clone()));
            for cluster in session.clusters(&datacenter.id).unwrap() {
                assert!(seen.insert(cluster.id.clone()), "{}", cluster.id);
                for host in session.hosts(&cluster.id).unwrap() {
                    assert!(seen.insert(host.id.clone()), "{}", host.id);
                }
                for pool in session.resource_pools(&cluster.id).unwrap() {
                    assert!(seen.insert(pool.id.clone()), "{}", pool.id);
                }
            }
            for datastore in session.datastores(&datacenter.id).unwrap() {
                assert!(seen.insert(datastore.id.clone()), "{}", datastore.id);
            }
            for network in session.networks(&datacenter.id).unwrap() {
                assert!(seen.insert(network.id.clone()), "{}", network.id);
            }
            for template in session.templates(&datacenter.id).unwrap() {
                assert!(seen.insert(template.id.clone()), "{}", template.id);
            }
        }
    }
}
