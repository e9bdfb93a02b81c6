/*!
Faux vCenter scriptable pour tests sans infrastructure vSphere

Implémente `VCenterConnector` au-dessus d'un inventaire en mémoire.
Compte chaque appel, chaque connexion et chaque déconnexion, et permet
d'injecter des pannes (connexion, appel, datacenter) ou de la latence.
*/

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use vmforge_kernel::scope::Credentials;
use vmforge_kernel::vcenter::{
    InventorySession, RawCluster, RawDatacenter, RawDatastore, RawHost, RawNetwork, RawNetworkKind,
    RawResourcePool, RawTemplate, VCenterConnector, VCenterError,
};

/// Appels de session observables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    Datacenters,
    Clusters,
    Hosts,
    ResourcePools,
    Datastores,
    Networks,
    Templates,
}

#[derive(Debug, Clone)]
pub struct FakeCluster {
    pub raw: RawCluster,
    pub hosts: Vec<RawHost>,
    pub resource_pools: Vec<RawResourcePool>,
}

#[derive(Debug, Clone)]
pub struct FakeDatacenter {
    pub raw: RawDatacenter,
    pub clusters: Vec<FakeCluster>,
    pub datastores: Vec<RawDatastore>,
    pub networks: Vec<RawNetwork>,
    pub templates: Vec<RawTemplate>,
}

#[derive(Default)]
struct FakeState {
    datacenters: Vec<FakeDatacenter>,
    calls: HashMap<FakeCall, u32>,
    connect_attempts: u32,
    sessions_opened: u32,
    disconnects: u32,
    connect_failure: Option<VCenterError>,
    call_failures: HashMap<FakeCall, VCenterError>,
    failing_datacenters: HashSet<String>,
    latency: Duration,
    template_latency: Duration,
}

impl FakeState {
    fn datacenter(&self, datacenter_id: &str) -> Option<&FakeDatacenter> {
        self.datacenters.iter().find(|dc| dc.raw.id == datacenter_id)
    }

    fn cluster(&self, cluster_id: &str) -> Option<&FakeCluster> {
        self.datacenters
            .iter()
            .flat_map(|dc| dc.clusters.iter())
            .find(|c| c.raw.id == cluster_id)
    }
}

#[derive(Clone, Default)]
pub struct FakeVCenter {
    state: Arc<Mutex<FakeState>>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    // un test qui panique ne doit pas empoisonner les suivants
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn raw_datacenter(id: &str, name: &str) -> RawDatacenter {
    RawDatacenter {
        id: id.to_string(),
        name: name.to_string(),
        vm_folder: Some(format!("group-v-{id}")),
        host_folder: Some(format!("group-h-{id}")),
        datastore_folder: Some(format!("group-s-{id}")),
        network_folder: Some(format!("group-n-{id}")),
    }
}

fn host(id: &str) -> RawHost {
    RawHost {
        id: id.to_string(),
        name: format!("{id}.lab.local"),
        connected: true,
    }
}

fn pool(id: &str, name: &str) -> RawResourcePool {
    RawResourcePool {
        id: id.to_string(),
        name: name.to_string(),
    }
}

fn shared_datastore(id: &str, name: &str, hosts: &[&str]) -> RawDatastore {
    RawDatastore {
        id: id.to_string(),
        name: name.to_string(),
        datastore_type: "VMFS".to_string(),
        capacity: 2 << 40,
        free_space: 1 << 40,
        accessible: true,
        multiple_host_access: true,
        mounted_hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
        storage_cluster: None,
    }
}

fn local_datastore(id: &str, name: &str, host: &str) -> RawDatastore {
    RawDatastore {
        multiple_host_access: false,
        capacity: 500 << 30,
        free_space: 400 << 30,
        ..shared_datastore(id, name, &[host])
    }
}

fn network(id: &str, name: &str, kind: RawNetworkKind, vlan_id: Option<u32>) -> RawNetwork {
    RawNetwork {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        vlan_id,
    }
}

fn template(id: &str, name: &str, guest_id: &str) -> RawTemplate {
    RawTemplate {
        id: id.to_string(),
        name: name.to_string(),
        guest_id: guest_id.to_string(),
        cpu_count: 2,
        memory_mb: 4096,
    }
}

impl FakeVCenter {
    pub fn new(datacenters: Vec<FakeDatacenter>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                datacenters,
                ..FakeState::default()
            })),
        }
    }

    /// Inventaire de labo :
    /// - DC1 (datacenter-1) : Cluster-A (domain-c1, host-1 + host-2), SAN-01 partagé,
    ///   esx1_local monté sur host-1 seulement, "VM Network" + dvPG-Prod (VLAN 100), rhel9
    /// - DC2 (datacenter-2) : Cluster-B (domain-c2, host-3), SAN-02, "VM Network", win2022
    pub fn lab() -> Self {
        Self::new(vec![
            FakeDatacenter {
                raw: raw_datacenter("datacenter-1", "DC1"),
                clusters: vec![FakeCluster {
                    raw: RawCluster {
                        id: "domain-c1".to_string(),
                        name: "Cluster-A".to_string(),
                        drs_enabled: true,
                        ha_enabled: true,
                    },
                    hosts: vec![host("host-1"), host("host-2")],
                    resource_pools: vec![
                        pool("resgroup-1", "Resources"),
                        pool("resgroup-2", "Prod"),
                    ],
                }],
                datastores: vec![
                    shared_datastore("datastore-1", "SAN-01", &["host-1", "host-2"]),
                    local_datastore("datastore-2", "esx1_local", "host-1"),
                ],
                networks: vec![
                    network("network-1", "VM Network", RawNetworkKind::StandardPortgroup, None),
                    network(
                        "dvportgroup-1",
                        "dvPG-Prod",
                        RawNetworkKind::DistributedPortgroup,
                        Some(100),
                    ),
                ],
                templates: vec![template("vm-100", "rhel9", "rhel9_64Guest")],
            },
            FakeDatacenter {
                raw: raw_datacenter("datacenter-2", "DC2"),
                clusters: vec![FakeCluster {
                    raw: RawCluster {
                        id: "domain-c2".to_string(),
                        name: "Cluster-B".to_string(),
                        drs_enabled: false,
                        ha_enabled: true,
                    },
                    hosts: vec![host("host-3")],
                    resource_pools: vec![pool("resgroup-3", "Resources")],
                }],
                datastores: vec![shared_datastore("datastore-3", "SAN-02", &["host-3"])],
                networks: vec![network(
                    "network-2",
                    "VM Network",
                    RawNetworkKind::StandardPortgroup,
                    None,
                )],
                templates: vec![template("vm-200", "win2022", "windows2019srvNext_64Guest")],
            },
        ])
    }

    // ----- compteurs -----

    pub fn calls(&self, call: FakeCall) -> u32 {
        lock(&self.state).calls.get(&call).copied().unwrap_or(0)
    }

    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    pub fn sessions_opened(&self) -> u32 {
        lock(&self.state).sessions_opened
    }

    pub fn disconnects(&self) -> u32 {
        lock(&self.state).disconnects
    }

    pub fn reset_counters(&self) {
        let mut state = lock(&self.state);
        state.calls.clear();
        state.connect_attempts = 0;
        state.sessions_opened = 0;
        state.disconnects = 0;
    }

    // ----- pannes & latence -----

    pub fn fail_connect(&self, error: Option<VCenterError>) {
        lock(&self.state).connect_failure = error;
    }

    /// Raccourci : vCenter injoignable
    pub fn go_offline(&self) {
        self.fail_connect(Some(VCenterError::Connection {
            server: "fake-vcenter".to_string(),
            message: "connection refused".to_string(),
        }));
    }

    pub fn go_online(&self) {
        self.fail_connect(None);
    }

    pub fn fail_call(&self, call: FakeCall, error: VCenterError) {
        lock(&self.state).call_failures.insert(call, error);
    }

    pub fn heal_call(&self, call: FakeCall) {
        lock(&self.state).call_failures.remove(&call);
    }

    /// Tout appel portant sur ce datacenter échoue (clusters, datastores, réseaux, templates)
    pub fn fail_datacenter(&self, datacenter_id: &str) {
        lock(&self.state).failing_datacenters.insert(datacenter_id.to_string());
    }

    pub fn heal_datacenter(&self, datacenter_id: &str) {
        lock(&self.state).failing_datacenters.remove(datacenter_id);
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn set_template_latency(&self, latency: Duration) {
        lock(&self.state).template_latency = latency;
    }

    // ----- mutations d'inventaire -----

    pub fn rename_datacenter(&self, datacenter_id: &str, name: &str) {
        let mut state = lock(&self.state);
        if let Some(dc) = state.datacenters.iter_mut().find(|dc| dc.raw.id == datacenter_id) {
            dc.raw.name = name.to_string();
        }
    }

    pub fn add_datacenter(&self, datacenter_id: &str, name: &str) {
        lock(&self.state).datacenters.push(FakeDatacenter {
            raw: raw_datacenter(datacenter_id, name),
            clusters: Vec::new(),
            datastores: Vec::new(),
            networks: Vec::new(),
            templates: Vec::new(),
        });
    }

    pub fn remove_datacenter(&self, datacenter_id: &str) {
        lock(&self.state).datacenters.retain(|dc| dc.raw.id != datacenter_id);
    }

    pub fn add_datastore(&self, datacenter_id: &str, datastore: RawDatastore) {
        let mut state = lock(&self.state);
        if let Some(dc) = state.datacenters.iter_mut().find(|dc| dc.raw.id == datacenter_id) {
            dc.datastores.push(datastore);
        }
    }

    pub fn remove_datastore(&self, datastore_id: &str) {
        let mut state = lock(&self.state);
        for dc in state.datacenters.iter_mut() {
            dc.datastores.retain(|ds| ds.id != datastore_id);
        }
    }

    /// Fait varier l'espace libre (champ volatil, ne compte pas comme un changement)
    pub fn set_free_space(&self, datastore_id: &str, free_space: u64) {
        let mut state = lock(&self.state);
        for ds in state
            .datacenters
            .iter_mut()
            .flat_map(|dc| dc.datastores.iter_mut())
            .filter(|ds| ds.id == datastore_id)
        {
            ds.free_space = free_space;
        }
    }

    pub fn shared_datastore(id: &str, name: &str, hosts: &[&str]) -> RawDatastore {
        shared_datastore(id, name, hosts)
    }
}

impl VCenterConnector for FakeVCenter {
    fn connect(
        &self,
        credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<Box<dyn InventorySession>, VCenterError> {
        let latency = {
            let mut state = lock(&self.state);
            state.connect_attempts += 1;
            if let Some(error) = state.connect_failure.clone() {
                log::info!("🔌 [FAKE] connect refused for {}", credentials.username);
                return Err(error);
            }
            state.sessions_opened += 1;
            state.latency
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        log::debug!("🔌 [FAKE] session opened for {}", credentials.username);
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    /// Compte l'appel, applique latence et pannes, puis lit l'inventaire
    fn answer<T>(
        &self,
        call: FakeCall,
        datacenter_id: Option<&str>,
        read: impl FnOnce(&FakeState) -> T,
    ) -> Result<T, VCenterError> {
        let latency = {
            let mut state = lock(&self.state);
            *state.calls.entry(call).or_insert(0) += 1;
            match call {
                FakeCall::Templates => state.latency + state.template_latency,
                _ => state.latency,
            }
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let state = lock(&self.state);
        if let Some(error) = state.call_failures.get(&call) {
            return Err(error.clone());
        }
        if let Some(dc) = datacenter_id.filter(|id| state.failing_datacenters.contains(*id)) {
            return Err(VCenterError::Api {
                call: format!("{call:?}"),
                message: format!("datacenter {dc} unavailable"),
            });
        }
        Ok(read(&state))
    }

    fn per_datacenter<T: Clone>(
        &self,
        call: FakeCall,
        datacenter_id: &str,
        pick: impl FnOnce(&FakeDatacenter) -> &Vec<T>,
    ) -> Result<Vec<T>, VCenterError> {
        self.answer(call, Some(datacenter_id), |state| {
            state.datacenter(datacenter_id).map(|dc| pick(dc).clone())
        })?
        .ok_or_else(|| VCenterError::NotFound(format!("datacenter {datacenter_id}")))
    }

    fn per_cluster<T: Clone>(
        &self,
        call: FakeCall,
        cluster_id: &str,
        pick: impl FnOnce(&FakeCluster) -> &Vec<T>,
    ) -> Result<Vec<T>, VCenterError> {
        self.answer(call, None, |state| state.cluster(cluster_id).map(|c| pick(c).clone()))?
            .ok_or_else(|| VCenterError::NotFound(format!("cluster {cluster_id}")))
    }
}

impl InventorySession for FakeSession {
    fn datacenters(&self) -> Result<Vec<RawDatacenter>, VCenterError> {
        self.answer(FakeCall::Datacenters, None, |state| {
            state.datacenters.iter().map(|dc| dc.raw.clone()).collect()
        })
    }

    fn clusters(&self, datacenter_id: &str) -> Result<Vec<RawCluster>, VCenterError> {
        self.answer(FakeCall::Clusters, Some(datacenter_id), |state| {
            state
                .datacenter(datacenter_id)
                .map(|dc| dc.clusters.iter().map(|c| c.raw.clone()).collect())
        })?
        .ok_or_else(|| VCenterError::NotFound(format!("datacenter {datacenter_id}")))
    }

    fn hosts(&self, cluster_id: &str) -> Result<Vec<RawHost>, VCenterError> {
        self.per_cluster(FakeCall::Hosts, cluster_id, |c| &c.hosts)
    }

    fn resource_pools(&self, cluster_id: &str) -> Result<Vec<RawResourcePool>, VCenterError> {
        self.per_cluster(FakeCall::ResourcePools, cluster_id, |c| &c.resource_pools)
    }

    fn datastores(&self, datacenter_id: &str) -> Result<Vec<RawDatastore>, VCenterError> {
        self.per_datacenter(FakeCall::Datastores, datacenter_id, |dc| &dc.datastores)
    }

    fn networks(&self, datacenter_id: &str) -> Result<Vec<RawNetwork>, VCenterError> {
        self.per_datacenter(FakeCall::Networks, datacenter_id, |dc| &dc.networks)
    }

    fn templates(&self, datacenter_id: &str) -> Result<Vec<RawTemplate>, VCenterError> {
        self.per_datacenter(FakeCall::Templates, datacenter_id, |dc| &dc.templates)
    }

    fn disconnect(self: Box<Self>) {
        lock(&self.state).disconnects += 1;
        log::debug!("🔌 [FAKE] session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lab_inventory_and_counters() {
        let vcenter = FakeVCenter::lab();
        let session = vcenter
            .connect(&Credentials::new("fake", "admin", "pw"), Duration::from_secs(1))
            .unwrap();

        let dcs = session.datacenters().unwrap();
        assert_eq!(dcs.len(), 2);
        assert_eq!(session.hosts("domain-c1").unwrap().len(), 2);
        assert_eq!(session.datastores("datacenter-1").unwrap().len(), 2);
        assert!(matches!(session.hosts("domain-c9"), Err(VCenterError::NotFound(_))));

        session.disconnect();
        assert_eq!(vcenter.calls(FakeCall::Datacenters), 1);
        assert_eq!(vcenter.calls(FakeCall::Hosts), 2);
        assert_eq!(vcenter.sessions_opened(), 1);
        assert_eq!(vcenter.disconnects(), 1);
    }

    #[test]
    fn test_failure_injection() {
        let vcenter = FakeVCenter::lab();
        vcenter.go_offline();
        let refused =
            vcenter.connect(&Credentials::new("fake", "admin", "pw"), Duration::from_secs(1));
        assert!(refused.err().is_some_and(|e| e.is_connectivity()));
        assert_eq!(vcenter.connect_attempts(), 1);
        assert_eq!(vcenter.sessions_opened(), 0);

        vcenter.go_online();
        vcenter.fail_datacenter("datacenter-1");
        let session = vcenter
            .connect(&Credentials::new("fake", "admin", "pw"), Duration::from_secs(1))
            .unwrap();
        assert!(session.clusters("datacenter-1").is_err());
        assert_eq!(session.clusters("datacenter-2").unwrap().len(), 1);
    }
}
