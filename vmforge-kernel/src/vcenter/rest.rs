//! Client REST vSphere Automation (`/api/...`), en mode bloquant.
//!
//! Le client `reqwest::blocking` possède son propre runtime interne : il est
//! créé, utilisé et détruit uniquement sur le pool bloquant.

use super::{
    InventorySession, RawCluster, RawDatacenter, RawDatastore, RawHost, RawNetwork, RawNetworkKind,
    RawResourcePool, RawTemplate, VCenterConnector, VCenterError,
};
use crate::scope::Credentials;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Debug, Clone, Default)]
pub struct RestConnector {
    /// vCenter de labo avec certificat auto-signé
    pub accept_invalid_certs: bool,
    /// Timeout des appels d'énumération (la connexion a le sien)
    pub call_timeout: Option<Duration>,
}

impl RestConnector {
    pub fn new(accept_invalid_certs: bool, call_timeout: Duration) -> Self {
        Self {
            accept_invalid_certs,
            call_timeout: Some(call_timeout),
        }
    }
}

fn base_url(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("https://{server}")
    }
}

fn map_transport(server: &str, call: &str, timeout: Duration, e: reqwest::Error) -> VCenterError {
    if e.is_timeout() {
        VCenterError::Timeout(timeout)
    } else if e.is_connect() {
        VCenterError::Connection {
            server: server.to_string(),
            message: e.to_string(),
        }
    } else if e.is_decode() {
        VCenterError::Decode {
            call: call.to_string(),
            message: e.to_string(),
        }
    } else {
        VCenterError::Api {
            call: call.to_string(),
            message: e.to_string(),
        }
    }
}

impl VCenterConnector for RestConnector {
    fn connect(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Box<dyn InventorySession>, VCenterError> {
        let server = credentials.server.clone();
        let call_timeout = self.call_timeout.unwrap_or(timeout);
        let client = Client::builder()
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .connect_timeout(timeout)
            .timeout(call_timeout)
            .build()
            .map_err(|e| VCenterError::Connection {
                server: server.clone(),
                message: e.to_string(),
            })?;

        let base = base_url(&server);
        let response = client
            .post(format!("{base}/api/session"))
            .basic_auth(&credentials.username, Some(credentials.password()))
            .timeout(timeout)
            .send()
            .map_err(|e| map_transport(&server, "session", timeout, e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(VCenterError::Authentication {
                    server,
                    username: credentials.username.clone(),
                })
            }
            status if !status.is_success() => {
                return Err(VCenterError::Api {
                    call: "session".into(),
                    message: format!("HTTP {status}"),
                })
            }
            _ => {}
        }

        // le token est renvoyé comme une chaîne JSON
        let token: String = response.json().map_err(|e| VCenterError::Decode {
            call: "session".into(),
            message: e.to_string(),
        })?;
        debug!(%server, "vCenter REST session opened");
        Ok(Box::new(RestSession {
            client,
            base,
            server,
            token,
            call_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "vsphere-rest"
    }
}

pub struct RestSession {
    client: Client,
    base: String,
    server: String,
    token: String,
    call_timeout: Duration,
}

#[derive(Deserialize)]
struct DatacenterSummary {
    datacenter: String,
    name: String,
}

#[derive(Deserialize)]
struct DatacenterInfo {
    datastore_folder: Option<String>,
    host_folder: Option<String>,
    network_folder: Option<String>,
    vm_folder: Option<String>,
}

#[derive(Deserialize)]
struct ClusterSummary {
    cluster: String,
    name: String,
    #[serde(default)]
    ha_enabled: bool,
    #[serde(default)]
    drs_enabled: bool,
}

#[derive(Deserialize)]
struct HostSummary {
    host: String,
    name: String,
    #[serde(default)]
    connection_state: String,
}

#[derive(Deserialize)]
struct PoolSummary {
    resource_pool: String,
    name: String,
}

#[derive(Deserialize)]
struct DatastoreSummary {
    datastore: String,
    name: String,
    #[serde(rename = "type", default)]
    datastore_type: String,
    #[serde(default)]
    free_space: Option<u64>,
    #[serde(default)]
    capacity: Option<u64>,
}

#[derive(Deserialize)]
struct DatastoreInfo {
    #[serde(default)]
    accessible: bool,
    #[serde(default)]
    multiple_host_access: bool,
}

#[derive(Deserialize)]
struct NetworkSummary {
    network: String,
    name: String,
    #[serde(rename = "type")]
    network_type: String,
}

#[derive(Deserialize)]
struct LibraryItemInfo {
    name: String,
}

#[derive(Deserialize)]
struct TemplateCpu {
    count: u32,
}

#[derive(Deserialize)]
struct TemplateMemory {
    #[serde(rename = "size_MiB")]
    size_mib: u64,
}

#[derive(Deserialize)]
struct TemplateInfo {
    #[serde(rename = "guest_OS", default)]
    guest_os: String,
    cpu: TemplateCpu,
    memory: TemplateMemory,
}

impl RestSession {
    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(SESSION_HEADER, &self.token)
    }

    fn send<T: DeserializeOwned>(
        &self,
        call: &str,
        builder: RequestBuilder,
    ) -> Result<T, VCenterError> {
        let response = self
            .authed(builder)
            .send()
            .map_err(|e| map_transport(&self.server, call, self.call_timeout, e))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(VCenterError::Authentication {
                server: self.server.clone(),
                username: "session".into(),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(VCenterError::NotFound(call.to_string()));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(VCenterError::Api {
                call: call.to_string(),
                message: format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            });
        }
        response.json().map_err(|e| VCenterError::Decode {
            call: call.to_string(),
            message: e.to_string(),
        })
    }

    fn get<T: DeserializeOwned>(
        &self,
        call: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, VCenterError> {
        let builder = self.client.get(format!("{}{path}", self.base)).query(query);
        self.send(call, builder)
    }
}

impl InventorySession for RestSession {
    fn datacenters(&self) -> Result<Vec<RawDatacenter>, VCenterError> {
        let summaries: Vec<DatacenterSummary> =
            self.get("datacenter.list", "/api/vcenter/datacenter", &[])?;
        let mut out = Vec::with_capacity(summaries.len());
        for dc in summaries {
            // les dossiers ne sont que dans le détail ; un échec ne bloque pas la liste
            let info: Option<DatacenterInfo> = match self.get(
                "datacenter.get",
                &format!("/api/vcenter/datacenter/{}", dc.datacenter),
                &[],
            ) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(datacenter = %dc.name, error = %e, "datacenter detail unavailable");
                    None
                }
            };
            out.push(RawDatacenter {
                id: dc.datacenter,
                name: dc.name,
                vm_folder: info.as_ref().and_then(|i| i.vm_folder.clone()),
                host_folder: info.as_ref().and_then(|i| i.host_folder.clone()),
                datastore_folder: info.as_ref().and_then(|i| i.datastore_folder.clone()),
                network_folder: info.as_ref().and_then(|i| i.network_folder.clone()),
            });
        }
        Ok(out)
    }

    fn clusters(&self, datacenter_id: &str) -> Result<Vec<RawCluster>, VCenterError> {
        let clusters: Vec<ClusterSummary> =
            self.get("cluster.list", "/api/vcenter/cluster", &[("datacenters", datacenter_id)])?;
        Ok(clusters
            .into_iter()
            .map(|c| RawCluster {
                id: c.cluster,
                name: c.name,
                drs_enabled: c.drs_enabled,
                ha_enabled: c.ha_enabled,
            })
            .collect())
    }

    fn hosts(&self, cluster_id: &str) -> Result<Vec<RawHost>, VCenterError> {
        let hosts: Vec<HostSummary> =
            self.get("host.list", "/api/vcenter/host", &[("clusters", cluster_id)])?;
        Ok(hosts
            .into_iter()
            .map(|h| RawHost {
                id: h.host,
                name: h.name,
                connected: h.connection_state == "CONNECTED",
            })
            .collect())
    }

    fn resource_pools(&self, cluster_id: &str) -> Result<Vec<RawResourcePool>, VCenterError> {
        let pools: Vec<PoolSummary> = self.get(
            "resource_pool.list",
            "/api/vcenter/resource-pool",
            &[("clusters", cluster_id)],
        )?;
        Ok(pools
            .into_iter()
            .map(|p| RawResourcePool {
                id: p.resource_pool,
                name: p.name,
            })
            .collect())
    }

    fn datastores(&self, datacenter_id: &str) -> Result<Vec<RawDatastore>, VCenterError> {
        let summaries: Vec<DatastoreSummary> = self.get(
            "datastore.list",
            "/api/vcenter/datastore",
            &[("datacenters", datacenter_id)],
        )?;
        let mut out = Vec::with_capacity(summaries.len());
        for ds in summaries {
            let path = format!("/api/vcenter/datastore/{}", ds.datastore);
            let info: DatastoreInfo = match self.get("datastore.get", &path, &[]) {
                Ok(info) => info,
                Err(e) => {
                    // sans détail on ne peut pas prouver le partage : exclu par le filtre
                    warn!(datastore = %ds.name, error = %e, "datastore detail unavailable");
                    DatastoreInfo {
                        accessible: false,
                        multiple_host_access: false,
                    }
                }
            };
            out.push(RawDatastore {
                id: ds.datastore,
                name: ds.name,
                datastore_type: ds.datastore_type,
                capacity: ds.capacity.unwrap_or(0),
                free_space: ds.free_space.unwrap_or(0),
                accessible: info.accessible,
                multiple_host_access: info.multiple_host_access,
                mounted_hosts: None,
                storage_cluster: None,
            });
        }
        Ok(out)
    }

    fn networks(&self, datacenter_id: &str) -> Result<Vec<RawNetwork>, VCenterError> {
        let networks: Vec<NetworkSummary> =
            self.get("network.list", "/api/vcenter/network", &[("datacenters", datacenter_id)])?;
        Ok(networks
            .into_iter()
            .map(|n| RawNetwork {
                id: n.network,
                name: n.name,
                kind: match n.network_type.as_str() {
                    "DISTRIBUTED_PORTGROUP" => RawNetworkKind::DistributedPortgroup,
                    "OPAQUE_NETWORK" => RawNetworkKind::OpaqueNetwork,
                    _ => RawNetworkKind::StandardPortgroup,
                },
                vlan_id: None,
            })
            .collect())
    }

    fn templates(&self, _datacenter_id: &str) -> Result<Vec<RawTemplate>, VCenterError> {
        // les templates de content library ne sont pas rattachés à un datacenter
        let builder = self
            .client
            .post(format!("{}/api/content/library/item", self.base))
            .query(&[("action", "find")])
            .json(&serde_json::json!({ "type": "vm-template" }));
        let item_ids: Vec<String> = self.send("library_item.find", builder)?;

        let mut out = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            let detail = self
                .get::<LibraryItemInfo>(
                    "library_item.get",
                    &format!("/api/content/library/item/{item_id}"),
                    &[],
                )
                .and_then(|item| {
                    self.get::<TemplateInfo>(
                        "vm_template.get",
                        &format!("/api/vcenter/vm-template/library-items/{item_id}"),
                        &[],
                    )
                    .map(|info| (item, info))
                });
            match detail {
                Ok((item, info)) => out.push(RawTemplate {
                    id: item_id,
                    name: item.name,
                    guest_id: info.guest_os,
                    cpu_count: info.cpu.count,
                    memory_mb: info.memory.size_mib,
                }),
                Err(e) => warn!(item = %item_id, error = %e, "skipping unreadable template"),
            }
        }
        Ok(out)
    }

    fn disconnect(self: Box<Self>) {
        let request = self.authed(self.client.delete(format!("{}/api/session", self.base)));
        match request.send() {
            Ok(_) => debug!(server = %self.server, "vCenter REST session closed"),
            Err(e) => debug!(server = %self.server, error = %e, "vCenter logout failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_defaults_to_https() {
        assert_eq!(base_url("vcenter.lab"), "https://vcenter.lab");
        assert_eq!(base_url("http://127.0.0.1:8989/"), "http://127.0.0.1:8989");
    }

    #[test]
    fn test_unreachable_server_is_a_connection_error() {
        let connector = RestConnector::new(true, Duration::from_millis(300));
        let creds = Credentials::new("http://127.0.0.1:9", "admin", "secret");
        let err = connector.connect(&creds, Duration::from_millis(300)).err().expect("must fail");
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }

    #[test]
    fn test_template_info_shape() {
        let info: TemplateInfo = serde_json::from_str(
            r#"{
                "guest_OS": "RHEL_9_64",
                "cpu": {"count": 4, "cores_per_socket": 1},
                "memory": {"size_MiB": 8192}
            }"#,
        )
        .unwrap();
        assert_eq!(info.guest_os, "RHEL_9_64");
        assert_eq!(info.cpu.count, 4);
        assert_eq!(info.memory.size_mib, 8192);
    }
}
