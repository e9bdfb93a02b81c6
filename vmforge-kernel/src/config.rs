//! Configuration du kernel : `kernel.yaml` (optionnel) puis surcharges d'environnement.
//!
//! Fichier absent ou invalide => valeurs par défaut + warning, jamais fatal.
//! Une variable d'environnement mal formée est ignorée (warning) et la valeur
//! du fichier est conservée.

use crate::fetchers::DatacenterFilter;
use crate::loader::{InventorySettings, TtlPolicy};
use crate::models::ResourceKind;
use crate::retry::RetryPolicy;
use crate::scope::Credentials;
use crate::store::StoreSettings;
use crate::sync::SyncSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VsphereConf {
    pub server: String,
    pub username: String,
    pub password: String,
    /// Allow-list de datacenters (vide = tous)
    pub datacenters: Vec<String>,
    pub timeout_secs: u64,
    pub insecure_tls: bool,
}

impl Default for VsphereConf {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            password: String::new(),
            datacenters: Vec::new(),
            timeout_secs: 30,
            insecure_tls: false,
        }
    }
}

impl fmt::Debug for VsphereConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsphereConf")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"***")
            .field("datacenters", &self.datacenters)
            .field("timeout_secs", &self.timeout_secs)
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConf {
    pub datacenters: u64,
    pub clusters: u64,
    pub resource_pools: u64,
    pub datastores: u64,
    pub networks: u64,
    pub templates: u64,
}

impl Default for TtlConf {
    fn default() -> Self {
        let ttl = TtlPolicy::default();
        Self {
            datacenters: ttl.datacenters,
            clusters: ttl.clusters,
            resource_pools: ttl.resource_pools,
            datastores: ttl.datastores,
            networks: ttl.networks,
            templates: ttl.templates,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    pub prefix: String,
    pub redis_urls: Vec<String>,
    /// Dossier du backend fichier (repli si Redis est injoignable)
    pub dir: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
    pub op_timeout_ms: u64,
    pub compression_threshold: usize,
    pub ttl: TtlConf,
}

impl Default for CacheConf {
    fn default() -> Self {
        let store = StoreSettings::default();
        Self {
            prefix: "vmforge".into(),
            redis_urls: store.redis_urls,
            dir: None,
            snapshot_path: Some(PathBuf::from("./data/inventory-snapshot.json")),
            op_timeout_ms: store.op_timeout.as_millis() as u64,
            compression_threshold: store.compression_threshold,
            ttl: TtlConf::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConf {
    pub interval_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for SyncConf {
    fn default() -> Self {
        let sync = SyncSettings::default();
        Self {
            interval_secs: sync.interval.as_secs(),
            cooldown_secs: sync.cooldown.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub addr: String,
    /// Vide = API ouverte (hors /health, toujours ouvert)
    pub api_key: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".into(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub vsphere: VsphereConf,
    pub cache: CacheConf,
    pub sync: SyncConf,
    pub http: HttpConf,
    pub mqtt: Option<MqttConf>,
    pub simulate: bool,
    pub simulate_on_failure: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            vsphere: VsphereConf::default(),
            cache: CacheConf::default(),
            sync: SyncConf::default(),
            http: HttpConf::default(),
            mqtt: None,
            simulate: false,
            simulate_on_failure: true,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

struct EnvOverrides<F> {
    lookup: F,
    rejected: Vec<ConfigError>,
}

impl<F: Fn(&str) -> Option<String>> EnvOverrides<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn text(&self, key: &str, slot: &mut String) {
        if let Some(value) = self.raw(key) {
            *slot = value.trim().to_string();
        }
    }

    fn list(&self, key: &str, slot: &mut Vec<String>) {
        if let Some(value) = self.raw(key) {
            *slot = csv(&value);
        }
    }

    fn number<T: FromStr>(&mut self, key: &str, slot: &mut T) {
        if let Some(value) = self.raw(key) {
            match parse_value(key, &value) {
                Ok(parsed) => *slot = parsed,
                Err(e) => self.rejected.push(e),
            }
        }
    }

    fn flag(&mut self, key: &str, slot: &mut bool) {
        if let Some(value) = self.raw(key) {
            match parse_bool(key, &value) {
                Ok(parsed) => *slot = parsed,
                Err(e) => self.rejected.push(e),
            }
        }
    }
}

impl KernelConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Applique les surcharges `VSPHERE_*` / `VMFORGE_*` ; renvoie les valeurs rejetées
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = EnvOverrides { lookup, rejected: Vec::new() };

        env.text("VSPHERE_SERVER", &mut self.vsphere.server);
        env.text("VSPHERE_USER", &mut self.vsphere.username);
        if let Some(password) = env.raw("VSPHERE_PASSWORD") {
            self.vsphere.password = password;
        }
        env.list("VSPHERE_DATACENTERS", &mut self.vsphere.datacenters);
        env.number("VSPHERE_TIMEOUT_SECS", &mut self.vsphere.timeout_secs);
        env.flag("VSPHERE_INSECURE_TLS", &mut self.vsphere.insecure_tls);
        env.flag("VMFORGE_SIMULATE", &mut self.simulate);
        env.flag("VMFORGE_SIMULATE_ON_FAILURE", &mut self.simulate_on_failure);
        env.text("VMFORGE_CACHE_PREFIX", &mut self.cache.prefix);
        env.list("VMFORGE_REDIS_URLS", &mut self.cache.redis_urls);
        if let Some(dir) = env.raw("VMFORGE_CACHE_DIR") {
            self.cache.dir = Some(dir.trim()).filter(|s| !s.is_empty()).map(PathBuf::from);
        }
        if let Some(path) = env.raw("VMFORGE_SNAPSHOT_PATH") {
            // chaîne vide = snapshot désactivé
            self.cache.snapshot_path =
                Some(path.trim()).filter(|s| !s.is_empty()).map(PathBuf::from);
        }
        env.number("VMFORGE_SYNC_INTERVAL_SECS", &mut self.sync.interval_secs);
        env.number("VMFORGE_SYNC_COOLDOWN_SECS", &mut self.sync.cooldown_secs);
        env.text("VMFORGE_HTTP_ADDR", &mut self.http.addr);
        env.text("VMFORGE_API_KEY", &mut self.http.api_key);

        if let Some(host) = env.raw("VMFORGE_MQTT_HOST") {
            let port = self.mqtt.as_ref().map_or(1883, |m| m.port);
            self.mqtt = Some(MqttConf { host: host.trim().to_string(), port });
        }
        if let Some(mqtt) = self.mqtt.as_mut() {
            env.number("VMFORGE_MQTT_PORT", &mut mqtt.port);
        }

        let ttl = &mut self.cache.ttl;
        for kind in ResourceKind::ALL {
            let key = format!("VMFORGE_TTL_{}_SECS", kind.as_str().to_ascii_uppercase());
            let slot = match kind {
                ResourceKind::Datacenter => &mut ttl.datacenters,
                ResourceKind::Cluster => &mut ttl.clusters,
                ResourceKind::ResourcePool => &mut ttl.resource_pools,
                ResourceKind::Datastore => &mut ttl.datastores,
                ResourceKind::Network => &mut ttl.networks,
                ResourceKind::Template => &mut ttl.templates,
            };
            env.number(&key, slot);
        }
        env.rejected
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        let ttl = &self.cache.ttl;
        TtlPolicy {
            datacenters: ttl.datacenters,
            clusters: ttl.clusters,
            resource_pools: ttl.resource_pools,
            datastores: ttl.datastores,
            networks: ttl.networks,
            templates: ttl.templates,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.vsphere.server, &self.vsphere.username, &self.vsphere.password)
    }

    pub fn inventory_settings(&self) -> InventorySettings {
        InventorySettings {
            credentials: self.credentials(),
            datacenter_filter: DatacenterFilter::new(self.vsphere.datacenters.iter()),
            connect_timeout: self.vcenter_timeout(),
            connect_retry: RetryPolicy::default(),
            ttl: self.ttl_policy(),
            key_prefix: self.cache.prefix.clone(),
            simulate: self.simulate,
            simulate_on_failure: self.simulate_on_failure,
            snapshot_path: self.cache.snapshot_path.clone(),
            ..InventorySettings::default()
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            redis_urls: self.cache.redis_urls.clone(),
            op_timeout: Duration::from_millis(self.cache.op_timeout_ms.max(1)),
            compression_threshold: self.cache.compression_threshold,
            file_dir: self.cache.dir.clone(),
            ..StoreSettings::default()
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            interval: Duration::from_secs(self.sync.interval_secs.max(1)),
            cooldown: Duration::from_secs(self.sync.cooldown_secs),
        }
    }

    pub fn vcenter_timeout(&self) -> Duration {
        Duration::from_secs(self.vsphere.timeout_secs.max(1))
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_value("http.addr", &self.http.addr)
    }
}

pub async fn load_from_path(path: &Path) -> Result<KernelConfig, ConfigError> {
    let text = fs::read_to_string(path).await?;
    KernelConfig::from_yaml(&text)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VMFORGE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        match load_from_path(Path::new(&path)).await {
            Ok(cfg) => {
                info!(path, "config loaded");
                cfg
            }
            Err(e) => {
                warn!(path, error = %e, "invalid config, using defaults");
                KernelConfig::default()
            }
        }
    } else {
        info!(path, "no config file, using defaults");
        KernelConfig::default()
    };
    for rejected in cfg.apply_env(|key| std::env::var(key).ok()) {
        warn!(error = %rejected, "environment override ignored");
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_yaml_overrides_defaults_partially() {
        let cfg = KernelConfig::from_yaml(
            "vsphere:\n  server: vc.lab\n  datacenters: [DC1, DC2]\n\
             cache:\n  ttl:\n    datastores: 60\n\
             mqtt:\n  host: broker\n  port: 1884\n",
        )
        .unwrap();
        assert_eq!(cfg.vsphere.server, "vc.lab");
        assert_eq!(cfg.vsphere.timeout_secs, 30);
        assert_eq!(cfg.cache.ttl.datastores, 60);
        assert_eq!(cfg.cache.ttl.templates, 7200);
        assert_eq!(cfg.mqtt.unwrap().port, 1884);
        assert!(cfg.simulate_on_failure);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let cfg = KernelConfig::from_yaml("  \n").unwrap();
        assert_eq!(cfg.sync.interval_secs, 1800);
        assert_eq!(cfg.sync.cooldown_secs, 300);
    }

    #[test]
    fn test_env_overrides_and_rejections() {
        let mut cfg = KernelConfig::default();
        let rejected = cfg.apply_env(env(&[
            ("VSPHERE_SERVER", " vc.prod "),
            ("VSPHERE_DATACENTERS", "East, West,,"),
            ("VMFORGE_TTL_DATASTORES_SECS", "120"),
            ("VMFORGE_TTL_RESOURCE_POOLS_SECS", "45"),
            ("VMFORGE_SYNC_INTERVAL_SECS", "soon"),
            ("VMFORGE_SIMULATE", "yes"),
            ("VMFORGE_SNAPSHOT_PATH", ""),
        ]));

        assert_eq!(cfg.vsphere.server, "vc.prod");
        assert_eq!(cfg.vsphere.datacenters, vec!["East", "West"]);
        assert_eq!(cfg.ttl_policy().secs(ResourceKind::Datastore), 120);
        assert_eq!(cfg.ttl_policy().secs(ResourceKind::ResourcePool), 45);
        assert_eq!(cfg.sync.interval_secs, 1800);
        assert!(cfg.simulate);
        assert!(cfg.cache.snapshot_path.is_none());
        assert_eq!(rejected.len(), 1);
        assert!(matches!(
            &rejected[0],
            ConfigError::Invalid { key, .. } if key == "VMFORGE_SYNC_INTERVAL_SECS"
        ));
    }

    #[test]
    fn test_settings_derivation() {
        let mut cfg = KernelConfig::default();
        cfg.apply_env(env(&[
            ("VSPHERE_SERVER", "vc"),
            ("VSPHERE_USER", "admin"),
            ("VSPHERE_PASSWORD", "pw"),
            ("VSPHERE_DATACENTERS", "DC1"),
        ]));
        let settings = cfg.inventory_settings();
        assert!(settings.credentials.is_complete());
        assert!(settings.datacenter_filter.allows("dc1"));
        assert!(!settings.datacenter_filter.allows("DC2"));
        assert_eq!(settings.key_prefix, "vmforge");
        assert_eq!(cfg.store_settings().op_timeout, Duration::from_secs(2));
        assert_eq!(cfg.http_addr().unwrap().port(), 8080);
        assert!(!format!("{:?}", cfg.vsphere).contains("pw"));
    }

    #[tokio::test]
    async fn test_load_from_path_reports_yaml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        tokio::fs::write(&path, "vsphere: [not, a, map]").await.unwrap();
        assert!(matches!(load_from_path(&path).await, Err(ConfigError::Yaml(_))));
    }
}
