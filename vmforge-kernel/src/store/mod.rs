/**
 * CACHE STORE - Stockage clé/valeur des listes de ressources sérialisées
 *
 * RÔLE :
 * Façade unique au-dessus de Redis (production), d'un dossier de fichiers
 * (repli local) ou de la mémoire du process (tests). Les échecs ne remontent
 * jamais à l'appelant : lecture ratée = cache miss, écriture ratée = log.
 *
 * FONCTIONNEMENT :
 * - Connexion : adresses Redis candidates essayées dans l'ordre (retries +
 *   backoff), puis dossier local si configuré, sinon mode "indisponible"
 * - Chaque opération a un timeout explicite et alimente `StoreMetrics`
 * - Valeurs JSON ; au-delà d'un seuil, compression gzip + marqueur `{key}#z`
 */

mod file;
mod memory;
mod metrics;
mod redis_backend;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use metrics::{Outcome, StoreMetrics, StoreMetricsSnapshot};
pub use redis_backend::RedisBackend;

use crate::retry::RetryPolicy;
use crate::scope::KeySpace;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Au-delà, l'entrée est écrite sans expiration
pub const MAX_EXPIRY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

fn bounded_ttl(ttl: Duration) -> Duration {
    if ttl > MAX_EXPIRY {
        Duration::ZERO
    } else {
        ttl
    }
}

/// Erreurs internes du store (jamais exposées hors de ce module)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cache backend unavailable")]
    Unavailable,
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub redis_urls: Vec<String>,
    pub connect_retry: RetryPolicy,
    pub op_timeout: Duration,
    pub compression_threshold: usize,
    pub file_dir: Option<PathBuf>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_urls: vec![
                "redis://redis:6379".to_string(),
                "redis://localhost:6379".to_string(),
                "redis://127.0.0.1:6379".to_string(),
            ],
            connect_retry: RetryPolicy::default(),
            op_timeout: Duration::from_secs(2),
            compression_threshold: 16 * 1024,
            file_dir: None,
        }
    }
}

#[derive(Clone)]
pub enum Backend {
    Redis(RedisBackend),
    File(FileBackend),
    Memory(MemoryBackend),
    Unavailable,
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Redis(_) => "redis",
            Backend::File(_) => "file",
            Backend::Memory(_) => "memory",
            Backend::Unavailable => "unavailable",
        }
    }
}

macro_rules! dispatch {
    ($backend:expr, $method:ident ( $($arg:expr),* )) => {
        match $backend {
            Backend::Redis(b) => b.$method($($arg),*).await,
            Backend::File(b) => b.$method($($arg),*).await,
            Backend::Memory(b) => b.$method($($arg),*).await,
            Backend::Unavailable => Err(StoreError::Unavailable),
        }
    };
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Clone)]
pub struct CacheStore {
    backend: Backend,
    metrics: Arc<StoreMetrics>,
    op_timeout: Duration,
    compression_threshold: usize,
}

impl CacheStore {
    pub fn new(backend: Backend, settings: &StoreSettings) -> Self {
        Self {
            backend,
            metrics: Arc::new(StoreMetrics::default()),
            op_timeout: settings.op_timeout,
            compression_threshold: settings.compression_threshold,
        }
    }

    /// Ne bloque jamais indéfiniment : finit au pire en mode indisponible
    pub async fn connect(settings: &StoreSettings) -> Self {
        let redis = RedisBackend::connect_first(
            &settings.redis_urls,
            &settings.connect_retry,
            settings.op_timeout,
        )
        .await;
        if let Some(redis) = redis {
            return Self::new(Backend::Redis(redis), settings);
        }
        if let Some(dir) = &settings.file_dir {
            match FileBackend::open(dir).await {
                Ok(file) => {
                    info!(dir = %dir.display(), "redis unreachable, using file cache store");
                    return Self::new(Backend::File(file), settings);
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "file cache store unusable"),
            }
        }
        warn!("no cache backend reachable, running with cache unavailable");
        Self::new(Backend::Unavailable, settings)
    }

    pub fn memory() -> Self {
        Self::new(Backend::Memory(MemoryBackend::new()), &StoreSettings::default())
    }

    pub fn unavailable() -> Self {
        Self::new(Backend::Unavailable, &StoreSettings::default())
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.backend, Backend::Unavailable)
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn marker_key(key: &str) -> String {
        format!("{key}{}", KeySpace::COMPRESSION_MARKER)
    }

    async fn timed<T, Fut>(
        &self,
        op: &'static str,
        key: &str,
        fut: Fut,
        classify: impl Fn(&T) -> Outcome,
    ) -> Option<T>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => {
                self.metrics.record(classify(&value), started.elapsed());
                Some(value)
            }
            Ok(Err(StoreError::Unavailable)) => {
                self.metrics.record(Outcome::Failure, started.elapsed());
                debug!(op, key, "cache store unavailable");
                None
            }
            Ok(Err(e)) => {
                self.metrics.record(Outcome::Failure, started.elapsed());
                warn!(op, key, error = %e, "cache store operation failed");
                None
            }
            Err(_) => {
                self.metrics.record(Outcome::Timeout, started.elapsed());
                warn!(op, key, timeout = ?self.op_timeout, "cache store operation timed out");
                None
            }
        }
    }

    /// Octets bruts (décompressés si besoin). `None` = miss, quelle qu'en soit la cause.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let raw = self
            .timed("get", key, async { dispatch!(&self.backend, get(key)) }, |v: &Option<Vec<u8>>| {
                if v.is_some() { Outcome::Hit } else { Outcome::Miss }
            })
            .await
            .flatten()?;

        let marker = Self::marker_key(key);
        let check_marker = async { dispatch!(&self.backend, exists(&marker)) };
        let flagged = self
            .timed("exists", &marker, check_marker, |_| Outcome::Other)
            .await
            .unwrap_or(false);
        if !flagged && !raw.starts_with(&GZIP_MAGIC) {
            return Some(raw);
        }
        match decompress(&raw) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(key, error = %e, "compressed cache payload is corrupt");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        let ttl = bounded_ttl(ttl);
        let marker = Self::marker_key(key);
        if value.len() > self.compression_threshold {
            let packed = match compress(value) {
                Ok(packed) => packed,
                Err(e) => {
                    warn!(key, error = %e, "compression failed, storing raw payload");
                    return self.set_plain(key, &marker, value, ttl).await;
                }
            };
            debug!(key, raw = value.len(), packed = packed.len(), "compressed cache payload");
            let write_marker = async { dispatch!(&self.backend, set(&marker, b"1", ttl)) };
            let flagged =
                self.timed("set", &marker, write_marker, |_| Outcome::Write).await.is_some();
            let write_payload = async { dispatch!(&self.backend, set(key, &packed, ttl)) };
            let stored = self.timed("set", key, write_payload, |_| Outcome::Write).await.is_some();
            flagged && stored
        } else {
            self.set_plain(key, &marker, value, ttl).await
        }
    }

    async fn set_plain(&self, key: &str, marker: &str, value: &[u8], ttl: Duration) -> bool {
        let write = async { dispatch!(&self.backend, set(key, value, ttl)) };
        let stored = self.timed("set", key, write, |_| Outcome::Write).await.is_some();
        if stored {
            let unmark = async { dispatch!(&self.backend, delete(marker)) };
            self.timed("delete", marker, unmark, |_| Outcome::Other).await;
        }
        stored
    }

    /// Désérialisation ratée = miss ; la clé corrompue est supprimée
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(key, error = %e, "undecodable cache payload, treating as miss");
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, &bytes, ttl).await,
            Err(e) => {
                warn!(key, error = %e, "cannot serialize cache payload");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.timed("exists", key, async { dispatch!(&self.backend, exists(key)) }, |found: &bool| {
            if *found { Outcome::Hit } else { Outcome::Miss }
        })
        .await
        .unwrap_or(false)
    }

    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        self.timed("ttl", key, async { dispatch!(&self.backend, ttl(key)) }, |_| Outcome::Other)
            .await
            .flatten()
    }

    pub async fn delete(&self, key: &str) -> bool {
        let marker = Self::marker_key(key);
        let unmark = async { dispatch!(&self.backend, delete(&marker)) };
        self.timed("delete", &marker, unmark, |_| Outcome::Other).await;
        let remove = async { dispatch!(&self.backend, delete(key)) };
        self.timed("delete", key, remove, |_| Outcome::Delete).await.unwrap_or(false)
    }

    pub async fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let scan = async { dispatch!(&self.backend, keys_matching(pattern)) };
        self.timed("keys", pattern, scan, |_| Outcome::Other).await.unwrap_or_default()
    }

    /// Suppression en masse (clear_cache) ; renvoie le nombre de clés supprimées
    pub async fn delete_matching(&self, pattern: &str) -> usize {
        let mut removed = 0;
        for key in self.keys_matching(pattern).await {
            let remove = async { dispatch!(&self.backend, delete(&key)) };
            if self.timed("delete", &key, remove, |_| Outcome::Delete).await.unwrap_or(false) {
                removed += 1;
            }
        }
        removed
    }
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Motifs façon Redis : `*` et `?` uniquement
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        names: Vec<String>,
    }

    fn small_threshold_store() -> CacheStore {
        let settings = StoreSettings {
            compression_threshold: 64,
            ..StoreSettings::default()
        };
        CacheStore::new(Backend::Memory(MemoryBackend::new()), &settings)
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a:b:*", "a:b:datastores:c1"));
        assert!(glob_match("a:?:c", "a:b:c"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("a:b:networks*", "a:b:datastores"));
        assert!(glob_match("a*c*e", "abcde"));
    }

    #[tokio::test]
    async fn test_large_values_are_compressed_with_marker() {
        let store = small_threshold_store();
        let payload = Payload {
            names: (0..50).map(|i| format!("datastore-{i}")).collect(),
        };
        assert!(store.set_json("k", &payload, Duration::from_secs(60)).await);
        assert!(store.exists("k#z").await);
        assert_eq!(store.get_json::<Payload>("k").await, Some(payload));

        // réécriture sous le seuil : le marqueur disparaît
        let small = Payload { names: vec!["a".into()] };
        assert!(store.set_json("k", &small, Duration::from_secs(60)).await);
        assert!(!store.exists("k#z").await);
        assert_eq!(store.get_json::<Payload>("k").await, Some(small));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_miss() {
        let store = CacheStore::memory();
        assert!(store.set("k", b"{not json", Duration::from_secs(60)).await);
        assert_eq!(store.get_json::<Payload>("k").await, None);
        assert!(!store.exists("k").await);
        assert_eq!(store.metrics().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_degenerates_to_misses() {
        let store = CacheStore::unavailable();
        assert!(!store.is_available());
        assert!(!store.set("k", b"v", Duration::from_secs(1)).await);
        assert_eq!(store.get("k").await, None);
        assert!(store.keys_matching("*").await.is_empty());
        assert!(store.metrics().failures >= 2);
    }

    #[tokio::test]
    async fn test_delete_matching_clears_scope() {
        let store = CacheStore::memory();
        for key in ["p:s:datacenters", "p:s:clusters:DC1", "p:other:datacenters"] {
            store.set(key, b"[]", Duration::from_secs(60)).await;
        }
        assert_eq!(store.delete_matching("p:s:*").await, 2);
        assert!(store.exists("p:other:datacenters").await);
    }

    #[tokio::test]
    async fn test_huge_ttl_is_stored_without_expiry() {
        let store = CacheStore::memory();
        assert!(store.set("k", b"[]", Duration::from_secs(999_999_999_999)).await);
        assert_eq!(store.get("k").await, Some(b"[]".to_vec()));
        assert_eq!(store.ttl("k").await, None);
    }
}
