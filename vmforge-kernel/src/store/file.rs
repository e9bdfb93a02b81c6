use super::{glob_match, StoreError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use uuid::Uuid;

/// Enveloppe d'un fichier de cache : la clé d'origine est conservée pour les scans
#[derive(Debug, Serialize, Deserialize)]
struct FileEnvelope {
    key: String,
    expires_at: Option<i64>,
    data: String,
}

impl FileEnvelope {
    fn expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

/// Backend de repli : un fichier JSON par clé dans un dossier local
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(&digest[..16])))
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    async fn read_envelope(&self, path: &Path) -> Result<Option<FileEnvelope>, StoreError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: FileEnvelope = serde_json::from_slice(&raw)?;
        if envelope.expired(Self::now()) {
            let _ = fs::remove_file(path).await;
            return Ok(None);
        }
        Ok(Some(envelope))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.read_envelope(&self.path_for(key)).await? {
            Some(envelope) => {
                let bytes = BASE64
                    .decode(envelope.data.as_bytes())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let envelope = FileEnvelope {
            key: key.to_string(),
            expires_at: (!ttl.is_zero()).then(|| {
                let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
                Self::now().saturating_add(secs)
            }),
            data: BASE64.encode(value),
        };
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec(&envelope)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read_envelope(&self.path_for(key)).await?.is_some())
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Self::now();
        Ok(self
            .read_envelope(&self.path_for(key))
            .await?
            .and_then(|e| e.expires_at)
            .map(|t| Duration::from_secs((t - now).max(0) as u64)))
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match self.read_envelope(&path).await {
                Ok(Some(envelope)) if glob_match(pattern, &envelope.key) => keys.push(envelope.key),
                Ok(_) => {}
                Err(e) => tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable cache file"
                ),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
