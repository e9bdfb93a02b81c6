use super::{glob_match, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Backend en mémoire de process (tests, dev sans Redis)
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entry: &'a (Vec<u8>, Option<Instant>), now: Instant) -> Option<&'a Vec<u8>> {
        match entry.1 {
            Some(deadline) if deadline <= now => None,
            _ => Some(&entry.0),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let value = entries.get(key).and_then(|e| Self::live(e, now)).cloned();
        if value.is_none() {
            entries.remove(key);
        }
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let deadline = (!ttl.is_zero()).then(|| Instant::now().checked_add(ttl)).flatten();
        self.entries.lock().insert(key.to_string(), (value.to_vec(), deadline));
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries.get(key).and_then(|(_, deadline)| match deadline {
            Some(d) if *d > now => Some(*d - now),
            _ => None,
        }))
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    pub async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| Self::live(e, now).is_some() && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let backend = MemoryBackend::new();
        backend.set("k", b"v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(backend.ttl("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_matching_uses_glob() {
        let backend = MemoryBackend::new();
        for key in ["p:s:datastores:c1", "p:s:datastores:c1#z", "p:s:networks:c1"] {
            backend.set(key, b"x", Duration::ZERO).await.unwrap();
        }
        let keys = backend.keys_matching("p:s:datastores*").await.unwrap();
        assert_eq!(keys, vec!["p:s:datastores:c1", "p:s:datastores:c1#z"]);
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_means_no_expiry() {
        let backend = MemoryBackend::new();
        backend.set("k", b"v", Duration::MAX).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.ttl("k").await.unwrap(), None);
    }
}
