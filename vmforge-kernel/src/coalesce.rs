use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Un seul chargement à la fois par clé ; les suivants attendent leur tour
#[derive(Default)]
pub struct LoadCoalescer {
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LoadCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self.inflight.lock().await;
            // verrous plus référencés par personne
            inflight.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            Arc::clone(inflight.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        lock.lock_owned().await
    }

    pub async fn tracked_keys(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let coalescer = Arc::new(LoadCoalescer::new());
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (c, a, p) = (coalescer.clone(), active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _turn = c.acquire("datacenters").await;
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unused_locks_are_pruned() {
        let coalescer = LoadCoalescer::new();
        drop(coalescer.acquire("a").await);
        drop(coalescer.acquire("b").await);
        drop(coalescer.acquire("c").await);
        assert_eq!(coalescer.tracked_keys().await, 1);
    }
}
