use super::StoreError;
use crate::retry::{retry_async, RetryPolicy};
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Backend Redis (production) sur une connexion multiplexée partagée
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    url: String,
}

impl RedisBackend {
    /// Essaie chaque adresse candidate dans l'ordre, avec retries + backoff par hôte.
    /// Renvoie `None` si aucune ne répond : le store passe alors en mode dégradé.
    pub async fn connect_first(
        candidates: &[String],
        policy: &RetryPolicy,
        op_timeout: Duration,
    ) -> Option<Self> {
        for url in candidates {
            let attempt = retry_async(policy, |_: &StoreError| true, |n| {
                let url = url.clone();
                async move {
                    debug!(%url, attempt = n, "probing redis");
                    Self::connect(&url, op_timeout).await
                }
            })
            .await;
            match attempt {
                Ok(backend) => {
                    info!(url = %backend.url, "redis cache store connected");
                    return Some(backend);
                }
                Err(e) => warn!(%url, error = %e, "redis candidate unreachable"),
            }
        }
        None
    }

    async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))??;
        let pong: String = timeout(op_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))??;
        debug!(%url, %pong, "redis answered");
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    /// -2 (absente) et -1 (sans expiration) donnent `None`
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    /// SCAN plutôt que KEYS pour ne pas bloquer le serveur
    pub async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
