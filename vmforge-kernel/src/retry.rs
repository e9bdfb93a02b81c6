//! Retry avec backoff exponentiel, sous forme de fonctions d'ordre supérieur.
//!
//! Utilisé autour de la connexion vCenter (bloquante) et du sondage des
//! adresses Redis candidates (async).

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Délai avant la tentative `attempt + 1` (attempt commence à 1)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_backoff.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

/// Version bloquante : à appeler depuis le pool bloquant de tokio
pub fn retry_blocking<T, E, F, P>(policy: &RetryPolicy, is_retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                std::thread::sleep(policy.backoff_for(attempt));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn retry_async<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                tokio::time::sleep(policy.backoff_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_blocking_stops_on_success() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = retry_blocking(&fast(), |_| true, |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 2 { Err("flaky") } else { Ok(attempt) }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_non_retryable_error_is_returned_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), &str> = retry_blocking(&fast(), |e| *e != "auth", |_| {
            calls.set(calls.get() + 1);
            Err("auth")
        });
        assert_eq!(result, Err("auth"));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_retry_async_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), String> = retry_async(&fast(), |_| true, |_| {
            calls += 1;
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
