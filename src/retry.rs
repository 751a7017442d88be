use rand::seq::IndexedRandom;
use std::future::Future;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::error::Result;

/// Static list of egress proxies. Health is not tracked between calls.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    proxies: Vec<String>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<String>) -> Self {
        Self { proxies }
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn pick(&self) -> Option<&str> {
        self.proxies.choose(&mut rand::rng()).map(String::as_str)
    }
}

/// One retry policy shared by every client: bounded attempts, fixed pause,
/// and only transient errors are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            delay: s.delay(),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` directly first, then through a freshly drawn proxy on every retry.
    /// The closure receives the proxy for that attempt (`None` means direct).
    pub async fn run<T, F, Fut>(&self, pool: &ProxyPool, mut op: F) -> Result<T>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        let mut proxy: Option<String> = None;
        loop {
            match op(proxy.clone()).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, proxy = ?proxy, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    proxy = pool.pick().map(str::to_string);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        next_proxy = ?proxy,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(attempt, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScrapeError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn third_attempt_succeeds_after_two_connection_errors() {
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());
        let pool = ProxyPool::new(vec!["http://p1:8080".into(), "http://p2:8080".into()]);

        let out = fast_policy(3)
            .run(&pool, |proxy| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                seen.lock().unwrap().push(proxy);
                async move {
                    if n < 3 {
                        Err(ScrapeError::Timeout)
                    } else {
                        Ok("body")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "body");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let seen = seen.lock().unwrap();
        assert!(seen[0].is_none(), "first attempt goes direct");
        assert!(seen[1].is_some() && seen[2].is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(2)
            .run(&ProxyPool::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ScrapeError::Timeout) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(5)
            .run(&ProxyPool::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ScrapeError::Decode("garbage".into())) }
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_pool_picks_nothing() {
        assert!(ProxyPool::default().pick().is_none());
        assert!(ProxyPool::default().is_empty());
    }
}
