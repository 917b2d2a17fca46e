//! Rate-limited, deadline-bounded, retrying wrapper around one dependency.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::rate_limiter::RateLimiter;
use crate::client::retry::RetryConfig;
use crate::config::ClientConfig;
use crate::error::ClientError;

/// Gateway for every call to one external dependency.
///
/// Construct one per dependency; instances share no quota.
#[derive(Debug)]
pub struct RateLimitedClient {
    name: String,
    limiter: RateLimiter,
    retry: RetryConfig,
    acquire_timeout: Duration,
    call_deadline: Duration,
}

impl RateLimitedClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            name: config.name.clone(),
            limiter: RateLimiter::new(&config.name, config.requests_per_second, config.burst),
            retry: RetryConfig::from(config),
            acquire_timeout: config.acquire_timeout,
            call_deadline: config.call_deadline,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run `op` under the quota.
    ///
    /// Each attempt takes a token and is bounded by the call deadline (a
    /// timeout counts as `Transient`). `Transient` failures are retried with
    /// backoff; `Permanent` and `RateLimited` return at once. A server
    /// rate limit carrying `retry_after` blocks this client's bucket.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 1u32;
        loop {
            self.limiter.acquire(self.acquire_timeout).await?;

            let result = match tokio::time::timeout(self.call_deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Transient {
                    client: self.name.clone(),
                    reason: format!("call exceeded deadline of {:?}", self.call_deadline),
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(ClientError::Transient { reason, .. }) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    debug!(
                        client = %self.name,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay = ?delay,
                        %reason,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err @ ClientError::RateLimited { retry_after, .. }) => {
                    if let Some(hint) = retry_after {
                        warn!(client = %self.name, retry_after = ?hint, "Server rate limit");
                        self.limiter.block_for(hint).await;
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_config(name: &str) -> ClientConfig {
        ClientConfig {
            requests_per_second: 1000.0,
            burst: 100,
            acquire_timeout: Duration::from_millis(100),
            call_deadline: Duration::from_millis(100),
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..ClientConfig::named(name)
        }
    }

    fn transient(name: &str) -> ClientError {
        ClientError::Transient {
            client: name.into(),
            reason: "503".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = RateLimitedClient::new(&fast_config("meta"));
        let calls = AtomicU32::new(0);

        let value = client
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient("meta"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_give_up_after_max_attempts() {
        let client = RateLimitedClient::new(&fast_config("meta"));
        let calls = AtomicU32::new(0);

        let err = client
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient("meta")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transient { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let client = RateLimitedClient::new(&fast_config("meta"));
        let calls = AtomicU32::new(0);

        let err = client
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ClientError::Permanent {
                        client: "meta".into(),
                        reason: "404".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_counts_as_transient() {
        let config = ClientConfig {
            max_attempts: 1,
            call_deadline: Duration::from_millis(10),
            ..fast_config("slow")
        };
        let client = RateLimitedClient::new(&config);
        let err = client
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ClientError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transient { .. }));
    }

    #[tokio::test]
    async fn server_rate_limit_blocks_only_this_client() {
        let limited = RateLimitedClient::new(&fast_config("limited"));
        let other = RateLimitedClient::new(&fast_config("other"));

        let err = limited
            .call(|| async {
                Err::<(), _>(ClientError::RateLimited {
                    client: "limited".into(),
                    retry_after: Some(Duration::from_secs(60)),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RateLimited { .. }));

        // The blocked bucket refuses quickly instead of hanging the caller.
        let err = limited.call(|| async { Ok::<_, ClientError>(()) }).await;
        assert!(matches!(err, Err(ClientError::RateLimited { .. })));

        // A different dependency is unaffected.
        other.call(|| async { Ok::<_, ClientError>(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_bucket_fails_rate_limited() {
        let config = ClientConfig {
            requests_per_second: 0.01,
            burst: 1,
            acquire_timeout: Duration::from_millis(20),
            ..fast_config("tiny")
        };
        let client = RateLimitedClient::new(&config);
        client.call(|| async { Ok::<_, ClientError>(()) }).await.unwrap();
        let err = client
            .call(|| async { Ok::<_, ClientError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RateLimited { .. }));
    }
}
