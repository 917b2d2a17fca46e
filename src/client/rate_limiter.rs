//! Token bucket rate limiting for one external dependency.
//!
//! The bucket refills continuously at `refill_rate` tokens per second up to
//! `capacity`. A server-reported rate limit blocks the bucket outright until
//! the hinted instant has passed.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::error::ClientError;

/// Token bucket state. Not synchronized; see [`RateLimiter`].
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    /// A full bucket holding `burst` tokens, refilled at `requests_per_second`.
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_rate: requests_per_second,
            last_refill: Instant::now(),
            blocked_until: None,
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.is_blocked() {
            return false;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token may be taken.
    pub fn time_until_available(&mut self) -> Duration {
        self.refill();
        let now = Instant::now();
        let blocked = self
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let refill = if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        };
        blocked.max(refill)
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Refuse tokens until `until`. An earlier block never shortens a later one.
    pub fn block_until(&mut self, until: Instant) {
        self.blocked_until = Some(match self.blocked_until {
            Some(current) if current > until => current,
            _ => until,
        });
        self.tokens = 0.0;
    }

    fn is_blocked(&mut self) -> bool {
        match self.blocked_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.blocked_until = None;
                false
            }
            None => false,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Shared, cancel-safe front of a [`TokenBucket`].
///
/// The mutex is only held for synchronous bucket operations, never across a
/// sleep, so a waiting caller blocks neither other callers nor other clients.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, requests_per_second: f64, burst: u32) -> Self {
        Self {
            name: name.into(),
            bucket: Mutex::new(TokenBucket::new(requests_per_second, burst)),
        }
    }

    /// Acquire a token, waiting at most `timeout`.
    ///
    /// Returns the time waited, or `RateLimited` as soon as it is clear that
    /// no token will free up before the timeout.
    pub async fn acquire(&self, timeout: Duration) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_acquire() {
                    return Ok(started.elapsed());
                }
                bucket.time_until_available()
            };

            let now = Instant::now();
            if now + wait > deadline {
                return Err(ClientError::RateLimited {
                    client: self.name.clone(),
                    retry_after: Some(wait),
                });
            }

            trace!(client = %self.name, wait = ?wait, "rate limited");
            // A zero wait means another caller took the token first; yield and retry.
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Block the bucket for `duration` after a server-side rate limit.
    pub async fn block_for(&self, duration: Duration) {
        let mut bucket = self.bucket.lock().await;
        bucket.block_until(Instant::now() + duration);
    }

    pub async fn available_tokens(&self) -> f64 {
        self.bucket.lock().await.available_tokens()
    }
}
