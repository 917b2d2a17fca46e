//! Quota-aware access to external dependencies.

pub mod limited;
pub mod rate_limiter;
pub mod retry;

pub use limited::RateLimitedClient;
pub use rate_limiter::{RateLimiter, TokenBucket};
pub use retry::RetryConfig;
