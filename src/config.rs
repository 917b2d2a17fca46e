//! Configuration types.
//!
//! Every config struct has sane defaults and a `from_env()` constructor.
//! Lookups go through a closure so tests never touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Pipeline orchestration configuration (`CURATOR_*`).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Where the generated document is written.
    pub output_path: PathBuf,
    /// Upper bound on items per batch.
    pub max_batch_size: usize,
    /// Number of concurrent workers per stage.
    pub concurrency: usize,
    /// Items processed concurrently inside one batch.
    pub item_concurrency: usize,
    /// Consecutive empty claims before a worker considers the stage quiescent.
    pub empty_polls: u32,
    /// Sleep between empty claims.
    pub poll_interval: Duration,
    /// Transient-failure attempts an item gets before it is recorded as skipped.
    pub max_item_attempts: u32,
    /// A drained stage with a higher failed-batch ratio moves the run to ERROR.
    pub failure_ratio_threshold: f64,
    /// Heartbeat age after which a `processing` batch's owner is presumed dead.
    pub orphan_lease: Duration,
    /// Base delay before a requeued batch becomes claimable again.
    pub requeue_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/curator.db"),
            output_path: PathBuf::from("./README.md"),
            max_batch_size: 25,
            concurrency: 4,
            item_concurrency: 1,
            empty_polls: 3,
            poll_interval: Duration::from_millis(200),
            max_item_attempts: 5,
            failure_ratio_threshold: 0.5,
            orphan_lease: Duration::from_secs(600), // 10 minutes
            requeue_delay: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            db_path: lookup("CURATOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            output_path: lookup("CURATOR_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            max_batch_size: parse_or(&lookup, "CURATOR_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            concurrency: parse_or(&lookup, "CURATOR_CONCURRENCY", defaults.concurrency)?,
            item_concurrency: parse_or(
                &lookup,
                "CURATOR_ITEM_CONCURRENCY",
                defaults.item_concurrency,
            )?,
            empty_polls: parse_or(&lookup, "CURATOR_EMPTY_POLLS", defaults.empty_polls)?,
            poll_interval: millis_or(&lookup, "CURATOR_POLL_INTERVAL_MS", defaults.poll_interval)?,
            max_item_attempts: parse_or(
                &lookup,
                "CURATOR_MAX_ITEM_ATTEMPTS",
                defaults.max_item_attempts,
            )?,
            failure_ratio_threshold: parse_or(
                &lookup,
                "CURATOR_FAILURE_RATIO",
                defaults.failure_ratio_threshold,
            )?,
            orphan_lease: Duration::from_secs(parse_or(
                &lookup,
                "CURATOR_ORPHAN_LEASE_SECS",
                defaults.orphan_lease.as_secs(),
            )?),
            requeue_delay: millis_or(&lookup, "CURATOR_REQUEUE_DELAY_MS", defaults.requeue_delay)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or misreport the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(invalid("CURATOR_MAX_BATCH_SIZE", "must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("CURATOR_CONCURRENCY", "must be at least 1"));
        }
        if self.item_concurrency == 0 {
            return Err(invalid("CURATOR_ITEM_CONCURRENCY", "must be at least 1"));
        }
        if self.empty_polls == 0 {
            return Err(invalid("CURATOR_EMPTY_POLLS", "must be at least 1"));
        }
        if self.max_item_attempts == 0 {
            return Err(invalid("CURATOR_MAX_ITEM_ATTEMPTS", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio_threshold) {
            return Err(invalid("CURATOR_FAILURE_RATIO", "must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Quota and retry policy for one external dependency.
///
/// Each dependency reads its own prefixed variables, e.g.
/// `CURATOR_GITHUB_RPS` or `CURATOR_CLASSIFIER_MAX_ATTEMPTS`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client name used in logs and errors.
    pub name: String,
    /// Sustained requests per second (token refill rate).
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
    /// Longest a caller waits for a token before failing `RateLimited`.
    pub acquire_timeout: Duration,
    /// Deadline for a single external call.
    pub call_deadline: Duration,
    /// Attempts for transient failures (including the first).
    pub max_attempts: u32,
    /// First backoff delay.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl ClientConfig {
    /// Defaults for a named client.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requests_per_second: 1.0,
            burst: 5,
            acquire_timeout: Duration::from_secs(30),
            call_deadline: Duration::from_secs(20),
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }

    /// Build config for `name` from `CURATOR_<NAME>_*` environment variables.
    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(name, |key| std::env::var(key).ok())
    }

    /// Build config for `name` from an arbitrary key lookup.
    pub fn from_lookup(
        name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let prefix = format!("CURATOR_{}", name.to_uppercase());
        let defaults = Self::named(name);
        let config = Self {
            requests_per_second: parse_or(
                &lookup,
                &format!("{prefix}_RPS"),
                defaults.requests_per_second,
            )?,
            burst: parse_or(&lookup, &format!("{prefix}_BURST"), defaults.burst)?,
            acquire_timeout: millis_or(
                &lookup,
                &format!("{prefix}_ACQUIRE_TIMEOUT_MS"),
                defaults.acquire_timeout,
            )?,
            call_deadline: millis_or(
                &lookup,
                &format!("{prefix}_CALL_DEADLINE_MS"),
                defaults.call_deadline,
            )?,
            max_attempts: parse_or(
                &lookup,
                &format!("{prefix}_MAX_ATTEMPTS"),
                defaults.max_attempts,
            )?,
            ..defaults
        };
        if !config.requests_per_second.is_finite() || config.requests_per_second <= 0.0 {
            return Err(invalid(
                &format!("{prefix}_RPS"),
                "must be a positive finite number",
            ));
        }
        if config.burst == 0 || config.max_attempts == 0 {
            return Err(invalid(&prefix, "burst and max attempts must be at least 1"));
        }
        Ok(config)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let millis: u64 = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
