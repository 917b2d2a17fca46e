//! Error types for the curator pipeline.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// A mutation raced with another owner (e.g. committing a batch that is
    /// no longer `processing` under this owner). Should not happen by
    /// construction; callers treat it as fatal for the batch.
    #[error("Store conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: String,
        id: String,
        reason: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Failure of a call to an external dependency.
///
/// The variant decides retry policy: `RateLimited` and `Transient` are
/// retryable, `Permanent` is recorded against the item and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("{client} rate limited (retry after {retry_after:?})")]
    RateLimited {
        client: String,
        retry_after: Option<Duration>,
    },

    #[error("{client} transient failure: {reason}")]
    Transient { client: String, reason: String },

    #[error("{client} permanent failure: {reason}")]
    Permanent { client: String, reason: String },
}

impl ClientError {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }

    /// Name of the client that produced the error.
    pub fn client(&self) -> &str {
        match self {
            Self::RateLimited { client, .. }
            | Self::Transient { client, .. }
            | Self::Permanent { client, .. } => client,
        }
    }
}

/// Pipeline orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ingestion failed: {0}")]
    Ingestion(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    /// The run was cancelled between batches and can be resumed.
    #[error("Run cancelled")]
    Cancelled,

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let limited = ClientError::RateLimited {
            client: "github".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        let transient = ClientError::Transient {
            client: "github".into(),
            reason: "502".into(),
        };
        let permanent = ClientError::Permanent {
            client: "github".into(),
            reason: "404".into(),
        };
        assert!(limited.is_retryable());
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.client(), "github");
    }

    #[test]
    fn conflict_message_names_the_row() {
        let err = DatabaseError::Conflict {
            entity: "batch".into(),
            id: "b-1".into(),
            reason: "not processing".into(),
        };
        assert_eq!(err.to_string(), "Store conflict on batch b-1: not processing");
    }
}
