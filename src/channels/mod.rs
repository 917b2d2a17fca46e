//! External collaborators the pipeline consumes.
//!
//! - `maildir`: newsletter ingestion from a directory of `.eml` files
//! - `github`: repository metadata from the GitHub REST API
//!
//! Stages only see the traits below; concrete adapters are injected once at
//! startup and every call to them goes through a `RateLimitedClient`.

pub mod github;
pub mod maildir;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::pipeline::types::WorkItem;

pub use github::{GitHubConfig, GitHubMetadataSource};
pub use maildir::{MaildirConfig, MaildirSource};

/// New items returned by one `fetch_new` call.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub items: Vec<WorkItem>,
    /// Cursor to pass on the next call. `None` keeps the previous one.
    pub cursor: Option<String>,
}

/// A source of raw work items (newsletters).
#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// Source name recorded on every work item.
    fn name(&self) -> &str;

    /// Items discovered after `since_cursor` (everything when `None`).
    ///
    /// The same item may be returned again; the store deduplicates by
    /// `external_id`.
    async fn fetch_new(&self, since_cursor: Option<&str>) -> Result<SourceBatch, ClientError>;
}

/// Public metadata for one repository.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub full_name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub stars: u64,
    pub archived: bool,
    pub homepage: Option<String>,
}

/// Result of a metadata lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataLookup {
    Found(RepoMetadata),
    /// The repository does not exist (or is private).
    NotFound,
}

/// A source of repository metadata, keyed by canonical repository URL.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self, key: &str) -> Result<MetadataLookup, ClientError>;
}
