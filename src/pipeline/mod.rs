//! Batch pipeline: newsletters in, curated document out.
//!
//! Every run moves through four stages:
//! 1. `ingest`: work items from the `IngestionSource` become newsletter entities
//! 2. `extract`: repository links are pulled out of each newsletter
//! 3. `classify`: repositories are enriched with metadata and categorized
//! 4. `generate`: classified repositories are checked, then rendered once
//!
//! Each stage's input is split into batches that are claimed, processed and
//! committed independently. A stage must drain before the next one starts.

pub mod coordinator;
pub mod links;
pub mod queue;
pub mod recovery;
pub mod render;
pub mod rules;
pub mod stages;
pub mod state;
pub mod types;

pub use coordinator::{Collaborators, PipelineCoordinator};
pub use queue::BatchQueue;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use render::{DocumentRenderer, MarkdownRenderer};
pub use rules::{Classifier, KeywordClassifier};
pub use state::RunPhase;
