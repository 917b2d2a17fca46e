//! Stage handler trait: the per-stage unit of work a pool executes.

use async_trait::async_trait;

use crate::pipeline::types::{ItemOutcome, Stage, StageItem};

/// Processes the items of one batch.
///
/// Implementations never touch the store. They return one outcome per item;
/// the pool hands the outcomes to `commit_batch_result`.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage this handler serves.
    fn stage(&self) -> Stage;

    /// Process one item.
    async fn process_item(&self, item: &StageItem) -> ItemOutcome;
}
