//! Batch queue: splits incoming items into bounded batches per stage.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{Batch, NewBatches, QueueItem, Stage};
use crate::store::traits::DurableStore;

/// Thin facade over the store's batch tables.
#[derive(Clone)]
pub struct BatchQueue {
    store: Arc<dyn DurableStore>,
}

impl BatchQueue {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Admit `items` to `stage` as batches of at most `max_batch_size`.
    ///
    /// Items keep their arrival order inside each batch. All batches are
    /// created in one transaction, together with the stage admission marker
    /// and `source_cursor` when given.
    pub async fn enqueue(
        &self,
        run_id: Uuid,
        stage: Stage,
        items: Vec<QueueItem>,
        max_batch_size: usize,
        source_cursor: Option<String>,
    ) -> Result<Vec<Batch>, DatabaseError> {
        let chunks = chunk(items, max_batch_size);
        debug!(run_id = %run_id, stage = %stage, chunks = chunks.len(), "Enqueueing");
        self.store
            .create_batches(NewBatches {
                run_id,
                stage,
                chunks,
                source_cursor,
            })
            .await
    }

    /// Number of batches waiting for a worker.
    pub async fn peek_depth(&self, stage: Stage) -> Result<u32, DatabaseError> {
        self.store.peek_depth(stage).await
    }
}

/// Split into consecutive chunks of at most `size` items.
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[test]
    fn chunk_preserves_order_and_bounds() {
        let chunks = chunk((1..=7).collect(), 3);
        assert_eq!(chunks, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
        assert!(chunk(Vec::<u8>::new(), 3).is_empty());
        assert_eq!(chunk(vec![1, 2], 0), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn enqueue_creates_bounded_batches() {
        let store: Arc<dyn DurableStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let run = store.create_run().await.unwrap();
        let queue = BatchQueue::new(store.clone());

        let items = (0..5)
            .map(|i| QueueItem::Entity(format!("k{i}")))
            .collect();
        let batches = queue
            .enqueue(run.run_id, Stage::Extract, items, 2, None)
            .await
            .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].items, vec!["k0", "k1"]);
        assert_eq!(batches[2].items, vec!["k4"]);
        assert_eq!(queue.peek_depth(Stage::Extract).await.unwrap(), 3);
        assert_eq!(queue.peek_depth(Stage::Classify).await.unwrap(), 0);
    }
}
