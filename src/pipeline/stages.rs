//! Stage handlers: what each pipeline stage does to one item.
//!
//! Handlers only compute outcomes. Every external call goes through the
//! dependency's `RateLimitedClient`, and every side effect is returned as an
//! `EntityWrite` for the store to apply when the batch commits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::channels::{MetadataLookup, MetadataSource};
use crate::client::RateLimitedClient;
use crate::pipeline::links::extract_repositories;
use crate::pipeline::rules::Classifier;
use crate::pipeline::types::{
    Classification, EntityKind, EntityStatus, EntityWrite, ItemOutcome, Stage, StageItem,
};
use crate::worker::StageHandler;

/// Payload fields of a newsletter that may contain links.
const TEXT_FIELDS: &[&str] = &["subject", "body_text", "body_html", "text"];

// ── Ingest ──────────────────────────────────────────────────────────

/// Turns work items into newsletter entities.
pub struct IngestHandler;

#[async_trait]
impl StageHandler for IngestHandler {
    fn stage(&self) -> Stage {
        Stage::Ingest
    }

    async fn process_item(&self, item: &StageItem) -> ItemOutcome {
        ItemOutcome::succeeded(
            &item.key,
            vec![EntityWrite::mention(
                &item.key,
                EntityKind::Newsletter,
                item.payload.clone(),
                item.mentions.max(1),
                item.seen_at,
            )],
        )
    }
}

// ── Extract ─────────────────────────────────────────────────────────

/// Pulls repository links out of a newsletter.
pub struct ExtractHandler;

#[async_trait]
impl StageHandler for ExtractHandler {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn process_item(&self, item: &StageItem) -> ItemOutcome {
        let text = TEXT_FIELDS
            .iter()
            .filter_map(|field| item.payload.get(*field).and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n");

        let writes: Vec<EntityWrite> = extract_repositories(&text)
            .into_iter()
            .map(|repo| {
                let key = repo.canonical_url();
                EntityWrite::mention(
                    key.clone(),
                    EntityKind::Repository,
                    json!({ "url": key, "owner": repo.owner, "name": repo.name }),
                    1,
                    item.seen_at,
                )
            })
            .collect();

        debug!(newsletter = %item.key, links = writes.len(), "Extracted repository links");
        ItemOutcome::succeeded(&item.key, writes)
    }
}

// ── Classify ────────────────────────────────────────────────────────

/// Enriches a repository with metadata and assigns categories.
pub struct ClassifyHandler {
    metadata: Arc<dyn MetadataSource>,
    metadata_client: Arc<RateLimitedClient>,
    classifier: Arc<dyn Classifier>,
    classifier_client: Arc<RateLimitedClient>,
}

impl ClassifyHandler {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        metadata_client: Arc<RateLimitedClient>,
        classifier: Arc<dyn Classifier>,
        classifier_client: Arc<RateLimitedClient>,
    ) -> Self {
        Self {
            metadata,
            metadata_client,
            classifier,
            classifier_client,
        }
    }
}

#[async_trait]
impl StageHandler for ClassifyHandler {
    fn stage(&self) -> Stage {
        Stage::Classify
    }

    async fn process_item(&self, item: &StageItem) -> ItemOutcome {
        let Some(entity) = &item.entity else {
            return ItemOutcome::skipped(&item.key, "entity missing");
        };

        let lookup = self
            .metadata_client
            .call(|| self.metadata.fetch_metadata(&item.key))
            .await;
        let metadata = match lookup {
            Ok(MetadataLookup::Found(metadata)) => metadata,
            Ok(MetadataLookup::NotFound) => {
                return ItemOutcome::skipped(&item.key, "repository not found");
            }
            Err(e) => return ItemOutcome::from_client_error(&item.key, &e),
        };

        let metadata_payload = match serde_json::to_value(&metadata) {
            Ok(value) => value,
            Err(e) => return ItemOutcome::skipped(&item.key, format!("bad metadata: {e}")),
        };
        let mut enriched = entity.clone();
        if let (Some(target), Some(fields)) =
            (enriched.payload.as_object_mut(), metadata_payload.as_object())
        {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }

        let classified = self
            .classifier_client
            .call(|| self.classifier.classify(&enriched))
            .await;
        let classifications = match classified {
            Ok(classifications) => best_per_scheme(&item.key, classifications),
            Err(e) => return ItemOutcome::from_client_error(&item.key, &e),
        };

        let status = if metadata.archived {
            EntityStatus::Archived
        } else {
            EntityStatus::Active
        };
        ItemOutcome::succeeded(
            &item.key,
            vec![
                EntityWrite::update(&item.key)
                    .with_payload(metadata_payload)
                    .with_status(status)
                    .with_classifications(classifications),
            ],
        )
    }
}

/// Keep the most confident classification per scheme, bound to `key`.
///
/// Confidence is clamped to `[0, 1]`; rows with an empty scheme or category
/// are dropped so one odd answer cannot fail the whole batch.
fn best_per_scheme(key: &str, classifications: Vec<Classification>) -> Vec<Classification> {
    let mut best: HashMap<String, Classification> = HashMap::new();
    for mut c in classifications {
        if c.scheme.trim().is_empty() || c.category.trim().is_empty() || c.confidence.is_nan() {
            continue;
        }
        c.entity_key = key.to_string();
        c.confidence = c.confidence.clamp(0.0, 1.0);
        c.superseded_at = None;
        match best.get(&c.scheme) {
            Some(existing) if existing.confidence >= c.confidence => {}
            _ => {
                best.insert(c.scheme.clone(), c);
            }
        }
    }
    let mut out: Vec<_> = best.into_values().collect();
    out.sort_by(|a, b| a.scheme.cmp(&b.scheme));
    out
}

// ── Generate ────────────────────────────────────────────────────────

/// Checks that a repository is ready to appear in the document.
pub struct GenerateHandler;

#[async_trait]
impl StageHandler for GenerateHandler {
    fn stage(&self) -> Stage {
        Stage::Generate
    }

    async fn process_item(&self, item: &StageItem) -> ItemOutcome {
        match &item.entity {
            None => ItemOutcome::skipped(&item.key, "entity missing"),
            Some(_) if item.classifications.is_empty() => {
                ItemOutcome::skipped(&item.key, "unclassified")
            }
            Some(_) => ItemOutcome::succeeded(&item.key, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::channels::RepoMetadata;
    use crate::config::ClientConfig;
    use crate::error::ClientError;
    use crate::pipeline::rules::KeywordClassifier;
    use crate::pipeline::types::{Entity, ItemResult, RetryKind};

    fn client(name: &str) -> Arc<RateLimitedClient> {
        Arc::new(RateLimitedClient::new(&ClientConfig {
            requests_per_second: 1000.0,
            burst: 100,
            max_attempts: 1,
            acquire_timeout: Duration::from_millis(100),
            ..ClientConfig::named(name)
        }))
    }

    fn repo_item(key: &str) -> StageItem {
        let entity = Entity {
            canonical_key: key.into(),
            kind: EntityKind::Repository,
            payload: json!({ "url": key }),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            mention_count: 1,
            status: EntityStatus::Active,
            vector_ref: None,
        };
        StageItem {
            key: key.into(),
            payload: entity.payload.clone(),
            mentions: 0,
            seen_at: entity.last_seen,
            entity: Some(entity),
            classifications: Vec::new(),
        }
    }

    struct StubMetadata {
        result: Result<MetadataLookup, ClientError>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MetadataSource for StubMetadata {
        async fn fetch_metadata(&self, _key: &str) -> Result<MetadataLookup, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn classify_handler(result: Result<MetadataLookup, ClientError>) -> ClassifyHandler {
        ClassifyHandler::new(
            Arc::new(StubMetadata {
                result,
                calls: AtomicU32::new(0),
            }),
            client("github"),
            Arc::new(KeywordClassifier::default_rules().unwrap()),
            client("classifier"),
        )
    }

    #[tokio::test]
    async fn ingest_counts_merged_mentions() {
        let item = StageItem {
            key: "msg-1".into(),
            payload: json!({ "subject": "hi" }),
            mentions: 2,
            seen_at: Utc::now(),
            entity: None,
            classifications: Vec::new(),
        };
        let outcome = IngestHandler.process_item(&item).await;
        let ItemResult::Succeeded { writes } = outcome.result else {
            panic!("expected success");
        };
        assert_eq!(writes[0].add_mentions, 2);
        assert_eq!(writes[0].kind, Some(EntityKind::Newsletter));
    }

    #[tokio::test]
    async fn extract_dedupes_links_within_newsletter() {
        let item = StageItem {
            key: "msg-1".into(),
            payload: json!({
                "body_text": "https://github.com/a/b and again github.com/A/B",
                "body_html": "<a href=\"https://github.com/c/d\">d</a>",
            }),
            mentions: 1,
            seen_at: Utc::now(),
            entity: None,
            classifications: Vec::new(),
        };
        let outcome = ExtractHandler.process_item(&item).await;
        let ItemResult::Succeeded { writes } = outcome.result else {
            panic!("expected success");
        };
        let keys: Vec<_> = writes.iter().map(|w| w.canonical_key.as_str()).collect();
        assert_eq!(keys, vec!["https://github.com/a/b", "https://github.com/c/d"]);
        assert!(writes.iter().all(|w| w.add_mentions == 1));
    }

    #[tokio::test]
    async fn extract_without_links_succeeds_empty() {
        let item = StageItem {
            key: "msg-2".into(),
            payload: json!({ "body_text": "no links here" }),
            mentions: 1,
            seen_at: Utc::now(),
            entity: None,
            classifications: Vec::new(),
        };
        let outcome = ExtractHandler.process_item(&item).await;
        assert_eq!(outcome, ItemOutcome::succeeded("msg-2", Vec::new()));
    }

    #[tokio::test]
    async fn classify_enriches_and_classifies() {
        let handler = classify_handler(Ok(MetadataLookup::Found(RepoMetadata {
            full_name: "tokio-rs/tokio".into(),
            description: Some("An asynchronous runtime".into()),
            language: Some("Rust".into()),
            topics: vec!["async".into()],
            stars: 100,
            archived: true,
            homepage: None,
        })));
        let key = "https://github.com/tokio-rs/tokio";
        let outcome = handler.process_item(&repo_item(key)).await;
        let ItemResult::Succeeded { writes } = outcome.result else {
            panic!("expected success");
        };
        let write = &writes[0];
        assert_eq!(write.status, Some(EntityStatus::Archived));
        assert_eq!(write.add_mentions, 0);
        assert_eq!(write.payload.as_ref().unwrap()["stars"], 100);
        assert!(write.validate().is_ok());
        let schemes: Vec<_> = write
            .classifications
            .iter()
            .map(|c| (c.scheme.as_str(), c.category.as_str()))
            .collect();
        assert_eq!(schemes, vec![("language", "rust"), ("topic", "async")]);
    }

    #[tokio::test]
    async fn classify_not_found_is_skipped() {
        let handler = classify_handler(Ok(MetadataLookup::NotFound));
        let outcome = handler
            .process_item(&repo_item("https://github.com/gone/away"))
            .await;
        assert!(matches!(outcome.result, ItemResult::Skipped { .. }));
    }

    #[tokio::test]
    async fn classify_rate_limit_asks_for_retry() {
        let handler = classify_handler(Err(ClientError::RateLimited {
            client: "github".into(),
            retry_after: Some(Duration::from_millis(5)),
        }));
        let outcome = handler
            .process_item(&repo_item("https://github.com/a/b"))
            .await;
        assert!(matches!(
            outcome.result,
            ItemResult::Retry {
                kind: RetryKind::RateLimited,
                ..
            }
        ));
    }

    #[test]
    fn best_per_scheme_keeps_strongest() {
        let out = best_per_scheme(
            "k",
            vec![
                Classification::new("other", "topic", "web", 0.4),
                Classification::new("other", "topic", "cli", 0.8),
                Classification::new("other", "topic", "", 0.9),
                Classification::new("other", "size", "big", 3.0),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].scheme, "size");
        assert_eq!(out[0].confidence, 1.0);
        assert_eq!(out[1].category, "cli");
        assert!(out.iter().all(|c| c.entity_key == "k"));
    }

    #[tokio::test]
    async fn generate_skips_unclassified() {
        let mut item = repo_item("https://github.com/a/b");
        let outcome = GenerateHandler.process_item(&item).await;
        assert_eq!(outcome, ItemOutcome::skipped(&item.key, "unclassified"));

        item.classifications = vec![Classification::new(&item.key, "topic", "web", 0.5)];
        assert!(GenerateHandler.process_item(&item).await.is_success());
    }
}
