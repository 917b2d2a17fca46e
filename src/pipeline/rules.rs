//! Keyword classifier: regex rules over repository metadata.
//!
//! Each rule matches one metadata field and votes for a category with a
//! fixed confidence. The strongest vote wins the `topic` scheme; a
//! repository no rule matches lands in `uncategorized`. When the metadata
//! names a primary language it is also recorded under the `language`
//! scheme.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::ClientError;
use crate::pipeline::types::{Classification, Entity};

/// Category scheme written by the keyword rules.
pub const TOPIC_SCHEME: &str = "topic";
/// Category scheme holding the repository's primary language.
pub const LANGUAGE_SCHEME: &str = "language";
/// Category for repositories no rule matched.
pub const FALLBACK_CATEGORY: &str = "uncategorized";
const FALLBACK_CONFIDENCE: f64 = 0.1;

/// Assigns categories to an entity.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// At most one classification per scheme.
    async fn classify(&self, entity: &Entity) -> Result<Vec<Classification>, ClientError>;
}

/// Which metadata field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    /// `owner/name`.
    Name,
    Description,
    /// Topics joined by spaces.
    Topics,
    Language,
}

/// A single category rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub regex: Regex,
    pub field: RuleField,
    pub category: String,
    pub confidence: f64,
}

/// Rule-based classifier. Needs no network and never fails.
pub struct KeywordClassifier {
    rules: Vec<CategoryRule>,
}

impl KeywordClassifier {
    /// Create a classifier with the built-in rule set.
    pub fn default_rules() -> Result<Self, regex::Error> {
        let table: &[(&str, RuleField, &str, f64)] = &[
            (r"(?i)\b(async|runtime|futures?|executor)\b", RuleField::Topics, "async", 0.9),
            (r"(?i)\basync(hronous)?\b", RuleField::Description, "async", 0.7),
            (r"(?i)\b(cli|command[- ]line|terminal|tui)\b", RuleField::Topics, "cli", 0.9),
            (r"(?i)\b(command[- ]line|terminal|cli)\b", RuleField::Description, "cli", 0.7),
            (r"(?i)\b(web|http|server|framework|rest|graphql)\b", RuleField::Topics, "web", 0.85),
            (r"(?i)\b(web framework|http (server|client)|web server)\b", RuleField::Description, "web", 0.7),
            (r"(?i)\b(database|sql|sqlite|postgres|kv|storage)\b", RuleField::Topics, "database", 0.85),
            (r"(?i)\b(database|query engine|key[- ]value store|orm)\b", RuleField::Description, "database", 0.7),
            (r"(?i)\b(machine-learning|deep-learning|llm|ai|ml|neural)\b", RuleField::Topics, "machine-learning", 0.85),
            (r"(?i)\b(machine learning|neural network|llm|inference)\b", RuleField::Description, "machine-learning", 0.7),
            (r"(?i)\b(gamedev|game-engine|games?|graphics)\b", RuleField::Topics, "gamedev", 0.85),
            (r"(?i)\b(game engine|rendering|gpu)\b", RuleField::Description, "gamedev", 0.6),
            (r"(?i)\b(embedded|no-std|microcontroller|firmware)\b", RuleField::Topics, "embedded", 0.9),
            (r"(?i)\b(embedded|bare[- ]metal|microcontrollers?)\b", RuleField::Description, "embedded", 0.7),
            (r"(?i)\b(security|cryptography|crypto|tls)\b", RuleField::Topics, "security", 0.85),
            (r"(?i)\b(serde|serialization|parser|json|parsing)\b", RuleField::Topics, "parsing", 0.8),
            (r"(?i)\b(awesome|awesome-list)\b", RuleField::Topics, "resources", 0.8),
            (r"(?i)/awesome-", RuleField::Name, "resources", 0.75),
        ];

        let mut classifier = Self::empty();
        for (pattern, field, category, confidence) in table {
            classifier.add_rule(pattern, *field, category, *confidence)?;
        }
        Ok(classifier)
    }

    /// Create a classifier with no rules (everything is `uncategorized`).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule. Confidence is clamped to `[0, 1]`.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        category: &str,
        confidence: f64,
    ) -> Result<(), regex::Error> {
        self.rules.push(CategoryRule {
            regex: Regex::new(pattern)?,
            field,
            category: category.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
        });
        Ok(())
    }

    /// Evaluate all rules against the entity's metadata payload.
    pub fn evaluate(&self, entity: &Entity) -> Vec<Classification> {
        let payload = &entity.payload;
        let topics = payload
            .get("topics")
            .and_then(|v| v.as_array())
            .map(|ts| {
                ts.iter()
                    .filter_map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let name = match field(payload, "full_name") {
            "" => entity.canonical_key.trim_start_matches("https://github.com"),
            full_name => full_name,
        };

        // Best confidence per category, keeping rule order for ties.
        let mut votes: Vec<(&str, f64)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for rule in &self.rules {
            let value = match rule.field {
                RuleField::Name => name,
                RuleField::Description => field(payload, "description"),
                RuleField::Topics => topics.as_str(),
                RuleField::Language => field(payload, "language"),
            };
            if value.is_empty() || !rule.regex.is_match(value) {
                continue;
            }
            match index.get(rule.category.as_str()) {
                Some(&i) => votes[i].1 = votes[i].1.max(rule.confidence),
                None => {
                    index.insert(rule.category.as_str(), votes.len());
                    votes.push((rule.category.as_str(), rule.confidence));
                }
            }
        }

        let (category, confidence) = votes
            .into_iter()
            .fold(None::<(&str, f64)>, |best, vote| match best {
                Some(b) if b.1 >= vote.1 => Some(b),
                _ => Some(vote),
            })
            .unwrap_or((FALLBACK_CATEGORY, FALLBACK_CONFIDENCE));

        debug!(key = %entity.canonical_key, category, confidence, "Keyword classification");

        let mut out = vec![Classification::new(
            &entity.canonical_key,
            TOPIC_SCHEME,
            category,
            confidence,
        )];
        let language = field(payload, "language").trim();
        if !language.is_empty() {
            out.push(Classification::new(
                &entity.canonical_key,
                LANGUAGE_SCHEME,
                language.to_ascii_lowercase(),
                1.0,
            ));
        }
        out
    }
}

fn field<'a>(payload: &'a serde_json::Value, key: &str) -> &'a str {
    payload.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, entity: &Entity) -> Result<Vec<Classification>, ClientError> {
        Ok(self.evaluate(entity))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::pipeline::types::{EntityKind, EntityStatus};

    fn repo(payload: serde_json::Value) -> Entity {
        Entity {
            canonical_key: "https://github.com/acme/widget".into(),
            kind: EntityKind::Repository,
            payload,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            mention_count: 1,
            status: EntityStatus::Active,
            vector_ref: None,
        }
    }

    fn topic(classifications: &[Classification]) -> (&str, f64) {
        let c = classifications
            .iter()
            .find(|c| c.scheme == TOPIC_SCHEME)
            .unwrap();
        (c.category.as_str(), c.confidence)
    }

    #[test]
    fn topics_outrank_description() {
        let engine = KeywordClassifier::default_rules().unwrap();
        let out = engine.evaluate(&repo(json!({
            "description": "An asynchronous web framework",
            "topics": ["async", "runtime"],
        })));
        assert_eq!(topic(&out), ("async", 0.9));
    }

    #[test]
    fn description_only_match() {
        let engine = KeywordClassifier::default_rules().unwrap();
        let out = engine.evaluate(&repo(json!({
            "description": "A fast key-value store written in Rust",
        })));
        assert_eq!(topic(&out), ("database", 0.7));
    }

    #[test]
    fn unmatched_falls_back() {
        let engine = KeywordClassifier::default_rules().unwrap();
        let out = engine.evaluate(&repo(json!({ "description": "Misc dotfiles" })));
        assert_eq!(topic(&out), (FALLBACK_CATEGORY, FALLBACK_CONFIDENCE));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn language_recorded_in_own_scheme() {
        let engine = KeywordClassifier::empty();
        let out = engine.evaluate(&repo(json!({ "language": "Rust" })));
        assert_eq!(out.len(), 2);
        let lang = out.iter().find(|c| c.scheme == LANGUAGE_SCHEME).unwrap();
        assert_eq!(lang.category, "rust");
        assert!(out.iter().all(|c| c.entity_key == "https://github.com/acme/widget"));
    }

    #[test]
    fn name_rule_uses_key_without_metadata() {
        let mut engine = KeywordClassifier::empty();
        engine
            .add_rule(r"/widget$", RuleField::Name, "tools", 2.0)
            .unwrap();
        let out = engine.evaluate(&repo(json!({})));
        assert_eq!(topic(&out), ("tools", 1.0));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut engine = KeywordClassifier::empty();
        assert!(engine.add_rule("(", RuleField::Name, "x", 0.5).is_err());
    }

    #[tokio::test]
    async fn classifier_trait_never_fails() {
        let engine = KeywordClassifier::default_rules().unwrap();
        let out = engine.classify(&repo(json!({}))).await.unwrap();
        assert_eq!(topic(&out).0, FALLBACK_CATEGORY);
    }
}
