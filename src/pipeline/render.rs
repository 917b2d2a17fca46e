//! Document rendering for the generate stage.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::PipelineError;
use crate::pipeline::rules::{FALLBACK_CATEGORY, TOPIC_SCHEME};
use crate::pipeline::types::ClassifiedEntity;

/// Turns the classified repositories into the output document.
///
/// Output must depend only on the input so a re-render of unchanged data
/// produces identical bytes.
pub trait DocumentRenderer: Send + Sync {
    fn render(&self, entities: &[ClassifiedEntity]) -> Result<Vec<u8>, PipelineError>;
}

/// Markdown list of repositories grouped by category.
pub struct MarkdownRenderer {
    title: String,
    /// Scheme whose category decides the section.
    scheme: String,
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new("Curated Repositories")
    }
}

impl MarkdownRenderer {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            scheme: TOPIC_SCHEME.to_string(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn section_for<'a>(&self, entity: &'a ClassifiedEntity) -> &'a str {
        entity
            .classifications
            .iter()
            .find(|c| c.is_current() && c.scheme == self.scheme)
            .map(|c| c.category.as_str())
            .or_else(|| entity.primary_category())
            .unwrap_or(FALLBACK_CATEGORY)
    }
}

impl DocumentRenderer for MarkdownRenderer {
    fn render(&self, entities: &[ClassifiedEntity]) -> Result<Vec<u8>, PipelineError> {
        let mut sections: BTreeMap<&str, Vec<&ClassifiedEntity>> = BTreeMap::new();
        for entity in entities {
            sections.entry(self.section_for(entity)).or_default().push(entity);
        }
        for members in sections.values_mut() {
            members.sort_by(|a, b| {
                stars(b)
                    .cmp(&stars(a))
                    .then_with(|| a.entity.canonical_key.cmp(&b.entity.canonical_key))
            });
        }

        let mut out = String::new();
        write_doc(&mut out, &self.title, entities.len(), &sections)
            .map_err(|e| PipelineError::Render(e.to_string()))?;
        Ok(out.into_bytes())
    }
}

fn write_doc(
    out: &mut String,
    title: &str,
    total: usize,
    sections: &BTreeMap<&str, Vec<&ClassifiedEntity>>,
) -> std::fmt::Result {
    writeln!(out, "# {title}")?;
    writeln!(out)?;
    writeln!(
        out,
        "{total} repositories in {} categories.",
        sections.len()
    )?;
    writeln!(out)?;

    if !sections.is_empty() {
        writeln!(out, "## Contents")?;
        writeln!(out)?;
        for (category, members) in sections {
            writeln!(
                out,
                "- [{}](#{}) ({})",
                heading(category),
                anchor(category),
                members.len()
            )?;
        }
        writeln!(out)?;
    }

    for (category, members) in sections {
        writeln!(out, "## {}", heading(category))?;
        writeln!(out)?;
        for member in members {
            let key = &member.entity.canonical_key;
            let payload = &member.entity.payload;
            let name = payload
                .get("full_name")
                .and_then(|v| v.as_str())
                .unwrap_or_else(|| key.trim_start_matches("https://github.com/"));
            write!(out, "- [{name}]({key})")?;
            if let Some(desc) = payload.get("description").and_then(|v| v.as_str()) {
                let desc = desc.split_whitespace().collect::<Vec<_>>().join(" ");
                if !desc.is_empty() {
                    write!(out, ": {desc}")?;
                }
            }
            let stars = stars(member);
            if stars > 0 {
                write!(out, " ({stars} stars)")?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn stars(entity: &ClassifiedEntity) -> u64 {
    entity
        .entity
        .payload
        .get("stars")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

/// `machine-learning` → `Machine Learning`.
fn heading(category: &str) -> String {
    category
        .split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// GitHub-style heading anchor.
fn anchor(category: &str) -> String {
    heading(category).to_lowercase().replace(' ', "-")
}
