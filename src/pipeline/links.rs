//! GitHub repository link extraction and normalization.
//!
//! A repository's canonical key is `https://github.com/{owner}/{name}` with
//! both segments lowercased and any `.git` suffix removed. Every mention of
//! the same repository in any form maps to the same key.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static REPO_LINK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:https?://)?(?:www\.)?github\.com/([a-z0-9](?:[a-z0-9-]{0,38}))/([a-z0-9._-]{1,100})",
    )
    .ok()
});

/// First path segments that are GitHub pages rather than owners.
const RESERVED_OWNERS: &[&str] = &[
    "about",
    "apps",
    "collections",
    "contact",
    "customer-stories",
    "enterprise",
    "events",
    "explore",
    "features",
    "issues",
    "login",
    "marketplace",
    "new",
    "notifications",
    "orgs",
    "organizations",
    "pricing",
    "pulls",
    "search",
    "security",
    "settings",
    "site",
    "sponsors",
    "topics",
    "trending",
    "users",
];

/// An `owner/name` pair identifying one repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Build a normalized reference, or `None` if the pair is not a repository.
    pub fn new(owner: &str, name: &str) -> Option<Self> {
        let owner = owner.to_ascii_lowercase();
        let mut name = name.trim_end_matches(['.', '-', '_']).to_ascii_lowercase();
        if let Some(stripped) = name.strip_suffix(".git") {
            name = stripped.to_string();
        }
        if owner.is_empty()
            || name.is_empty()
            || name.chars().all(|c| c == '.')
            || RESERVED_OWNERS.contains(&owner.as_str())
        {
            return None;
        }
        Some(Self { owner, name })
    }

    /// Parse a canonical key (or any single GitHub repository URL).
    pub fn parse(url: &str) -> Option<Self> {
        extract_repositories(url).into_iter().next()
    }

    pub fn canonical_url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }

    /// `owner/name`, as the REST API addresses the repository.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// All distinct repositories linked from `text`, in order of first mention.
pub fn extract_repositories(text: &str) -> Vec<RepoRef> {
    let Some(re) = REPO_LINK.as_ref() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut repos = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        // gist.github.com and other subdomains are not repositories.
        if text[..whole.start()].ends_with('.') {
            continue;
        }
        let (Some(owner), Some(name)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if let Some(repo) = RepoRef::new(owner.as_str(), name.as_str())
            && seen.insert(repo.clone())
        {
            repos.push(repo);
        }
    }
    repos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(text: &str) -> Vec<String> {
        extract_repositories(text)
            .iter()
            .map(RepoRef::canonical_url)
            .collect()
    }

    #[test]
    fn extracts_and_normalizes() {
        let text = "Check out https://github.com/Tokio-RS/Tokio and \
                    github.com/serde-rs/serde.git, also http://www.github.com/tokio-rs/tokio/issues/1.";
        assert_eq!(
            keys(text),
            vec![
                "https://github.com/tokio-rs/tokio",
                "https://github.com/serde-rs/serde",
            ]
        );
    }

    #[test]
    fn trailing_punctuation_is_dropped() {
        assert_eq!(
            keys("Star it at https://github.com/rust-lang/rust."),
            vec!["https://github.com/rust-lang/rust"]
        );
    }

    #[test]
    fn skips_non_repository_pages() {
        assert!(keys("https://github.com/sponsors/someone").is_empty());
        assert!(keys("https://github.com/topics/rust").is_empty());
        assert!(keys("https://gist.github.com/user/abc123").is_empty());
        assert!(keys("https://github.com/just-an-owner").is_empty());
        assert!(keys("see notgithub.com/a/b").is_empty());
    }

    #[test]
    fn html_hrefs_are_found() {
        let html = r#"<a href="https://github.com/BurntSushi/ripgrep">ripgrep</a>"#;
        assert_eq!(keys(html), vec!["https://github.com/burntsushi/ripgrep"]);
    }

    #[test]
    fn parse_round_trips_canonical_key() {
        let repo = RepoRef::parse("https://github.com/a/b").unwrap();
        assert_eq!(repo.full_name(), "a/b");
        assert_eq!(repo.canonical_url(), "https://github.com/a/b");
        assert!(RepoRef::parse("https://example.com/a/b").is_none());
    }
}
