//! Maildir ingestion source: reads newsletters from `.eml` files.
//!
//! Looks at `.eml` files in the directory itself and at every file in its
//! `new/` and `cur/` subdirectories. Every file that parses as a message
//! becomes a work item keyed by its `Message-ID` and dated by its `Date`
//! header, or by the file's modification time when the header is missing.
//! The cursor is the latest date seen, so a later call only returns messages
//! dated after it. Re-delivering a message counts as a new mention
//! downstream, which is why the cursor is exclusive.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mail_parser::{Message, MessageParser};
use serde_json::json;
use tracing::{debug, warn};

use crate::channels::{IngestionSource, SourceBatch};
use crate::error::ClientError;
use crate::pipeline::types::WorkItem;

const SOURCE_NAME: &str = "maildir";

/// Maildir source configuration.
#[derive(Debug, Clone)]
pub struct MaildirConfig {
    pub path: PathBuf,
}

impl MaildirConfig {
    /// Build config from environment variables.
    /// Returns `None` if `CURATOR_MAILDIR` is not set (source disabled).
    pub fn from_env() -> Option<Self> {
        let path = std::env::var("CURATOR_MAILDIR").ok()?;
        Some(Self {
            path: PathBuf::from(path),
        })
    }
}

/// Newsletter source backed by a local maildir.
pub struct MaildirSource {
    config: MaildirConfig,
}

impl MaildirSource {
    pub fn new(config: MaildirConfig) -> Self {
        Self { config }
    }

    async fn message_files(&self) -> Result<Vec<PathBuf>, ClientError> {
        let root = &self.config.path;
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            return Err(ClientError::Permanent {
                client: SOURCE_NAME.into(),
                reason: format!("{} does not exist", root.display()),
            });
        }

        let mut files = Vec::new();
        for (dir, maildir) in [
            (root.clone(), false),
            (root.join("new"), true),
            (root.join("cur"), true),
        ] {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir, &e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, &e))? {
                let path = entry.path();
                let is_file = entry
                    .file_type()
                    .await
                    .map(|t| t.is_file())
                    .unwrap_or(false);
                if is_file && is_message_file(&path, maildir) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl IngestionSource for MaildirSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_new(&self, since_cursor: Option<&str>) -> Result<SourceBatch, ClientError> {
        let since = since_cursor.and_then(|raw| match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                warn!(cursor = raw, error = %e, "Ignoring unreadable maildir cursor");
                None
            }
        });

        let mut items = Vec::new();
        for path in self.message_files().await? {
            let raw = tokio::fs::read(&path).await.map_err(|e| io_error(&path, &e))?;
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map_err(|e| io_error(&path, &e))?;
            let modified = whole_seconds(DateTime::<Utc>::from(modified));
            let Some(item) = parse_message(&path, &raw, modified) else {
                warn!(path = %path.display(), "Skipping unparseable message");
                continue;
            };
            if since.is_some_and(|since| item.discovered_at <= since) {
                continue;
            }
            items.push(item);
        }

        items.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        let cursor = items
            .last()
            .map(|item| item.discovered_at.to_rfc3339_opts(SecondsFormat::Secs, true));

        debug!(
            path = %self.config.path.display(),
            count = items.len(),
            cursor = ?cursor,
            "Maildir scanned"
        );
        Ok(SourceBatch { items, cursor })
    }
}

/// Every visible file under `new/` and `cur/` is a message. Maildir names
/// are dotted (`1700000000.M1P2.host`), so only the root is filtered by
/// extension.
fn is_message_file(path: &Path, in_maildir: bool) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    in_maildir
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("eml"))
}

/// Cursors are written at second precision, so dates compared against
/// them must be too.
fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

fn io_error(path: &Path, e: &std::io::Error) -> ClientError {
    ClientError::Transient {
        client: SOURCE_NAME.into(),
        reason: format!("{}: {e}", path.display()),
    }
}

/// Turn one raw message into a work item.
///
/// `modified` dates messages without a usable `Date` header. Returns `None`
/// when the bytes are not a message at all.
fn parse_message(path: &Path, raw: &[u8], modified: DateTime<Utc>) -> Option<WorkItem> {
    let parsed = MessageParser::default().parse(raw)?;

    // A message without an id is keyed by its file name, which is stable.
    let external_id = parsed
        .message_id()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| format!("file:{n}"))
        })?;

    let date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(modified);

    let body_html = parsed.body_html(0).map(|s| s.to_string());
    let payload = json!({
        "message_id": external_id,
        "subject": parsed.subject().unwrap_or("(no subject)"),
        "from": extract_sender(&parsed),
        "date": date.to_rfc3339_opts(SecondsFormat::Secs, true),
        "body_text": extract_text(&parsed),
        "body_html": body_html,
        "file": path.display().to_string(),
    });

    Some(WorkItem::new(external_id, SOURCE_NAME, payload, date))
}

/// Extract the sender address from a parsed message.
fn extract_sender(parsed: &Message<'_>) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .unwrap_or("unknown")
        .to_string()
}

/// Plain-text body, falling back to the HTML body with tags stripped.
fn extract_text(parsed: &Message<'_>) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(&html);
    }
    String::new()
}

/// Strip tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
