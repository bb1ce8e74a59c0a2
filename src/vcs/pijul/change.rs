//! Parsers for `pijul log` (text and `--json`) and `pijul change <hash>`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::vcs::{Author, Change};

/// Accepts `2024-01-01 12:00:00 +0200`, a zone-less variant read as UTC, or RFC 3339.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S %z") {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(t.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn finish(mut change: Change, message: &[String]) -> Change {
    change.message = message.join("\n").trim().to_string();
    change
}

/// Parses the default text output of `pijul log`:
///
/// ```text
/// Hash: XXXXX
/// Author: Name <email>
/// Date: 2024-01-01 12:00:00
///
///     Message line
/// ```
pub fn parse_log_output(output: &str) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut current: Option<Change> = None;
    let mut message: Vec<String> = Vec::new();
    let mut in_message = false;

    for line in output.lines() {
        let hash = line
            .strip_prefix("Hash: ")
            .or_else(|| line.strip_prefix("Change "));
        if let Some(hash) = hash {
            if let Some(done) = current.take() {
                changes.push(finish(done, &message));
            }
            current = Some(Change {
                hash: hash.trim().to_string(),
                authors: Vec::new(),
                message: String::new(),
                timestamp: None,
                dependencies: Vec::new(),
            });
            message.clear();
            in_message = false;
            continue;
        }

        let Some(change) = current.as_mut() else {
            continue;
        };

        if let Some(author) = line.strip_prefix("Author: ") {
            change.authors.push(Author::parse(author));
        } else if let Some(date) = line.strip_prefix("Date: ") {
            change.timestamp = parse_timestamp(date);
        } else if line.is_empty() && !in_message {
            in_message = true;
        } else if in_message {
            message.push(line.strip_prefix("    ").unwrap_or(line).to_string());
        }
    }

    if let Some(done) = current {
        changes.push(finish(done, &message));
    }
    changes
}

/// Parses `pijul change <hash>`: authors, `# Dependencies`, `# Message`.
pub fn parse_change_output(hash: &str, output: &str) -> Change {
    let mut change = Change {
        hash: hash.to_string(),
        authors: Vec::new(),
        message: String::new(),
        timestamp: None,
        dependencies: Vec::new(),
    };
    let mut message: Vec<String> = Vec::new();
    let mut in_deps = false;
    let mut in_message = false;

    for line in output.lines() {
        if line.starts_with("# Authors") {
            in_deps = false;
            continue;
        }
        if line.starts_with("# Dependencies") {
            in_deps = true;
            continue;
        }
        if line.starts_with("# Message") {
            in_deps = false;
            in_message = true;
            continue;
        }
        if line.starts_with("# ") {
            in_deps = false;
            in_message = false;
            continue;
        }

        let trimmed = line.trim();
        if in_deps && !trimmed.is_empty() {
            change.dependencies.push(trimmed.to_string());
        } else if in_message {
            message.push(line.to_string());
        } else if line.contains('<') && line.contains('>') {
            change.authors.push(Author::parse(line));
        }
    }

    finish(change, &message)
}

#[derive(Debug, Deserialize)]
struct ChangeJson {
    hash: String,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Parses `pijul log --json`. `None` means the output was not the JSON shape
/// and the caller should fall back to text parsing.
pub fn parse_log_json(output: &[u8]) -> Option<Vec<Change>> {
    let raw: Vec<ChangeJson> = serde_json::from_slice(output).ok()?;
    Some(
        raw.into_iter()
            .map(|c| Change {
                hash: c.hash,
                authors: c.authors.iter().map(|a| Author::parse(a)).collect(),
                message: c.message,
                timestamp: parse_timestamp(&c.timestamp),
                dependencies: c.dependencies,
            })
            .collect(),
    )
}
