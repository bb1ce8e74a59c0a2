use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: DateTime<FixedOffset>,
}

impl Signature {
    /// Git's canonical encoding: `Name <email> <unix> <+hhmm>`.
    #[must_use]
    pub fn encode(&self) -> String {
        let offset = self.when.offset().local_minus_utc();
        let sign = if offset < 0 { '-' } else { '+' };
        let offset = offset.abs();
        format!(
            "{} <{}> {} {sign}{:02}{:02}",
            self.name,
            self.email,
            self.when.timestamp(),
            offset / 3600,
            (offset % 3600) / 60
        )
    }

    fn from_git2(sig: &git2::Signature<'_>) -> Self {
        let time = sig.when();
        let when = FixedOffset::east_opt(time.offset_minutes() * 60)
            .and_then(|offset| offset.timestamp_opt(time.seconds(), 0).single())
            .unwrap_or_else(|| {
                Utc.timestamp_opt(time.seconds(), 0)
                    .single()
                    .unwrap_or_else(Utc::now)
                    .fixed_offset()
            });

        Self {
            name: sig.name().unwrap_or_default().to_string(),
            email: sig.email().unwrap_or_default().to_string(),
            when,
        }
    }
}

/// A git commit, or the commit fragment carried by a rendered diff.
///
/// Older serialized forms only carry `this` and `parent`; [`Commit::normalize`]
/// fills whichever side is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
    #[serde(default)]
    pub tree: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub this: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
}

static CO_AUTHOR_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?im)^Co-authored-by:\s*(.+?)\s*<([^>]+)>").ok());

const KNOWN_HEADERS: &[&str] = &["tree", "parent", "author", "committer", "gpgsig", "gpgsig-sha256", "mergetag", "encoding"];

impl Commit {
    pub fn from_git2(commit: &git2::Commit<'_>, signature: Option<String>) -> Self {
        let extra_headers = parse_extra_headers(commit.raw_header().unwrap_or_default());
        let change_id = extra_headers.get("change-id").cloned();
        let parent_hashes: Vec<String> = commit.parent_ids().map(|id| id.to_string()).collect();

        Self {
            hash: commit.id().to_string(),
            author: Signature::from_git2(&commit.author()),
            committer: Signature::from_git2(&commit.committer()),
            message: String::from_utf8_lossy(commit.message_raw_bytes()).to_string(),
            tree: commit.tree_id().to_string(),
            parent: parent_hashes.first().cloned().unwrap_or_default(),
            parent_hashes,
            pgp_signature: signature,
            change_id,
            extra_headers,
            this: commit.id().to_string(),
        }
    }

    pub fn normalize(&mut self) {
        if self.hash.is_empty() {
            self.hash = self.this.clone();
        }
        if self.this.is_empty() {
            self.this = self.hash.clone();
        }
        if self.parent.is_empty() {
            if let Some(first) = self.parent_hashes.first() {
                self.parent = first.clone();
            }
        }
        if self.change_id.is_none() {
            self.change_id = self.extra_headers.get("change-id").cloned();
        }
    }

    /// Rebuilds the byte sequence the commit signature was computed over.
    #[must_use]
    pub fn payload(&self) -> String {
        let mut payload = String::new();
        let _ = writeln!(payload, "tree {}", self.tree);

        if self.parent_hashes.is_empty() {
            let _ = writeln!(payload, "parent {}", self.parent);
        } else {
            for p in &self.parent_hashes {
                let _ = writeln!(payload, "parent {p}");
            }
        }

        let _ = writeln!(payload, "author {}", self.author.encode());
        let _ = writeln!(payload, "committer {}", self.committer.encode());

        if let Some(change_id) = self.change_id.as_ref().or(self.extra_headers.get("change-id")) {
            let _ = writeln!(payload, "change-id {change_id}");
        }

        let _ = write!(payload, "\n{}", self.message);
        payload
    }

    /// Parses `Co-authored-by:` trailers. Co-authors share the committer timestamp.
    #[must_use]
    pub fn co_authors(&self) -> Vec<Signature> {
        let Some(re) = CO_AUTHOR_RE.as_ref() else {
            return Vec::new();
        };

        re.captures_iter(&self.message)
            .map(|caps| Signature {
                name: caps[1].trim().to_string(),
                email: caps[2].trim().to_string(),
                when: self.committer.when,
            })
            .collect()
    }
}

fn parse_extra_headers(raw: &str) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if let Some(continuation) = line.strip_prefix(' ') {
            if let Some(key) = &current {
                if let Some(value) = headers.get_mut(key) {
                    value.push('\n');
                    value.push_str(continuation);
                }
            }
            continue;
        }

        current = None;
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        if KNOWN_HEADERS.contains(&key) {
            continue;
        }
        headers.insert(key.to_string(), value.to_string());
        current = Some(key.to_string());
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str, email: &str) -> Signature {
        Signature {
            name: name.to_string(),
            email: email.to_string(),
            when: FixedOffset::east_opt(3600)
                .unwrap()
                .timestamp_opt(1_700_000_000, 0)
                .unwrap(),
        }
    }

    fn commit(message: &str) -> Commit {
        Commit {
            hash: "c0ffee".to_string(),
            author: sig("Alice", "alice@example.com"),
            committer: sig("Bob", "bob@example.com"),
            message: message.to_string(),
            tree: "t1".to_string(),
            parent_hashes: vec!["p1".to_string(), "p2".to_string()],
            pgp_signature: None,
            change_id: None,
            extra_headers: BTreeMap::new(),
            this: String::new(),
            parent: String::new(),
        }
    }

    #[test]
    fn test_signature_encoding() {
        assert_eq!(
            sig("Alice", "alice@example.com").encode(),
            "Alice <alice@example.com> 1700000000 +0100"
        );
    }

    #[test]
    fn test_payload_layout() {
        let mut c = commit("subject\n\nbody\n");
        c.extra_headers.insert("change-id".to_string(), "abcd".to_string());
        assert_eq!(
            c.payload(),
            "tree t1\nparent p1\nparent p2\n\
             author Alice <alice@example.com> 1700000000 +0100\n\
             committer Bob <bob@example.com> 1700000000 +0100\n\
             change-id abcd\n\nsubject\n\nbody\n"
        );
    }

    #[test]
    fn test_payload_legacy_parent() {
        let mut c = commit("m");
        c.parent_hashes.clear();
        c.parent = "old".to_string();
        assert!(c.payload().starts_with("tree t1\nparent old\nauthor"));
    }

    #[test]
    fn test_normalize_fills_legacy_fields() {
        let mut c = commit("m");
        c.hash.clear();
        c.this = "legacy".to_string();
        c.normalize();
        assert_eq!(c.hash, "legacy");
        assert_eq!(c.parent, "p1");
    }

    #[test]
    fn test_co_authors() {
        let c = commit("feat\n\nCo-authored-by: Carol <carol@example.com>\nco-authored-by:Dan   <dan@example.com>\n");
        let co = c.co_authors();
        assert_eq!(co.len(), 2);
        assert_eq!(co[0].name, "Carol");
        assert_eq!(co[1].email, "dan@example.com");
        assert_eq!(co[1].when, c.committer.when);
    }

    #[test]
    fn test_parse_extra_headers_skips_known() {
        let raw = "tree abc\nparent def\nauthor A <a@b> 1 +0000\ncommitter A <a@b> 1 +0000\ngpgsig -----BEGIN\n line2\n -----END\nchange-id xyz\n";
        let headers = parse_extra_headers(raw);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("change-id").map(String::as_str), Some("xyz"));
    }
}
