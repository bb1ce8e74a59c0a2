//! Branch and tag listing through `git for-each-ref`.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::cmd::run_git_checked;
use crate::vcs::{Branch, VcsError};

const FIELD_SEPARATOR: &str = "\x1f";
const RECORD_SEPARATOR: &str = "\x1e";

const BRANCH_FIELDS: &[&str] = &[
    "refname:short",
    "objectname",
    "authorname",
    "authoremail",
    "authordate:unix",
    "committername",
    "committeremail",
    "committerdate:unix",
    "tree",
    "parent",
    "contents",
];

const TAG_FIELDS: &[&str] = &[
    "refname:short",
    "objectname",
    "objecttype",
    "*objectname",
    "*objecttype",
    "taggername",
    "taggeremail",
    "taggerdate:unix",
    "contents",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefSignature {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefCommit {
    pub hash: String,
    pub author: RefSignature,
    pub committer: RefSignature,
    pub tree: String,
    pub parent: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotatedTag {
    pub target: String,
    pub target_type: String,
    pub tagger: RefSignature,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagReference {
    pub name: String,
    pub hash: String,
    pub object_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Present only for annotated tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<AnnotatedTag>,
}

fn format_arg(fields: &[&str]) -> String {
    let joined = fields
        .iter()
        .map(|f| format!("%({f})"))
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR);
    format!("--format={joined}{RECORD_SEPARATOR}")
}

fn strip_email(email: &str) -> String {
    let email = email.strip_prefix('<').unwrap_or(email);
    email.strip_suffix('>').unwrap_or(email).to_string()
}

fn parse_unix(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Splits for-each-ref output into the `[offset, offset + limit)` window of
/// records. A zero limit keeps everything after `offset`.
fn window(output: &str, offset: usize, limit: usize) -> Vec<&str> {
    let records: Vec<&str> = output
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .collect();
    if offset >= records.len() {
        return Vec::new();
    }
    let end = if limit > 0 {
        (offset + limit).min(records.len())
    } else {
        records.len()
    };
    records[offset..end].to_vec()
}

async fn for_each_ref(
    repo_path: &Path,
    fields: &[&str],
    pattern: &str,
    offset: usize,
    limit: usize,
) -> Result<String, VcsError> {
    let format = format_arg(fields);
    let count = format!("--count={}", offset + limit);
    let mut args = vec!["for-each-ref", format.as_str(), "--sort=-creatordate"];
    if limit > 0 {
        args.push(count.as_str());
    }
    args.push(pattern);

    let stdout = run_git_checked(repo_path, &args).await?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

pub fn parse_branches(output: &str, offset: usize, limit: usize, default: Option<&str>) -> Vec<Branch> {
    let mut branches = Vec::new();
    for record in window(output, offset, limit) {
        let parts: Vec<&str> = record
            .splitn(BRANCH_FIELDS.len(), FIELD_SEPARATOR)
            .collect();
        if parts.len() < 6 {
            continue;
        }
        let field = |i: usize| parts.get(i).copied().unwrap_or_default();

        let name = field(0).to_string();
        let hash = field(1).to_string();
        branches.push(Branch {
            is_default: default == Some(name.as_str()),
            name,
            hash: Some(hash.clone()),
            commit: Some(RefCommit {
                hash,
                author: RefSignature {
                    name: field(2).to_string(),
                    email: strip_email(field(3)),
                    when: parse_unix(field(4)),
                },
                committer: RefSignature {
                    name: field(5).to_string(),
                    email: strip_email(field(6)),
                    when: parse_unix(field(7)),
                },
                tree: field(8).to_string(),
                parent: field(9).to_string(),
                message: field(10).to_string(),
            }),
        });
    }
    branches.reverse();
    branches
}

pub fn parse_tags(output: &str, offset: usize, limit: usize) -> Vec<TagReference> {
    let mut tags = Vec::new();
    for record in window(output, offset, limit) {
        let parts: Vec<&str> = record
            .splitn(TAG_FIELDS.len(), FIELD_SEPARATOR)
            .collect();
        if parts.len() < 6 {
            continue;
        }
        let field = |i: usize| parts.get(i).copied().unwrap_or_default();

        let target = field(3);
        let message = field(8).to_string();
        let annotated = (!target.is_empty()).then(|| AnnotatedTag {
            target: target.to_string(),
            target_type: field(4).to_string(),
            tagger: RefSignature {
                name: field(5).to_string(),
                email: strip_email(field(6)),
                when: parse_unix(field(7)),
            },
            message: message.clone(),
        });

        tags.push(TagReference {
            name: field(0).to_string(),
            hash: field(1).to_string(),
            object_type: field(2).to_string(),
            message: (!message.is_empty()).then_some(message),
            tag: annotated,
        });
    }
    tags
}

/// Branches sorted by creator date, returned oldest-first within the window.
pub async fn branches(
    repo_path: &Path,
    offset: usize,
    limit: usize,
    default: Option<&str>,
) -> Result<Vec<Branch>, VcsError> {
    let output = for_each_ref(repo_path, BRANCH_FIELDS, "refs/heads", offset, limit).await?;
    Ok(parse_branches(&output, offset, limit, default))
}

pub async fn tags(repo_path: &Path, offset: usize, limit: usize) -> Result<Vec<TagReference>, VcsError> {
    let output = for_each_ref(repo_path, TAG_FIELDS, "refs/tags", offset, limit).await?;
    Ok(parse_tags(&output, offset, limit))
}

/// Looks up exactly one tag by short or full name.
pub async fn tag(repo_path: &Path, name: &str) -> Result<TagReference, VcsError> {
    let pattern = if name.starts_with("refs/tags/") {
        name.to_string()
    } else {
        format!("refs/tags/{name}")
    };
    let output = for_each_ref(repo_path, TAG_FIELDS, &pattern, 0, 0).await?;
    let mut found = parse_tags(&output, 0, 0);
    if found.len() != 1 {
        return Err(VcsError::TagNotFound(format!(
            "expected 1 tag to be returned, got {} tags",
            found.len()
        )));
    }
    Ok(found.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::git::testing::TestRepo;

    fn record(fields: &[&str]) -> String {
        format!("{}{RECORD_SEPARATOR}", fields.join(FIELD_SEPARATOR))
    }

    #[test]
    fn test_parse_branches_window_and_order() {
        let output = [
            record(&["newest", "c3", "A", "<a@x>", "300", "A", "<a@x>", "300", "t", "p", "third"]),
            record(&["middle", "c2", "A", "<a@x>", "200", "A", "<a@x>", "200", "t", "p", "second"]),
            record(&["main", "c1", "A", "<a@x>", "100", "A", "<a@x>", "100", "t", "p", "first"]),
        ]
        .concat();

        let all = parse_branches(&output, 0, 50, Some("main"));
        let names: Vec<&str> = all.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["main", "middle", "newest"]);
        assert!(all[0].is_default);
        assert!(!all[1].is_default);
        let commit = all[0].commit.as_ref().unwrap();
        assert_eq!(commit.author.email, "a@x");
        assert_eq!(commit.author.when.unwrap().timestamp(), 100);

        let page = parse_branches(&output, 1, 1, None);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "middle");

        assert!(parse_branches(&output, 3, 10, None).is_empty());
    }

    #[test]
    fn test_parse_skips_short_records() {
        let output = format!("{}{}", record(&["x", "y"]), record(&["v1", "abc", "commit", "", "", "T"]));
        let tags = parse_tags(&output, 0, 0);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "v1");
        assert!(tags[0].tag.is_none());
    }

    #[test]
    fn test_strip_email() {
        assert_eq!(strip_email("<a@b.c>"), "a@b.c");
        assert_eq!(strip_email("a@b.c"), "a@b.c");
    }

    #[tokio::test]
    async fn test_branches_and_tags_from_repo() {
        let repo = TestRepo::new();
        let first = repo.commit(&[("a.txt", "a\n")], "first", 1_700_000_000);
        repo.branch("feature", first);
        repo.tag_lightweight("light", first);
        repo.tag_annotated("v1.0", first, "release one");
        repo.commit(&[("b.txt", "b\n")], "second", 1_700_000_100);

        let branches = branches(repo.path(), 0, 50, Some("main")).await.unwrap();
        assert_eq!(branches.len(), 2);
        assert!(branches.iter().any(|b| b.name == "main" && b.is_default));
        assert!(branches.iter().any(|b| b.name == "feature" && !b.is_default));

        let all_tags = tags(repo.path(), 0, 50).await.unwrap();
        assert_eq!(all_tags.len(), 2);

        let annotated = tag(repo.path(), "v1.0").await.unwrap();
        let details = annotated.tag.unwrap();
        assert_eq!(details.target, first.to_string());
        assert_eq!(details.message.trim(), "release one");

        let light = tag(repo.path(), "refs/tags/light").await.unwrap();
        assert!(light.tag.is_none());

        assert!(matches!(
            tag(repo.path(), "missing").await,
            Err(VcsError::TagNotFound(_))
        ));
    }
}
