//! Issue and pull projections read by the notifier.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aturi::AtUri;
use super::repo::Repo;

pub const ISSUE_NSID: &str = "sh.tangled.repo.issue";
pub const ISSUE_COMMENT_NSID: &str = "sh.tangled.repo.issue.comment";
pub const PULL_NSID: &str = "sh.tangled.repo.pull";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub did: String,
    pub rkey: String,
    pub issue_id: i64,
    pub title: String,
    pub body: String,
    pub open: bool,
    pub created: DateTime<Utc>,
    pub repo: Repo,
    #[serde(default)]
    pub comments: Vec<IssueComment>,
}

impl Issue {
    #[must_use]
    pub fn at_uri(&self) -> AtUri {
        AtUri::new(&self.did, ISSUE_NSID, &self.rkey)
    }

    /// Author first, then commenters in order. No duplicates.
    #[must_use]
    pub fn participants(&self) -> Vec<String> {
        dedup(std::iter::once(&self.did).chain(self.comments.iter().map(|c| &c.did)))
    }

    /// Top-level comments with their replies, both sorted by creation time.
    #[must_use]
    pub fn comment_list(&self) -> Vec<IssueThread> {
        let mut threads: Vec<IssueThread> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for c in self.comments.iter().filter(|c| c.reply_to.is_none()) {
            index.insert(c.at_uri().to_string(), threads.len());
            threads.push(IssueThread {
                comment: c.clone(),
                replies: Vec::new(),
            });
        }
        for r in &self.comments {
            if let Some(parent) = &r.reply_to {
                if let Some(&i) = index.get(&parent.to_string()) {
                    threads[i].replies.push(r.clone());
                }
            }
        }

        threads.sort_by_key(|t| t.comment.created);
        for t in &mut threads {
            t.replies.sort_by_key(|r| r.created);
        }
        threads
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: i64,
    pub did: String,
    pub rkey: String,
    pub issue_at: AtUri,
    pub reply_to: Option<AtUri>,
    pub body: String,
    pub created: DateTime<Utc>,
}

impl IssueComment {
    #[must_use]
    pub fn at_uri(&self) -> AtUri {
        AtUri::new(&self.did, ISSUE_COMMENT_NSID, &self.rkey)
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueThread {
    pub comment: IssueComment,
    pub replies: Vec<IssueComment>,
}

impl IssueThread {
    #[must_use]
    pub fn participants(&self) -> Vec<String> {
        dedup(std::iter::once(&self.comment.did).chain(self.replies.iter().map(|r| &r.did)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullState {
    Closed,
    Open,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pull {
    pub pull_id: i64,
    pub owner_did: String,
    pub rkey: String,
    pub repo_at: AtUri,
    pub title: String,
    pub state: PullState,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub comments: Vec<PullComment>,
}

impl Pull {
    #[must_use]
    pub fn at_uri(&self) -> AtUri {
        AtUri::new(&self.owner_did, PULL_NSID, &self.rkey)
    }

    #[must_use]
    pub fn participants(&self) -> Vec<String> {
        dedup(std::iter::once(&self.owner_did).chain(self.comments.iter().map(|c| &c.owner_did)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullComment {
    pub id: i64,
    pub owner_did: String,
    pub repo_at: AtUri,
    pub pull_id: i64,
    pub body: String,
    pub created: DateTime<Utc>,
}

fn dedup<'a>(dids: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for did in dids {
        if !out.contains(did) {
            out.push(did.clone());
        }
    }
    out
}
