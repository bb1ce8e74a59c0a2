use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aturi::AtUri;
use super::repo::Repo;
use crate::error::Error;

pub const DISCUSSION_NSID: &str = "sh.tangled.repo.discussion";
pub const DISCUSSION_COMMENT_NSID: &str = "sh.tangled.repo.discussion.comment";

/// Stored as an integer; the values are part of the appview schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscussionState {
    Closed = 0,
    Open = 1,
    Merged = 2,
}

impl DiscussionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Merged => "merged",
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Closed),
            1 => Some(Self::Open),
            2 => Some(Self::Merged),
            _ => None,
        }
    }

    /// `open ↔ closed`, `open → merged`; merged accepts nothing.
    #[must_use]
    pub fn can_transition_to(self, next: DiscussionState) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Closed) | (Self::Closed, Self::Open) | (Self::Open, Self::Merged)
        )
    }
}

impl fmt::Display for DiscussionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscussionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "merged" => Ok(Self::Merged),
            other => Err(Error::BadRequest(format!("unknown discussion state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discussion {
    pub id: i64,
    pub repo_at: AtUri,
    pub did: String,
    pub rkey: String,
    pub discussion_id: i64,
    pub title: String,
    pub body: String,
    pub target_channel: String,
    pub state: DiscussionState,
    pub created: DateTime<Utc>,
    pub edited: Option<DateTime<Utc>>,

    #[serde(default)]
    pub patches: Vec<DiscussionPatch>,
    #[serde(default)]
    pub comments: Vec<DiscussionComment>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<Repo>,
}

impl Discussion {
    #[must_use]
    pub fn discussion_at(&self) -> AtUri {
        AtUri::new(&self.did, DISCUSSION_NSID, &self.rkey)
    }

    pub fn is_open(&self) -> bool {
        self.state == DiscussionState::Open
    }

    /// Active patches in application order.
    #[must_use]
    pub fn active_patches(&self) -> Vec<&DiscussionPatch> {
        let mut active: Vec<&DiscussionPatch> =
            self.patches.iter().filter(|p| p.is_active()).collect();
        active.sort_by_key(|p| p.added);
        active
    }

    pub fn find_patch(&self, hash: &str) -> Option<&DiscussionPatch> {
        self.patches.iter().find(|p| p.patch_hash == hash)
    }

    /// Creator first, then patch pushers, then commenters. No duplicates.
    #[must_use]
    pub fn participants(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        let pushers = self.patches.iter().map(|p| p.pushed_by_did.as_str());
        let commenters = self.comments.iter().map(|c| c.did.as_str());

        for did in std::iter::once(self.did.as_str()).chain(pushers).chain(commenters) {
            if seen.insert(did) {
                out.push(did.to_string());
            }
        }
        out
    }

    /// Two-level comment tree: top-level comments with their replies, both
    /// sorted by creation time. Replies whose parent is missing are dropped.
    #[must_use]
    pub fn comment_list(&self) -> Vec<CommentThread> {
        let mut threads: Vec<CommentThread> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for comment in self.comments.iter().filter(|c| c.is_top_level()) {
            index.insert(comment.comment_at().to_string(), threads.len());
            threads.push(CommentThread {
                comment: comment.clone(),
                replies: Vec::new(),
            });
        }

        for reply in self.comments.iter().filter(|c| !c.is_top_level()) {
            let Some(parent) = reply.reply_to.as_ref() else {
                continue;
            };
            if let Some(&i) = index.get(&parent.to_string()) {
                threads[i].replies.push(reply.clone());
            }
        }

        threads.sort_by_key(|t| t.comment.created);
        for thread in &mut threads {
            thread.replies.sort_by_key(|r| r.created);
        }
        threads
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionPatch {
    pub id: i64,
    pub discussion_at: AtUri,
    pub pushed_by_did: String,
    pub patch_hash: String,
    pub patch: String,
    pub added: DateTime<Utc>,
    pub removed: Option<DateTime<Utc>>,
}

impl DiscussionPatch {
    pub fn is_active(&self) -> bool {
        self.removed.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionComment {
    pub id: i64,
    pub did: String,
    pub rkey: String,
    pub discussion_at: AtUri,
    pub reply_to: Option<AtUri>,
    pub body: String,
    pub created: DateTime<Utc>,
    pub edited: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
}

impl DiscussionComment {
    #[must_use]
    pub fn comment_at(&self) -> AtUri {
        AtUri::new(&self.did, DISCUSSION_COMMENT_NSID, &self.rkey)
    }

    pub fn is_top_level(&self) -> bool {
        self.reply_to.is_none()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentThread {
    pub comment: DiscussionComment,
    pub replies: Vec<DiscussionComment>,
}

impl CommentThread {
    /// The thread author followed by everyone who replied.
    #[must_use]
    pub fn participants(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for did in std::iter::once(&self.comment.did).chain(self.replies.iter().map(|r| &r.did)) {
            if !out.contains(did) {
                out.push(did.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionCount {
    pub open: i64,
    pub merged: i64,
    pub closed: i64,
}
