use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    RepoStarred,
    IssueCreated,
    IssueCommented,
    IssueClosed,
    IssueReopen,
    PullCreated,
    PullCommented,
    PullMerged,
    PullClosed,
    PullReopen,
    Followed,
    UserMentioned,
    DiscussionCreated,
    DiscussionCommented,
    DiscussionClosed,
    DiscussionReopen,
    DiscussionMerged,
}

impl NotificationType {
    pub const ALL: [NotificationType; 17] = [
        Self::RepoStarred,
        Self::IssueCreated,
        Self::IssueCommented,
        Self::IssueClosed,
        Self::IssueReopen,
        Self::PullCreated,
        Self::PullCommented,
        Self::PullMerged,
        Self::PullClosed,
        Self::PullReopen,
        Self::Followed,
        Self::UserMentioned,
        Self::DiscussionCreated,
        Self::DiscussionCommented,
        Self::DiscussionClosed,
        Self::DiscussionReopen,
        Self::DiscussionMerged,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepoStarred => "repo_starred",
            Self::IssueCreated => "issue_created",
            Self::IssueCommented => "issue_commented",
            Self::IssueClosed => "issue_closed",
            Self::IssueReopen => "issue_reopen",
            Self::PullCreated => "pull_created",
            Self::PullCommented => "pull_commented",
            Self::PullMerged => "pull_merged",
            Self::PullClosed => "pull_closed",
            Self::PullReopen => "pull_reopen",
            Self::Followed => "followed",
            Self::UserMentioned => "user_mentioned",
            Self::DiscussionCreated => "discussion_created",
            Self::DiscussionCommented => "discussion_commented",
            Self::DiscussionClosed => "discussion_closed",
            Self::DiscussionReopen => "discussion_reopen",
            Self::DiscussionMerged => "discussion_merged",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::BadRequest(format!("unknown notification type: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub recipient_did: String,
    pub actor_did: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub entity_type: String,
    pub entity_id: String,
    pub read: bool,
    pub created: DateTime<Utc>,
    pub repo_id: Option<i64>,
    pub issue_id: Option<i64>,
    pub pull_id: Option<i64>,
}

/// Per-user opt-ins. Users without a stored row get [`NotificationPreferences::default_for`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_did: String,
    pub repo_starred: bool,
    pub issue_created: bool,
    pub issue_commented: bool,
    pub issue_closed: bool,
    pub pull_created: bool,
    pub pull_commented: bool,
    pub pull_merged: bool,
    pub followed: bool,
    pub user_mentioned: bool,
    pub email_notifications: bool,
}

impl NotificationPreferences {
    #[must_use]
    pub fn default_for(user_did: &str) -> Self {
        Self {
            user_did: user_did.to_string(),
            repo_starred: true,
            issue_created: true,
            issue_commented: true,
            issue_closed: true,
            pull_created: true,
            pull_commented: true,
            pull_merged: true,
            followed: true,
            user_mentioned: true,
            email_notifications: false,
        }
    }

    /// Reopen events share the "created" switch; close events share the
    /// "closed"/"merged" switch. Discussions ride on the pull switches.
    #[must_use]
    pub fn should_notify(&self, kind: NotificationType) -> bool {
        use NotificationType::*;
        match kind {
            RepoStarred => self.repo_starred,
            IssueCreated | IssueReopen => self.issue_created,
            IssueCommented => self.issue_commented,
            IssueClosed => self.issue_closed,
            PullCreated | PullReopen | DiscussionCreated | DiscussionReopen => self.pull_created,
            PullCommented | DiscussionCommented => self.pull_commented,
            PullMerged | PullClosed | DiscussionMerged | DiscussionClosed => self.pull_merged,
            Followed => self.followed,
            UserMentioned => self.user_mentioned,
        }
    }
}
