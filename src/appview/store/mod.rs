mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;

use crate::error::Result;
use crate::orm::Filter;
use crate::types::*;

/// Offset pagination over listing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 30,
        }
    }
}

/// Store defines the appview database interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Repo operations
    fn create_repo(&self, repo: &Repo) -> Result<i64>;
    fn get_repo(&self, filters: &[Filter]) -> Result<Option<Repo>>;
    fn get_repo_by_at(&self, repo_at: &AtUri) -> Result<Option<Repo>>;

    // Collaborators and keys
    fn add_collaborator(&self, collaborator: &Collaborator) -> Result<()>;
    fn get_collaborators(&self, repo_at: &AtUri) -> Result<Vec<Collaborator>>;
    fn add_public_key(&self, key: &PublicKey) -> Result<()>;
    fn get_public_keys(&self, did: &str) -> Result<Vec<PublicKey>>;

    // Email operations
    fn add_email(&self, did: &str, address: &str, verified: bool) -> Result<()>;
    /// Maps each verified address in `addresses` to its owner.
    fn get_email_to_did(&self, addresses: &[String]) -> Result<HashMap<String, String>>;

    // Issue operations
    fn create_issue(&self, issue: &Issue) -> Result<i64>;
    fn get_issues(&self, filters: &[Filter]) -> Result<Vec<Issue>>;
    fn add_issue_comment(&self, comment: &IssueComment) -> Result<i64>;
    fn set_issue_open(&self, issue_at: &AtUri, open: bool) -> Result<()>;

    // Pull operations
    fn create_pull(&self, pull: &Pull) -> Result<()>;
    fn get_pull(&self, repo_at: &AtUri, pull_id: i64) -> Result<Option<Pull>>;
    fn add_pull_comment(&self, comment: &PullComment) -> Result<i64>;

    // Discussion operations
    /// Allocates the next per-repo discussion id, inserts the discussion and
    /// subscribes its creator, all in one transaction. Returns `(id, discussion_id)`.
    fn create_discussion(&self, discussion: &Discussion) -> Result<(i64, i64)>;
    fn get_discussions(&self, page: Page, filters: &[Filter]) -> Result<Vec<Discussion>>;
    fn get_discussion(&self, repo_at: &AtUri, discussion_id: i64) -> Result<Option<Discussion>>;
    fn get_discussion_by_at(&self, discussion_at: &AtUri) -> Result<Option<Discussion>>;
    fn count_discussions(&self, repo_at: &AtUri) -> Result<DiscussionCount>;
    /// Moves a discussion from `from` to `to`. Fails with
    /// [`Error::InvalidState`](crate::error::Error::InvalidState) when the
    /// stored state is no longer `from`.
    fn set_discussion_state(
        &self,
        discussion_at: &AtUri,
        from: DiscussionState,
        to: DiscussionState,
    ) -> Result<()>;

    fn add_discussion_patch(&self, patch: &DiscussionPatch) -> Result<i64>;
    fn remove_discussion_patch(&self, patch_id: i64) -> Result<()>;
    fn readd_discussion_patch(&self, patch_id: i64) -> Result<()>;

    fn upsert_discussion_comment(&self, comment: &DiscussionComment) -> Result<i64>;
    fn delete_discussion_comment(&self, filters: &[Filter]) -> Result<()>;

    fn subscribe(&self, discussion_at: &AtUri, did: &str) -> Result<()>;
    fn unsubscribe(&self, discussion_at: &AtUri, did: &str) -> Result<()>;
    fn subscribers(&self, discussion_at: &AtUri) -> Result<Vec<String>>;

    // Notification operations
    fn get_notification_preferences(
        &self,
        dids: &[String],
    ) -> Result<HashMap<String, NotificationPreferences>>;
    fn set_notification_preferences(&self, prefs: &NotificationPreferences) -> Result<()>;
    /// Inserts every notification in one transaction.
    fn create_notifications(&self, notifications: &[Notification]) -> Result<()>;
    fn get_notifications(&self, recipient_did: &str) -> Result<Vec<Notification>>;
}
