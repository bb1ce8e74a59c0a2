use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::error;

use super::Notifier;
use crate::appview::store::Store;
use crate::sets::Set;
use crate::types::*;

/// Mentioning more users than this in one event is treated as spam and
/// nobody is notified about the mention.
pub const MAX_MENTIONS: usize = 8;

/// Persists notifications for every recipient whose preferences allow it.
pub struct DatabaseNotifier {
    store: Arc<dyn Store>,
}

/// Optional row ids attached to a notification.
#[derive(Default, Clone, Copy)]
struct Refs {
    repo_id: Option<i64>,
    issue_id: Option<i64>,
    pull_id: Option<i64>,
}

impl DatabaseNotifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn repo_and_collaborators(&self, repo_at: &AtUri) -> Option<(Repo, Set<String>)> {
        let repo = match self.store.get_repo_by_at(repo_at) {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                error!(repo = %repo_at, "repo not found");
                return None;
            }
            Err(e) => {
                error!(repo = %repo_at, error = %e, "failed to get repo");
                return None;
            }
        };

        let mut recipients = Set::singleton(repo.did.clone());
        match self.store.get_collaborators(repo_at) {
            Ok(collaborators) => {
                for c in collaborators {
                    recipients.insert(c.subject_did);
                }
            }
            Err(e) => {
                error!(repo = %repo_at, error = %e, "failed to fetch collaborators");
                return None;
            }
        }
        Some((repo, recipients))
    }

    fn notify_mentions(
        &self,
        actor: &str,
        mentions: &[String],
        entity_type: &str,
        entity_id: &str,
        refs: Refs,
    ) {
        self.notify_event(
            actor,
            mentions.iter().cloned().collect(),
            NotificationType::UserMentioned,
            entity_type,
            entity_id,
            refs,
        );
    }

    fn notify_event(
        &self,
        actor: &str,
        mut recipients: Set<String>,
        kind: NotificationType,
        entity_type: &str,
        entity_id: &str,
        refs: Refs,
    ) {
        if kind == NotificationType::UserMentioned && recipients.len() > MAX_MENTIONS {
            return;
        }

        recipients.remove(&actor.to_string());
        if recipients.is_empty() {
            return;
        }

        let dids: Vec<String> = recipients.iter().cloned().collect();
        let prefs = match self.store.get_notification_preferences(&dids) {
            Ok(prefs) => prefs,
            Err(e) => {
                error!(error = %e, "failed to get notification preferences");
                return;
            }
        };

        let now = Utc::now();
        let notifications: Vec<Notification> = dids
            .into_iter()
            .filter(|did| {
                prefs
                    .get(did)
                    .cloned()
                    .unwrap_or_else(|| NotificationPreferences::default_for(did))
                    .should_notify(kind)
            })
            .map(|recipient_did| Notification {
                id: 0,
                recipient_did,
                actor_did: actor.to_string(),
                kind,
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                read: false,
                created: now,
                repo_id: refs.repo_id,
                issue_id: refs.issue_id,
                pull_id: refs.pull_id,
            })
            .collect();

        if notifications.is_empty() {
            return;
        }
        if let Err(e) = self.store.create_notifications(&notifications) {
            error!(kind = %kind, error = %e, "failed to create notifications");
        }
    }
}

fn remove_all(recipients: &mut Set<String>, mentions: &[String]) {
    for m in mentions {
        recipients.remove(m);
    }
}

#[async_trait]
impl Notifier for DatabaseNotifier {
    async fn new_star(&self, star: &Star) {
        // only repository stars notify
        if star.repo_at.collection() != REPO_NSID {
            return;
        }
        let repo = match self.store.get_repo_by_at(&star.repo_at) {
            Ok(Some(repo)) => repo,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to get repo");
                return;
            }
        };

        self.notify_event(
            &star.did,
            Set::singleton(repo.did.clone()),
            NotificationType::RepoStarred,
            "repo",
            &star.repo_at.to_string(),
            Refs {
                repo_id: Some(repo.id),
                ..Refs::default()
            },
        );
    }

    async fn new_follow(&self, follow: &Follow) {
        self.notify_event(
            &follow.user_did,
            Set::singleton(follow.subject_did.clone()),
            NotificationType::Followed,
            "follow",
            &follow.user_did,
            Refs::default(),
        );
    }

    async fn new_issue(&self, issue: &Issue, mentions: &[String]) {
        let Some((_, mut recipients)) = self.repo_and_collaborators(&issue.repo.repo_at()) else {
            return;
        };
        remove_all(&mut recipients, mentions);

        let entity_id = issue.at_uri().to_string();
        let refs = Refs {
            repo_id: Some(issue.repo.id),
            issue_id: Some(issue.id),
            pull_id: None,
        };
        self.notify_event(
            &issue.did,
            recipients,
            NotificationType::IssueCreated,
            "issue",
            &entity_id,
            refs,
        );
        self.notify_mentions(&issue.did, mentions, "issue", &entity_id, refs);
    }

    async fn new_issue_comment(&self, comment: &IssueComment, mentions: &[String]) {
        let issues = match self
            .store
            .get_issues(&[crate::orm::Filter::eq("at_uri", comment.issue_at.to_string())])
        {
            Ok(issues) => issues,
            Err(e) => {
                error!(error = %e, "failed to get issues");
                return;
            }
        };
        let Some(issue) = issues.into_iter().next() else {
            error!(issue = %comment.issue_at, "no issue found");
            return;
        };

        let mut recipients = Set::singleton(issue.repo.did.clone());
        match &comment.reply_to {
            // a reply reaches everybody in its thread
            Some(parent) => {
                for thread in issue.comment_list() {
                    if thread.comment.at_uri() == *parent {
                        for p in thread.participants() {
                            recipients.insert(p);
                        }
                    }
                }
            }
            None => {
                recipients.insert(issue.did.clone());
            }
        }
        remove_all(&mut recipients, mentions);

        let entity_id = issue.at_uri().to_string();
        let refs = Refs {
            repo_id: Some(issue.repo.id),
            issue_id: Some(issue.id),
            pull_id: None,
        };
        self.notify_event(
            &comment.did,
            recipients,
            NotificationType::IssueCommented,
            "issue",
            &entity_id,
            refs,
        );
        self.notify_mentions(&comment.did, mentions, "issue", &entity_id, refs);
    }

    async fn new_issue_state(&self, actor: &str, issue: &Issue) {
        let Some((_, mut recipients)) = self.repo_and_collaborators(&issue.repo.repo_at()) else {
            return;
        };
        for p in issue.participants() {
            recipients.insert(p);
        }

        let kind = if issue.open {
            NotificationType::IssueReopen
        } else {
            NotificationType::IssueClosed
        };
        self.notify_event(
            actor,
            recipients,
            kind,
            "issue",
            &issue.at_uri().to_string(),
            Refs {
                repo_id: Some(issue.repo.id),
                issue_id: Some(issue.id),
                pull_id: None,
            },
        );
    }

    async fn new_pull(&self, pull: &Pull) {
        let Some((repo, recipients)) = self.repo_and_collaborators(&pull.repo_at) else {
            return;
        };
        self.notify_event(
            &pull.owner_did,
            recipients,
            NotificationType::PullCreated,
            "pull",
            &pull.at_uri().to_string(),
            Refs {
                repo_id: Some(repo.id),
                issue_id: None,
                pull_id: Some(pull.pull_id),
            },
        );
    }

    async fn new_pull_comment(&self, comment: &PullComment, mentions: &[String]) {
        let pull = match self.store.get_pull(&comment.repo_at, comment.pull_id) {
            Ok(Some(pull)) => pull,
            Ok(None) => {
                error!(repo = %comment.repo_at, pull_id = comment.pull_id, "pull not found");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to get pull");
                return;
            }
        };
        let repo = match self.store.get_repo_by_at(&comment.repo_at) {
            Ok(Some(repo)) => repo,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to get repo");
                return;
            }
        };

        let mut recipients = Set::singleton(repo.did.clone());
        for p in pull.participants() {
            recipients.insert(p);
        }
        remove_all(&mut recipients, mentions);

        let entity_id = pull.at_uri().to_string();
        let refs = Refs {
            repo_id: Some(repo.id),
            issue_id: None,
            pull_id: Some(pull.pull_id),
        };
        self.notify_event(
            &comment.owner_did,
            recipients,
            NotificationType::PullCommented,
            "pull",
            &entity_id,
            refs,
        );
        self.notify_mentions(&comment.owner_did, mentions, "pull", &entity_id, refs);
    }

    async fn new_pull_state(&self, actor: &str, pull: &Pull) {
        let Some((repo, mut recipients)) = self.repo_and_collaborators(&pull.repo_at) else {
            return;
        };
        for p in pull.participants() {
            recipients.insert(p);
        }

        let kind = match pull.state {
            PullState::Closed => NotificationType::PullClosed,
            PullState::Open => NotificationType::PullReopen,
            PullState::Merged => NotificationType::PullMerged,
        };
        self.notify_event(
            actor,
            recipients,
            kind,
            "pull",
            &pull.at_uri().to_string(),
            Refs {
                repo_id: Some(repo.id),
                issue_id: None,
                pull_id: Some(pull.pull_id),
            },
        );
    }

    async fn new_discussion(&self, discussion: &Discussion) {
        let Some((repo, recipients)) = self.repo_and_collaborators(&discussion.repo_at) else {
            return;
        };
        self.notify_event(
            &discussion.did,
            recipients,
            NotificationType::DiscussionCreated,
            "discussion",
            &discussion.discussion_at().to_string(),
            Refs {
                repo_id: Some(repo.id),
                ..Refs::default()
            },
        );
    }

    async fn new_discussion_comment(&self, comment: &DiscussionComment, mentions: &[String]) {
        let discussion = match self.store.get_discussion_by_at(&comment.discussion_at) {
            Ok(Some(d)) => d,
            Ok(None) => {
                error!(discussion = %comment.discussion_at, "discussion not found");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to get discussion");
                return;
            }
        };
        let Some(repo) = discussion.repo.as_ref() else {
            return;
        };

        // repo owner plus everyone subscribed to the discussion
        let mut recipients = Set::singleton(repo.did.clone());
        match self.store.subscribers(&comment.discussion_at) {
            Ok(subscribers) => {
                for s in subscribers {
                    recipients.insert(s);
                }
            }
            Err(e) => {
                error!(error = %e, "failed to get subscribers");
                return;
            }
        }
        remove_all(&mut recipients, mentions);

        let entity_id = comment.discussion_at.to_string();
        let refs = Refs {
            repo_id: Some(repo.id),
            ..Refs::default()
        };
        self.notify_event(
            &comment.did,
            recipients,
            NotificationType::DiscussionCommented,
            "discussion",
            &entity_id,
            refs,
        );
        self.notify_mentions(&comment.did, mentions, "discussion", &entity_id, refs);
    }

    async fn new_discussion_state(&self, actor: &str, discussion: &Discussion) {
        let Some((repo, mut recipients)) = self.repo_and_collaborators(&discussion.repo_at) else {
            return;
        };
        for p in discussion.participants() {
            recipients.insert(p);
        }
        if let Ok(subscribers) = self.store.subscribers(&discussion.discussion_at()) {
            for s in subscribers {
                recipients.insert(s);
            }
        }

        let kind = match discussion.state {
            DiscussionState::Closed => NotificationType::DiscussionClosed,
            DiscussionState::Open => NotificationType::DiscussionReopen,
            DiscussionState::Merged => NotificationType::DiscussionMerged,
        };
        self.notify_event(
            actor,
            recipients,
            kind,
            "discussion",
            &discussion.discussion_at().to_string(),
            Refs {
                repo_id: Some(repo.id),
                ..Refs::default()
            },
        );
    }
}
