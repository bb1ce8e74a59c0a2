//! Notification fan-out.
//!
//! Domain events are delivered to a [`Notifier`]. [`MergedNotifier`] forwards
//! each event to several notifiers concurrently and waits for all of them;
//! [`LoggingNotifier`] traces events before handing them on.

mod db;

pub use db::{DatabaseNotifier, MAX_MENTIONS};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span};

use crate::types::*;

/// Every method defaults to a no-op so implementations pick the events they
/// care about.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn new_star(&self, _star: &Star) {}
    async fn new_follow(&self, _follow: &Follow) {}

    async fn new_issue(&self, _issue: &Issue, _mentions: &[String]) {}
    async fn new_issue_comment(&self, _comment: &IssueComment, _mentions: &[String]) {}
    async fn new_issue_state(&self, _actor: &str, _issue: &Issue) {}

    async fn new_pull(&self, _pull: &Pull) {}
    async fn new_pull_comment(&self, _comment: &PullComment, _mentions: &[String]) {}
    async fn new_pull_state(&self, _actor: &str, _pull: &Pull) {}

    async fn new_discussion(&self, _discussion: &Discussion) {}
    async fn new_discussion_comment(&self, _comment: &DiscussionComment, _mentions: &[String]) {}
    async fn new_discussion_state(&self, _actor: &str, _discussion: &Discussion) {}
}

/// Drops every event.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {}

pub struct MergedNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl MergedNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    async fn fanout<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<dyn Notifier>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for notifier in &self.notifiers {
            set.spawn(callback(Arc::clone(notifier)));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "notifier task failed");
            }
        }
    }
}

#[async_trait]
impl Notifier for MergedNotifier {
    async fn new_star(&self, star: &Star) {
        let star = star.clone();
        self.fanout(|n| {
            let star = star.clone();
            async move { n.new_star(&star).await }
        })
        .await;
    }

    async fn new_follow(&self, follow: &Follow) {
        let follow = follow.clone();
        self.fanout(|n| {
            let follow = follow.clone();
            async move { n.new_follow(&follow).await }
        })
        .await;
    }

    async fn new_issue(&self, issue: &Issue, mentions: &[String]) {
        let (issue, mentions) = (issue.clone(), mentions.to_vec());
        self.fanout(|n| {
            let (issue, mentions) = (issue.clone(), mentions.clone());
            async move { n.new_issue(&issue, &mentions).await }
        })
        .await;
    }

    async fn new_issue_comment(&self, comment: &IssueComment, mentions: &[String]) {
        let (comment, mentions) = (comment.clone(), mentions.to_vec());
        self.fanout(|n| {
            let (comment, mentions) = (comment.clone(), mentions.clone());
            async move { n.new_issue_comment(&comment, &mentions).await }
        })
        .await;
    }

    async fn new_issue_state(&self, actor: &str, issue: &Issue) {
        let (actor, issue) = (actor.to_string(), issue.clone());
        self.fanout(|n| {
            let (actor, issue) = (actor.clone(), issue.clone());
            async move { n.new_issue_state(&actor, &issue).await }
        })
        .await;
    }

    async fn new_pull(&self, pull: &Pull) {
        let pull = pull.clone();
        self.fanout(|n| {
            let pull = pull.clone();
            async move { n.new_pull(&pull).await }
        })
        .await;
    }

    async fn new_pull_comment(&self, comment: &PullComment, mentions: &[String]) {
        let (comment, mentions) = (comment.clone(), mentions.to_vec());
        self.fanout(|n| {
            let (comment, mentions) = (comment.clone(), mentions.clone());
            async move { n.new_pull_comment(&comment, &mentions).await }
        })
        .await;
    }

    async fn new_pull_state(&self, actor: &str, pull: &Pull) {
        let (actor, pull) = (actor.to_string(), pull.clone());
        self.fanout(|n| {
            let (actor, pull) = (actor.clone(), pull.clone());
            async move { n.new_pull_state(&actor, &pull).await }
        })
        .await;
    }

    async fn new_discussion(&self, discussion: &Discussion) {
        let discussion = discussion.clone();
        self.fanout(|n| {
            let discussion = discussion.clone();
            async move { n.new_discussion(&discussion).await }
        })
        .await;
    }

    async fn new_discussion_comment(&self, comment: &DiscussionComment, mentions: &[String]) {
        let (comment, mentions) = (comment.clone(), mentions.to_vec());
        self.fanout(|n| {
            let (comment, mentions) = (comment.clone(), mentions.clone());
            async move { n.new_discussion_comment(&comment, &mentions).await }
        })
        .await;
    }

    async fn new_discussion_state(&self, actor: &str, discussion: &Discussion) {
        let (actor, discussion) = (actor.to_string(), discussion.clone());
        self.fanout(|n| {
            let (actor, discussion) = (actor.clone(), discussion.clone());
            async move { n.new_discussion_state(&actor, &discussion).await }
        })
        .await;
    }
}

/// Logs each event inside a `notify` span, then forwards it.
pub struct LoggingNotifier {
    inner: Arc<dyn Notifier>,
}

impl LoggingNotifier {
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn new_star(&self, star: &Star) {
        let span = info_span!("notify", event = "new_star");
        async {
            info!(did = %star.did, repo = %star.repo_at, "star");
            self.inner.new_star(star).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_follow(&self, follow: &Follow) {
        let span = info_span!("notify", event = "new_follow");
        async {
            info!(user = %follow.user_did, subject = %follow.subject_did, "follow");
            self.inner.new_follow(follow).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_issue(&self, issue: &Issue, mentions: &[String]) {
        let span = info_span!("notify", event = "new_issue");
        async {
            info!(issue = %issue.at_uri(), mentions = mentions.len(), "issue");
            self.inner.new_issue(issue, mentions).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_issue_comment(&self, comment: &IssueComment, mentions: &[String]) {
        let span = info_span!("notify", event = "new_issue_comment");
        async {
            info!(issue = %comment.issue_at, did = %comment.did, "issue comment");
            self.inner.new_issue_comment(comment, mentions).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_issue_state(&self, actor: &str, issue: &Issue) {
        let span = info_span!("notify", event = "new_issue_state");
        async {
            info!(actor, issue = %issue.at_uri(), open = issue.open, "issue state");
            self.inner.new_issue_state(actor, issue).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_pull(&self, pull: &Pull) {
        let span = info_span!("notify", event = "new_pull");
        async {
            info!(pull = %pull.at_uri(), "pull");
            self.inner.new_pull(pull).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_pull_comment(&self, comment: &PullComment, mentions: &[String]) {
        let span = info_span!("notify", event = "new_pull_comment");
        async {
            info!(repo = %comment.repo_at, pull_id = comment.pull_id, "pull comment");
            self.inner.new_pull_comment(comment, mentions).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_pull_state(&self, actor: &str, pull: &Pull) {
        let span = info_span!("notify", event = "new_pull_state");
        async {
            info!(actor, pull = %pull.at_uri(), state = ?pull.state, "pull state");
            self.inner.new_pull_state(actor, pull).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_discussion(&self, discussion: &Discussion) {
        let span = info_span!("notify", event = "new_discussion");
        async {
            info!(discussion = %discussion.discussion_at(), "discussion");
            self.inner.new_discussion(discussion).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_discussion_comment(&self, comment: &DiscussionComment, mentions: &[String]) {
        let span = info_span!("notify", event = "new_discussion_comment");
        async {
            info!(discussion = %comment.discussion_at, did = %comment.did, "discussion comment");
            self.inner.new_discussion_comment(comment, mentions).await;
        }
        .instrument(span)
        .await;
    }

    async fn new_discussion_state(&self, actor: &str, discussion: &Discussion) {
        let span = info_span!("notify", event = "new_discussion_state");
        async {
            info!(actor, discussion = %discussion.discussion_at(), state = %discussion.state, "discussion state");
            self.inner.new_discussion_state(actor, discussion).await;
        }
        .instrument(span)
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    struct Counting {
        stars: AtomicUsize,
        follows: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for Counting {
        async fn new_star(&self, _star: &Star) {
            self.stars.fetch_add(1, Ordering::SeqCst);
        }

        async fn new_follow(&self, _follow: &Follow) {
            tokio::task::yield_now().await;
            self.follows.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn star() -> Star {
        Star {
            did: "did:plc:bob".to_string(),
            repo_at: AtUri::new("did:plc:alice", REPO_NSID, "r1"),
            rkey: "s1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_merged_waits_for_every_notifier() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let merged = MergedNotifier::new(vec![a.clone() as Arc<dyn Notifier>, b.clone()]);

        merged.new_star(&star()).await;
        merged
            .new_follow(&Follow {
                user_did: "did:plc:bob".to_string(),
                subject_did: "did:plc:alice".to_string(),
                rkey: "f1".to_string(),
            })
            .await;

        for n in [&a, &b] {
            assert_eq!(n.stars.load(Ordering::SeqCst), 1);
            assert_eq!(n.follows.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_logging_forwards() {
        let inner = Arc::new(Counting::default());
        let logging = LoggingNotifier::new(inner.clone());
        logging.new_star(&star()).await;
        // unhandled events fall through to the no-op default
        logging
            .new_pull(&Pull {
                pull_id: 1,
                owner_did: "did:plc:bob".to_string(),
                rkey: "p1".to_string(),
                repo_at: AtUri::new("did:plc:alice", REPO_NSID, "r1"),
                title: "t".to_string(),
                state: PullState::Open,
                created: Utc::now(),
                comments: Vec::new(),
            })
            .await;
        assert_eq!(inner.stars.load(Ordering::SeqCst), 1);
    }
}
