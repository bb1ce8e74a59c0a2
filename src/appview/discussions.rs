//! Discussions: a Pijul repository's equivalent of pull requests.
//!
//! A discussion collects patches (pijul changes already pushed to the knot)
//! plus a threaded conversation. Merging applies the active patches to the
//! target channel on the knot, in the order they were added.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::knot_client::{ChangeDetail, KnotClient, KnotClientError};
use super::notify::Notifier;
use super::store::{Page, Store};
use crate::orm::Filter;
use crate::rbac::{Enforcer, REPO_COLLABORATOR, REPO_OWNER, REPO_PUSH};
use crate::types::*;

pub const DEFAULT_TARGET_CHANNEL: &str = "main";

/// Listing page size for a repo's discussions.
pub const LIST_LIMIT: i64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum DiscussionError {
    #[error("discussions are only available for pijul repositories")]
    NotPijul,

    #[error("Discussion not found")]
    NotFound,

    #[error("Title is required")]
    TitleRequired,

    #[error("Cannot add patches to a closed or merged discussion")]
    NotOpen,

    #[error("Patch hash and content are required")]
    PatchRequired,

    #[error("This patch has already been added to the discussion")]
    DuplicatePatch,

    #[error(
        "Change not found in repository. Please ensure the change hash is correct and exists in the repo."
    )]
    ChangeNotFound(#[source] KnotClientError),

    #[error("cannot add patch: it depends on removed patch {0}")]
    DependsOnRemoved(String),

    #[error("cannot remove patch: patch {0} depends on it")]
    DependedOn(String),

    #[error("Patch not found")]
    PatchNotFound,

    #[error("Comment body is required")]
    BodyRequired,

    #[error("You don't have permission to {0}")]
    Forbidden(&'static str),

    #[error("cannot move a {from} discussion to {to}")]
    InvalidTransition {
        from: DiscussionState,
        to: DiscussionState,
    },

    #[error("No patches to merge")]
    NoPatches,

    #[error("Some patches failed to apply: {}", .0.join(", "))]
    ApplyFailed(Vec<String>),

    #[error("Failed to apply patches: {0}")]
    Knot(#[source] KnotClientError),

    #[error(transparent)]
    Store(#[from] crate::error::Error),
}

pub type Result<T> = std::result::Result<T, DiscussionError>;

/// First 12 characters of a change hash, as shown to users.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[derive(Debug, Clone, Default)]
pub struct NewDiscussion {
    pub title: String,
    pub body: String,
    pub target_channel: String,
}

pub struct Discussions {
    store: Arc<dyn Store>,
    enforcer: Arc<Enforcer>,
    knots: Arc<dyn KnotClient>,
    notifier: Arc<dyn Notifier>,
}

impl Discussions {
    pub fn new(
        store: Arc<dyn Store>,
        enforcer: Arc<Enforcer>,
        knots: Arc<dyn KnotClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            enforcer,
            knots,
            notifier,
        }
    }

    /// Holds `repo:push`, `repo:owner` or `repo:collaborator` on the repo.
    fn is_collaborator(&self, actor: &str, repo: &Repo) -> bool {
        match self
            .enforcer
            .permissions_in_repo(actor, &repo.knot, &repo.did_slash_repo())
        {
            Ok(roles) => roles
                .iter()
                .any(|r| r == REPO_PUSH || r == REPO_OWNER || r == REPO_COLLABORATOR),
            Err(e) => {
                error!(actor, repo = %repo.did_slash_repo(), error = %e, "failed to read permissions");
                false
            }
        }
    }

    /// Re-reads the discussion so patch checks see the latest rows.
    fn reload(&self, discussion: &Discussion) -> Result<Discussion> {
        self.store
            .get_discussion_by_at(&discussion.discussion_at())?
            .ok_or(DiscussionError::NotFound)
    }

    async fn change(&self, repo: &Repo, hash: &str) -> std::result::Result<ChangeDetail, KnotClientError> {
        self.knots
            .change_get(&repo.knot, &repo.did_slash_repo(), hash)
            .await
    }

    /// Discussions in `state` (open when unset) plus the per-state counts.
    pub fn list(
        &self,
        repo: &Repo,
        state: Option<DiscussionState>,
        offset: i64,
    ) -> Result<(Vec<Discussion>, DiscussionCount)> {
        if repo.vcs != VcsKind::Pijul {
            return Err(DiscussionError::NotPijul);
        }

        let repo_at = repo.repo_at();
        let state = state.unwrap_or(DiscussionState::Open);
        let discussions = self.store.get_discussions(
            Page {
                offset,
                limit: LIST_LIMIT,
            },
            &[
                Filter::eq("repo_at", repo_at.to_string()),
                Filter::eq("state", state.as_i64()),
            ],
        )?;

        let count = self.store.count_discussions(&repo_at).unwrap_or_else(|e| {
            error!(repo = %repo_at, error = %e, "failed to get discussion count");
            DiscussionCount::default()
        });
        Ok((discussions, count))
    }

    pub fn get(&self, repo: &Repo, discussion_id: i64) -> Result<Discussion> {
        self.store
            .get_discussion(&repo.repo_at(), discussion_id)?
            .ok_or(DiscussionError::NotFound)
    }

    pub async fn create(&self, repo: &Repo, actor: &str, input: NewDiscussion) -> Result<Discussion> {
        if repo.vcs != VcsKind::Pijul {
            info!(repo = %repo.did_slash_repo(), "discussions only available for pijul repos");
            return Err(DiscussionError::NotPijul);
        }
        if input.title.is_empty() {
            return Err(DiscussionError::TitleRequired);
        }

        let target_channel = if input.target_channel.is_empty() {
            DEFAULT_TARGET_CHANNEL.to_string()
        } else {
            input.target_channel
        };

        let mut discussion = Discussion {
            id: 0,
            repo_at: repo.repo_at(),
            did: actor.to_string(),
            rkey: tid(),
            discussion_id: 0,
            title: input.title,
            body: input.body,
            target_channel,
            state: DiscussionState::Open,
            created: Utc::now(),
            edited: None,
            patches: Vec::new(),
            comments: Vec::new(),
            labels: Vec::new(),
            repo: Some(repo.clone()),
        };

        let (id, discussion_id) = self.store.create_discussion(&discussion)?;
        discussion.id = id;
        discussion.discussion_id = discussion_id;
        info!(repo = %repo.did_slash_repo(), discussion_id, "discussion created");

        self.notifier.new_discussion(&discussion).await;
        Ok(discussion)
    }

    pub async fn add_patch(
        &self,
        repo: &Repo,
        discussion: &Discussion,
        actor: &str,
        patch_hash: &str,
        patch: &str,
    ) -> Result<DiscussionPatch> {
        let discussion = self.reload(discussion)?;
        if !discussion.is_open() {
            return Err(DiscussionError::NotOpen);
        }
        if patch_hash.is_empty() || patch.is_empty() {
            return Err(DiscussionError::PatchRequired);
        }
        if discussion.find_patch(patch_hash).is_some() {
            return Err(DiscussionError::DuplicatePatch);
        }

        let change = self.change(repo, patch_hash).await.map_err(|e| {
            info!(hash = patch_hash, error = %e, "change verification failed");
            DiscussionError::ChangeNotFound(e)
        })?;
        debug!(hash = patch_hash, message = %change.message, "change verified");

        check_add(&discussion, &change)?;

        let mut added = DiscussionPatch {
            id: 0,
            discussion_at: discussion.discussion_at(),
            pushed_by_did: actor.to_string(),
            patch_hash: patch_hash.to_string(),
            patch: patch.to_string(),
            added: Utc::now(),
            removed: None,
        };
        added.id = match self.store.add_discussion_patch(&added) {
            Ok(id) => id,
            Err(crate::error::Error::AlreadyExists) => return Err(DiscussionError::DuplicatePatch),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.store.subscribe(&added.discussion_at, actor) {
            warn!(actor, error = %e, "failed to subscribe patch author");
        }
        info!(patch_hash, pushed_by = actor, "patch added");
        Ok(added)
    }

    /// The patch's pusher or a repo collaborator.
    pub fn can_remove(&self, repo: &Repo, actor: &str, patch: &DiscussionPatch) -> bool {
        patch.pushed_by_did == actor || self.is_collaborator(actor, repo)
    }

    pub async fn remove_patch(
        &self,
        repo: &Repo,
        discussion: &Discussion,
        actor: &str,
        patch_id: i64,
    ) -> Result<()> {
        let discussion = self.reload(discussion)?;
        let patch = discussion
            .patches
            .iter()
            .find(|p| p.id == patch_id)
            .ok_or(DiscussionError::PatchNotFound)?;

        if !self.can_remove(repo, actor, patch) {
            return Err(DiscussionError::Forbidden("remove this patch"));
        }

        // Every other active patch is fetched to see whether it depends on
        // this one. A fetch failure does not block removal.
        for other in discussion.active_patches() {
            if other.patch_hash == patch.patch_hash {
                continue;
            }
            let change = match self.change(repo, &other.patch_hash).await {
                Ok(change) => change,
                Err(e) => {
                    warn!(hash = %other.patch_hash, error = %e, "failed to get change dependencies");
                    continue;
                }
            };
            if change.dependencies.iter().any(|d| *d == patch.patch_hash) {
                return Err(DiscussionError::DependedOn(
                    short_hash(&other.patch_hash).to_string(),
                ));
            }
        }

        self.store.remove_discussion_patch(patch_id)?;
        info!(patch_id, "patch removed");
        Ok(())
    }

    pub fn readd_patch(
        &self,
        repo: &Repo,
        discussion: &Discussion,
        actor: &str,
        patch_id: i64,
    ) -> Result<()> {
        let discussion = self.reload(discussion)?;
        let patch = discussion
            .patches
            .iter()
            .find(|p| p.id == patch_id)
            .ok_or(DiscussionError::PatchNotFound)?;

        if !self.can_remove(repo, actor, patch) {
            return Err(DiscussionError::Forbidden("re-add this patch"));
        }

        self.store.readd_discussion_patch(patch_id)?;
        info!(patch_id, "patch re-added");
        Ok(())
    }

    /// Posts a new comment as `actor` and subscribes them to the discussion.
    pub async fn comment(
        &self,
        discussion: &Discussion,
        actor: &str,
        body: &str,
        reply_to: Option<AtUri>,
        mentions: &[String],
    ) -> Result<DiscussionComment> {
        if body.is_empty() {
            return Err(DiscussionError::BodyRequired);
        }

        let mut comment = DiscussionComment {
            id: 0,
            did: actor.to_string(),
            rkey: tid(),
            discussion_at: discussion.discussion_at(),
            reply_to,
            body: body.to_string(),
            created: Utc::now(),
            edited: None,
            deleted: None,
        };
        comment.id = self.store.upsert_discussion_comment(&comment)?;

        if let Err(e) = self.store.subscribe(&comment.discussion_at, actor) {
            warn!(actor, error = %e, "failed to subscribe commenter");
        }
        info!(discussion_id = discussion.discussion_id, "comment added");

        self.notifier.new_discussion_comment(&comment, mentions).await;
        Ok(comment)
    }

    /// Stores a comment record as-is. Re-submitting the same `(did, rkey)`
    /// updates it and marks it edited when anything changed.
    pub fn upsert_comment(&self, comment: &DiscussionComment) -> Result<i64> {
        Ok(self.store.upsert_discussion_comment(comment)?)
    }

    /// Soft delete: the comment keeps its place in the thread with an empty body.
    pub fn delete_comment(&self, actor: &str, rkey: &str) -> Result<()> {
        self.store.delete_discussion_comment(&[
            Filter::eq("did", actor.to_string()),
            Filter::eq("rkey", rkey.to_string()),
        ])?;
        Ok(())
    }

    async fn transition(
        &self,
        repo: &Repo,
        discussion: &Discussion,
        actor: &str,
        to: DiscussionState,
    ) -> Result<()> {
        if !discussion.state.can_transition_to(to) {
            return Err(DiscussionError::InvalidTransition {
                from: discussion.state,
                to,
            });
        }

        self.store
            .set_discussion_state(&discussion.discussion_at(), discussion.state, to)?;
        info!(
            repo = %repo.did_slash_repo(),
            discussion_id = discussion.discussion_id,
            state = %to,
            "discussion state changed"
        );

        let mut updated = discussion.clone();
        updated.state = to;
        self.notifier.new_discussion_state(actor, &updated).await;
        Ok(())
    }

    /// The creator or a repo collaborator may close.
    pub async fn close(&self, repo: &Repo, discussion: &Discussion, actor: &str) -> Result<()> {
        if discussion.did != actor && !self.is_collaborator(actor, repo) {
            return Err(DiscussionError::Forbidden("close this discussion"));
        }
        self.transition(repo, discussion, actor, DiscussionState::Closed)
            .await
    }

    pub async fn reopen(&self, repo: &Repo, discussion: &Discussion, actor: &str) -> Result<()> {
        if discussion.did != actor && !self.is_collaborator(actor, repo) {
            return Err(DiscussionError::Forbidden("reopen this discussion"));
        }
        self.transition(repo, discussion, actor, DiscussionState::Open)
            .await
    }

    /// Applies every active patch to the target channel, then marks the
    /// discussion merged. Only collaborators may merge.
    pub async fn merge(&self, repo: &Repo, discussion: &Discussion, actor: &str) -> Result<()> {
        if !self.is_collaborator(actor, repo) {
            return Err(DiscussionError::Forbidden("merge this discussion"));
        }

        let discussion = self.reload(discussion)?;
        if !discussion.state.can_transition_to(DiscussionState::Merged) {
            return Err(DiscussionError::InvalidTransition {
                from: discussion.state,
                to: DiscussionState::Merged,
            });
        }

        let hashes: Vec<String> = discussion
            .active_patches()
            .into_iter()
            .map(|p| p.patch_hash.clone())
            .collect();
        if hashes.is_empty() {
            return Err(DiscussionError::NoPatches);
        }

        let outcome = self
            .knots
            .apply_changes(
                &repo.knot,
                &repo.did_slash_repo(),
                &discussion.target_channel,
                &hashes,
            )
            .await
            .map_err(|e| {
                error!(error = %e, "failed to apply changes");
                DiscussionError::Knot(e)
            })?;

        if !outcome.failed.is_empty() {
            let failed: Vec<String> = outcome
                .failed
                .iter()
                .map(|f| short_hash(&f.hash).to_string())
                .collect();
            warn!(failed = ?failed, "some patches failed to apply");
            return Err(DiscussionError::ApplyFailed(failed));
        }
        info!(count = outcome.applied.len(), "patches applied successfully");

        self.transition(repo, &discussion, actor, DiscussionState::Merged)
            .await
    }

    pub fn subscribe(&self, discussion: &Discussion, did: &str) -> Result<()> {
        Ok(self.store.subscribe(&discussion.discussion_at(), did)?)
    }

    pub fn unsubscribe(&self, discussion: &Discussion, did: &str) -> Result<()> {
        Ok(self.store.unsubscribe(&discussion.discussion_at(), did)?)
    }

    pub fn subscribers(&self, discussion: &Discussion) -> Result<Vec<String>> {
        Ok(self.store.subscribers(&discussion.discussion_at())?)
    }
}

/// Rejects a change that depends on a patch removed from this discussion.
fn check_add(discussion: &Discussion, change: &ChangeDetail) -> Result<()> {
    for dep in &change.dependencies {
        let removed = discussion
            .patches
            .iter()
            .any(|p| p.patch_hash == *dep && !p.is_active());
        if removed {
            return Err(DiscussionError::DependsOnRemoved(short_hash(dep).to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::appview::notify::NoopNotifier;
    use crate::appview::store::SqliteStore;
    use crate::appview::store::testing::{new_store, pijul_repo, repo as make_repo};
    use crate::vcs::{ApplyFailure, ApplyOutcome};
    use crate::xrpc::ErrorTag;

    const OWNER: &str = "did:plc:alice";
    const AUTHOR: &str = "did:plc:bob";
    const STRANGER: &str = "did:plc:mallory";

    const H1: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const H2: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
    const H3: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";

    /// Knot stand-in: known changes with their dependencies, and a record of
    /// every apply call.
    #[derive(Default)]
    struct FakeKnot {
        deps: HashMap<String, Vec<String>>,
        unreachable: Vec<String>,
        fail_apply: Vec<String>,
        applied: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl KnotClient for FakeKnot {
        async fn change_get(
            &self,
            _knot: &str,
            _repo: &str,
            hash: &str,
        ) -> std::result::Result<ChangeDetail, KnotClientError> {
            if self.unreachable.iter().any(|h| h == hash) {
                return Err(KnotClientError::Status(502));
            }
            match self.deps.get(hash) {
                Some(deps) => Ok(ChangeDetail {
                    hash: hash.to_string(),
                    dependencies: deps.clone(),
                    ..ChangeDetail::default()
                }),
                None => Err(KnotClientError::Xrpc {
                    status: 404,
                    tag: ErrorTag::ChangeNotFound,
                    message: "change not found".to_string(),
                }),
            }
        }

        async fn apply_changes(
            &self,
            _knot: &str,
            _repo: &str,
            channel: &str,
            changes: &[String],
        ) -> std::result::Result<ApplyOutcome, KnotClientError> {
            self.applied
                .lock()
                .unwrap()
                .push((channel.to_string(), changes.to_vec()));
            let (failed, applied): (Vec<_>, Vec<_>) = changes
                .iter()
                .cloned()
                .partition(|h| self.fail_apply.contains(h));
            Ok(ApplyOutcome {
                applied,
                failed: failed
                    .into_iter()
                    .map(|hash| ApplyFailure {
                        hash,
                        error: "conflict".to_string(),
                    })
                    .collect(),
            })
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        store: Arc<SqliteStore>,
        knot: Arc<FakeKnot>,
        discussions: Discussions,
        repo: Repo,
    }

    fn fixture(knot: FakeKnot) -> Fixture {
        let (temp, store) = new_store();
        let repo = pijul_repo(&store, OWNER, "proj");
        let store = Arc::new(store);

        let enforcer = Enforcer::in_memory().unwrap();
        enforcer
            .add_repo(OWNER, &repo.knot, &repo.did_slash_repo())
            .unwrap();

        let knot = Arc::new(knot);
        let discussions = Discussions::new(
            store.clone(),
            Arc::new(enforcer),
            knot.clone(),
            Arc::new(NoopNotifier),
        );
        Fixture {
            _temp: temp,
            store,
            knot,
            discussions,
            repo,
        }
    }

    fn knot_with(deps: &[(&str, &[&str])]) -> FakeKnot {
        FakeKnot {
            deps: deps
                .iter()
                .map(|(h, d)| (h.to_string(), d.iter().map(|s| s.to_string()).collect()))
                .collect(),
            ..FakeKnot::default()
        }
    }

    async fn open_discussion(fx: &Fixture) -> Discussion {
        fx.discussions
            .create(
                &fx.repo,
                AUTHOR,
                NewDiscussion {
                    title: "Add feature".to_string(),
                    ..NewDiscussion::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_defaults_and_validation() {
        let fx = fixture(FakeKnot::default());
        let d = open_discussion(&fx).await;
        assert_eq!(d.discussion_id, 1);
        assert_eq!(d.target_channel, "main");
        assert_eq!(d.state, DiscussionState::Open);
        assert_eq!(fx.discussions.subscribers(&d).unwrap(), vec![AUTHOR]);

        let err = fx
            .discussions
            .create(&fx.repo, AUTHOR, NewDiscussion::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Title is required");

        let git = make_repo(&fx.store, OWNER, "gitproj", VcsKind::Git);
        let err = fx
            .discussions
            .create(
                &git,
                AUTHOR,
                NewDiscussion {
                    title: "x".to_string(),
                    ..NewDiscussion::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiscussionError::NotPijul));
    }

    #[tokio::test]
    async fn test_add_patch_rules() {
        let fx = fixture(knot_with(&[(H1, &[]), (H2, &[H1])]));
        let d = open_discussion(&fx).await;

        let p1 = fx
            .discussions
            .add_patch(&fx.repo, &d, "did:plc:carol", H1, "diff1")
            .await
            .unwrap();
        assert!(fx.discussions.subscribers(&d).unwrap().contains(&"did:plc:carol".to_string()));

        let err = fx
            .discussions
            .add_patch(&fx.repo, &d, AUTHOR, H1, "diff1")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "This patch has already been added to the discussion");

        let err = fx
            .discussions
            .add_patch(&fx.repo, &d, AUTHOR, H3, "diff3")
            .await
            .unwrap_err();
        assert!(matches!(err, DiscussionError::ChangeNotFound(_)));

        // H2 depends on H1; once H1 is removed, H2 cannot be added
        fx.discussions
            .remove_patch(&fx.repo, &d, "did:plc:carol", p1.id)
            .await
            .unwrap();
        let err = fx
            .discussions
            .add_patch(&fx.repo, &d, AUTHOR, H2, "diff2")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot add patch: it depends on removed patch AAAAAAAAAAAA"
        );
    }

    #[tokio::test]
    async fn test_closed_discussion_rejects_patches() {
        let fx = fixture(knot_with(&[(H1, &[])]));
        let d = open_discussion(&fx).await;
        fx.discussions.close(&fx.repo, &d, AUTHOR).await.unwrap();

        let err = fx
            .discussions
            .add_patch(&fx.repo, &d, AUTHOR, H1, "diff1")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot add patches to a closed or merged discussion");
    }

    #[tokio::test]
    async fn test_remove_blocked_by_dependent() {
        let fx = fixture(knot_with(&[(H1, &[]), (H2, &[H1])]));
        let d = open_discussion(&fx).await;
        let p1 = fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H1, "d1").await.unwrap();
        fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H2, "d2").await.unwrap();

        let err = fx
            .discussions
            .remove_patch(&fx.repo, &d, AUTHOR, p1.id)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot remove patch: patch BBBBBBBBBBBB depends on it");

        let err = fx
            .discussions
            .remove_patch(&fx.repo, &d, STRANGER, p1.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscussionError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_remove_fails_open_when_knot_unreachable() {
        let fx = fixture(knot_with(&[(H1, &[]), (H2, &[H1])]));
        let d = open_discussion(&fx).await;
        let p1 = fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H1, "d1").await.unwrap();
        fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H2, "d2").await.unwrap();

        // Same repo, but a knot that cannot describe H2 any more.
        let blind = Discussions::new(
            fx.store.clone(),
            {
                let enforcer = Enforcer::in_memory().unwrap();
                enforcer
                    .add_repo(OWNER, &fx.repo.knot, &fx.repo.did_slash_repo())
                    .unwrap();
                Arc::new(enforcer)
            },
            Arc::new(FakeKnot {
                unreachable: vec![H2.to_string()],
                ..FakeKnot::default()
            }),
            Arc::new(NoopNotifier),
        );
        blind.remove_patch(&fx.repo, &d, OWNER, p1.id).await.unwrap();

        let reloaded = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        assert_eq!(reloaded.active_patches().len(), 1);

        blind.readd_patch(&fx.repo, &d, AUTHOR, p1.id).unwrap();
        let reloaded = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        assert_eq!(reloaded.active_patches().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_applies_in_order() {
        let fx = fixture(knot_with(&[(H1, &[]), (H2, &[H1])]));
        let d = open_discussion(&fx).await;

        let err = fx.discussions.merge(&fx.repo, &d, OWNER).await.unwrap_err();
        assert_eq!(err.to_string(), "No patches to merge");

        fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H1, "d1").await.unwrap();
        fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H2, "d2").await.unwrap();

        let err = fx.discussions.merge(&fx.repo, &d, AUTHOR).await.unwrap_err();
        assert!(matches!(err, DiscussionError::Forbidden("merge this discussion")));

        fx.discussions.merge(&fx.repo, &d, OWNER).await.unwrap();
        let applied = fx.knot.applied.lock().unwrap().clone();
        assert_eq!(
            applied,
            vec![("main".to_string(), vec![H1.to_string(), H2.to_string()])]
        );

        let merged = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        assert_eq!(merged.state, DiscussionState::Merged);

        // merged is terminal
        let err = fx.discussions.reopen(&fx.repo, &merged, OWNER).await.unwrap_err();
        assert!(matches!(err, DiscussionError::InvalidTransition { .. }));

        // `d` still says open; the store holds the merge
        let err = fx.discussions.close(&fx.repo, &d, OWNER).await.unwrap_err();
        assert!(matches!(
            err,
            DiscussionError::Store(crate::error::Error::InvalidState(_))
        ));
        let reloaded = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        assert_eq!(reloaded.state, DiscussionState::Merged);
    }

    #[tokio::test]
    async fn test_merge_reports_failed_hashes() {
        let mut knot = knot_with(&[(H1, &[]), (H2, &[])]);
        knot.fail_apply = vec![H2.to_string()];
        let fx = fixture(knot);
        let d = open_discussion(&fx).await;
        fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H1, "d1").await.unwrap();
        fx.discussions.add_patch(&fx.repo, &d, AUTHOR, H2, "d2").await.unwrap();

        let err = fx.discussions.merge(&fx.repo, &d, OWNER).await.unwrap_err();
        match err {
            DiscussionError::ApplyFailed(failed) => assert_eq!(failed, vec!["BBBBBBBBBBBB"]),
            other => panic!("unexpected error: {other}"),
        }
        let still_open = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        assert_eq!(still_open.state, DiscussionState::Open);
    }

    #[tokio::test]
    async fn test_close_permissions_and_listing() {
        let fx = fixture(FakeKnot::default());
        let d = open_discussion(&fx).await;

        let err = fx.discussions.close(&fx.repo, &d, STRANGER).await.unwrap_err();
        assert_eq!(err.to_string(), "You don't have permission to close this discussion");

        fx.discussions.close(&fx.repo, &d, OWNER).await.unwrap();
        let (open, count) = fx.discussions.list(&fx.repo, None, 0).unwrap();
        assert!(open.is_empty());
        assert_eq!((count.open, count.closed, count.merged), (0, 1, 0));

        let closed = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        fx.discussions.reopen(&fx.repo, &closed, AUTHOR).await.unwrap();
        let (open, _) = fx
            .discussions
            .list(&fx.repo, Some(DiscussionState::Open), 0)
            .unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_comments_thread_and_soft_delete() {
        let fx = fixture(FakeKnot::default());
        let d = open_discussion(&fx).await;

        let top = fx
            .discussions
            .comment(&d, "did:plc:carol", "looks good", None, &[])
            .await
            .unwrap();
        fx.discussions
            .comment(&d, "did:plc:dave", "agreed", Some(top.comment_at()), &[])
            .await
            .unwrap();
        let err = fx.discussions.comment(&d, "did:plc:dave", "", None, &[]).await.unwrap_err();
        assert!(matches!(err, DiscussionError::BodyRequired));

        let loaded = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        let threads = loaded.comment_list();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].replies.len(), 1);
        assert_eq!(
            loaded.participants(),
            vec![AUTHOR, "did:plc:carol", "did:plc:dave"]
        );

        fx.discussions.delete_comment("did:plc:carol", &top.rkey).unwrap();
        let loaded = fx.discussions.get(&fx.repo, d.discussion_id).unwrap();
        let deleted = loaded.comments.iter().find(|c| c.rkey == top.rkey).unwrap();
        assert!(deleted.body.is_empty());
        assert!(deleted.deleted.is_some());

        fx.discussions.unsubscribe(&d, "did:plc:dave").unwrap();
        assert!(!fx.discussions.subscribers(&d).unwrap().contains(&"did:plc:dave".to_string()));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash(H1), "AAAAAAAAAAAA");
        assert_eq!(short_hash("abc"), "abc");
    }
}
