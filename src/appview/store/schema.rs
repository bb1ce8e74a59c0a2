pub const SCHEMA: &str = r#"
-- Repositories indexed from the network
CREATE TABLE IF NOT EXISTS repos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    name TEXT NOT NULL,
    rkey TEXT NOT NULL,
    at_uri TEXT NOT NULL UNIQUE,
    knot TEXT NOT NULL,
    vcs TEXT NOT NULL DEFAULT 'git',
    default_branch TEXT,
    description TEXT,
    topics TEXT NOT NULL DEFAULT '',   -- space separated
    created TEXT NOT NULL,
    UNIQUE(did, name)
);

CREATE TABLE IF NOT EXISTS collaborators (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_did TEXT NOT NULL,
    repo_at TEXT NOT NULL REFERENCES repos(at_uri) ON DELETE CASCADE,
    created TEXT NOT NULL,
    UNIQUE(subject_did, repo_at)
);

CREATE TABLE IF NOT EXISTS public_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    name TEXT NOT NULL,
    key TEXT NOT NULL,
    created TEXT NOT NULL,
    UNIQUE(did, name, key)
);

-- Verified email addresses, used to attribute commits to DIDs
CREATE TABLE IF NOT EXISTS emails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    address TEXT NOT NULL UNIQUE,
    verified INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS stars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    repo_at TEXT NOT NULL,
    rkey TEXT NOT NULL,
    UNIQUE(did, repo_at)
);

CREATE TABLE IF NOT EXISTS follows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_did TEXT NOT NULL,
    subject_did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    UNIQUE(user_did, subject_did)
);

CREATE TABLE IF NOT EXISTS issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    at_uri TEXT NOT NULL UNIQUE,
    repo_at TEXT NOT NULL REFERENCES repos(at_uri) ON DELETE CASCADE,
    issue_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    open INTEGER NOT NULL DEFAULT 1,
    created TEXT NOT NULL,
    UNIQUE(repo_at, issue_id)
);

CREATE TABLE IF NOT EXISTS issue_comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    issue_at TEXT NOT NULL REFERENCES issues(at_uri) ON DELETE CASCADE,
    reply_to TEXT,
    body TEXT NOT NULL,
    created TEXT NOT NULL,
    UNIQUE(did, rkey)
);

CREATE TABLE IF NOT EXISTS pulls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    repo_at TEXT NOT NULL REFERENCES repos(at_uri) ON DELETE CASCADE,
    pull_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'open',
    created TEXT NOT NULL,
    UNIQUE(repo_at, pull_id)
);

CREATE TABLE IF NOT EXISTS pull_comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_did TEXT NOT NULL,
    repo_at TEXT NOT NULL,
    pull_id INTEGER NOT NULL,
    body TEXT NOT NULL,
    created TEXT NOT NULL
);

-- Pijul discussions: an open set of changes plus a comment thread
CREATE TABLE IF NOT EXISTS discussions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    repo_at TEXT NOT NULL REFERENCES repos(at_uri) ON DELETE CASCADE,
    discussion_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    target_channel TEXT NOT NULL DEFAULT 'main',
    state INTEGER NOT NULL DEFAULT 1,   -- 0 closed, 1 open, 2 merged
    created TEXT NOT NULL,
    edited TEXT,
    UNIQUE(did, rkey),
    UNIQUE(repo_at, discussion_id)
);

CREATE TABLE IF NOT EXISTS repo_discussion_seqs (
    repo_at TEXT PRIMARY KEY,
    next_discussion_id INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS discussion_patches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    discussion_at TEXT NOT NULL,
    pushed_by_did TEXT NOT NULL,
    patch_hash TEXT NOT NULL,
    patch TEXT NOT NULL,
    added TEXT NOT NULL,
    removed TEXT,
    UNIQUE(discussion_at, patch_hash)
);

CREATE TABLE IF NOT EXISTS discussion_comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    discussion_at TEXT NOT NULL,
    reply_to TEXT,
    body TEXT NOT NULL,
    created TEXT NOT NULL,
    edited TEXT,
    deleted TEXT,
    UNIQUE(did, rkey)
);

CREATE TABLE IF NOT EXISTS discussion_subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    discussion_at TEXT NOT NULL,
    subscriber_did TEXT NOT NULL,
    created TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    UNIQUE(discussion_at, subscriber_did)
);

CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_did TEXT NOT NULL,
    actor_did TEXT NOT NULL,
    type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    read INTEGER NOT NULL DEFAULT 0,
    created TEXT NOT NULL,
    repo_id INTEGER,
    issue_id INTEGER,
    pull_id INTEGER
);

CREATE TABLE IF NOT EXISTS notification_preferences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_did TEXT NOT NULL UNIQUE,
    repo_starred INTEGER NOT NULL DEFAULT 1,
    issue_created INTEGER NOT NULL DEFAULT 1,
    issue_commented INTEGER NOT NULL DEFAULT 1,
    issue_closed INTEGER NOT NULL DEFAULT 1,
    pull_created INTEGER NOT NULL DEFAULT 1,
    pull_commented INTEGER NOT NULL DEFAULT 1,
    pull_merged INTEGER NOT NULL DEFAULT 1,
    followed INTEGER NOT NULL DEFAULT 1,
    user_mentioned INTEGER NOT NULL DEFAULT 1,
    email_notifications INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_discussions_repo ON discussions(repo_at, state);
CREATE INDEX IF NOT EXISTS idx_discussion_patches_at ON discussion_patches(discussion_at);
CREATE INDEX IF NOT EXISTS idx_discussion_comments_at ON discussion_comments(discussion_at);
CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_did, read);
"#;
