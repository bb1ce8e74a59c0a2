use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params, params_from_iter};

use super::schema::SCHEMA;
use super::{Page, Store};
use crate::error::{Error, Result};
use crate::orm::{Filter, format_datetime, parse_datetime, run_migration, where_clause};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_repos(&self, repo_ats: Vec<String>) -> Result<HashMap<String, Repo>> {
        let (clause, args) = where_clause(&[Filter::is_in("at_uri", repo_ats)]);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {REPO_COLUMNS} FROM repos{clause}"))?;
        let rows = stmt.query_map(params_from_iter(args), repo_from_row)?;

        let mut out = HashMap::new();
        for repo in rows {
            let repo = repo?;
            out.insert(repo.repo_at().to_string(), repo);
        }
        Ok(out)
    }

    fn load_patches(&self, discussion_ats: Vec<String>) -> Result<Vec<DiscussionPatch>> {
        let (clause, args) = where_clause(&[Filter::is_in("discussion_at", discussion_ats)]);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, discussion_at, pushed_by_did, patch_hash, patch, added, removed
             FROM discussion_patches{clause} ORDER BY added ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(DiscussionPatch {
                id: row.get(0)?,
                discussion_at: row.get(1)?,
                pushed_by_did: row.get(2)?,
                patch_hash: row.get(3)?,
                patch: row.get(4)?,
                added: parse_datetime(&row.get::<_, String>(5)?),
                removed: row.get::<_, Option<String>>(6)?.as_deref().map(parse_datetime),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn load_comments(&self, discussion_ats: Vec<String>) -> Result<Vec<DiscussionComment>> {
        let (clause, args) = where_clause(&[Filter::is_in("discussion_at", discussion_ats)]);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, did, rkey, discussion_at, reply_to, body, created, edited, deleted
             FROM discussion_comments{clause} ORDER BY created ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(DiscussionComment {
                id: row.get(0)?,
                did: row.get(1)?,
                rkey: row.get(2)?,
                discussion_at: row.get(3)?,
                reply_to: row.get(4)?,
                body: row.get(5)?,
                created: parse_datetime(&row.get::<_, String>(6)?),
                edited: row.get::<_, Option<String>>(7)?.as_deref().map(parse_datetime),
                deleted: row.get::<_, Option<String>>(8)?.as_deref().map(parse_datetime),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn load_issue_comments(&self, issue_ats: Vec<String>) -> Result<Vec<IssueComment>> {
        let (clause, args) = where_clause(&[Filter::is_in("issue_at", issue_ats)]);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, did, rkey, issue_at, reply_to, body, created
             FROM issue_comments{clause} ORDER BY created ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(IssueComment {
                id: row.get(0)?,
                did: row.get(1)?,
                rkey: row.get(2)?,
                issue_at: row.get(3)?,
                reply_to: row.get(4)?,
                body: row.get(5)?,
                created: parse_datetime(&row.get::<_, String>(6)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Attaches patches, comments and the repo; drops discussions whose repo is gone.
    fn hydrate_discussions(&self, mut discussions: Vec<Discussion>) -> Result<Vec<Discussion>> {
        if discussions.is_empty() {
            return Ok(discussions);
        }

        let ats: Vec<String> = discussions
            .iter()
            .map(|d| d.discussion_at().to_string())
            .collect();
        let repo_ats: Vec<String> = discussions.iter().map(|d| d.repo_at.to_string()).collect();

        let repos = self.load_repos(repo_ats)?;
        let patches = self.load_patches(ats.clone())?;
        let comments = self.load_comments(ats)?;

        for d in &mut discussions {
            let at = d.discussion_at();
            d.patches = patches
                .iter()
                .filter(|p| p.discussion_at == at)
                .cloned()
                .collect();
            d.comments = comments
                .iter()
                .filter(|c| c.discussion_at == at)
                .cloned()
                .collect();
            d.repo = repos.get(&d.repo_at.to_string()).cloned();
        }

        discussions.retain(|d| d.repo.is_some());
        Ok(discussions)
    }
}

const REPO_COLUMNS: &str =
    "id, did, name, rkey, knot, vcs, default_branch, description, topics, created";

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<Repo> {
    let topics: String = row.get(8)?;
    Ok(Repo {
        id: row.get(0)?,
        did: row.get(1)?,
        name: row.get(2)?,
        rkey: row.get(3)?,
        knot: row.get(4)?,
        vcs: row.get::<_, String>(5)?.parse().unwrap_or_default(),
        default_branch: row.get(6)?,
        description: row.get(7)?,
        topics: topics.split_whitespace().map(str::to_string).collect(),
        created: parse_datetime(&row.get::<_, String>(9)?),
    })
}

const DISCUSSION_COLUMNS: &str =
    "id, did, rkey, repo_at, discussion_id, title, body, target_channel, state, created, edited";

fn discussion_from_row(row: &Row<'_>) -> rusqlite::Result<Discussion> {
    Ok(Discussion {
        id: row.get(0)?,
        did: row.get(1)?,
        rkey: row.get(2)?,
        repo_at: row.get(3)?,
        discussion_id: row.get(4)?,
        title: row.get(5)?,
        body: row.get(6)?,
        target_channel: row.get(7)?,
        state: DiscussionState::from_i64(row.get(8)?).unwrap_or(DiscussionState::Open),
        created: parse_datetime(&row.get::<_, String>(9)?),
        edited: row.get::<_, Option<String>>(10)?.as_deref().map(parse_datetime),
        patches: Vec::new(),
        comments: Vec::new(),
        labels: Vec::new(),
        repo: None,
    })
}

impl ToSql for AtUri {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for AtUri {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

fn map_conflict(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::AlreadyExists
        }
        e => Error::from(e),
    }
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.execute_batch(SCHEMA)?;

        // Soft-deleted comments keep their last body out of band.
        run_migration(&mut conn, "add-deleted-body-to-discussion-comments", |tx| {
            tx.execute_batch("ALTER TABLE discussion_comments ADD COLUMN deleted_body TEXT")?;
            Ok(())
        })
    }

    // Repo operations

    fn create_repo(&self, repo: &Repo) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO repos (did, name, rkey, at_uri, knot, vcs, default_branch, description, topics, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                repo.did,
                repo.name,
                repo.rkey,
                repo.repo_at(),
                repo.knot,
                repo.vcs.as_str(),
                repo.default_branch,
                repo.description,
                repo.topics.join(" "),
                format_datetime(&repo.created),
            ],
        )
        .map_err(map_conflict)?;
        Ok(conn.last_insert_rowid())
    }

    fn get_repo(&self, filters: &[Filter]) -> Result<Option<Repo>> {
        let (clause, args) = where_clause(filters);
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {REPO_COLUMNS} FROM repos{clause} LIMIT 1"),
            params_from_iter(args),
            repo_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_repo_by_at(&self, repo_at: &AtUri) -> Result<Option<Repo>> {
        self.get_repo(&[Filter::eq("at_uri", repo_at.to_string())])
    }

    // Collaborators and keys

    fn add_collaborator(&self, collaborator: &Collaborator) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO collaborators (subject_did, repo_at, created) VALUES (?1, ?2, ?3)",
                params![
                    collaborator.subject_did,
                    collaborator.repo_at,
                    format_datetime(&collaborator.created),
                ],
            )
            .map_err(map_conflict)?;
        Ok(())
    }

    fn get_collaborators(&self, repo_at: &AtUri) -> Result<Vec<Collaborator>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT subject_did, repo_at, created FROM collaborators WHERE repo_at = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![repo_at], |row| {
            Ok(Collaborator {
                subject_did: row.get(0)?,
                repo_at: row.get(1)?,
                created: parse_datetime(&row.get::<_, String>(2)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn add_public_key(&self, key: &PublicKey) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO public_keys (did, name, key, created) VALUES (?1, ?2, ?3, ?4)",
            params![key.did, key.name, key.key, format_datetime(&key.created)],
        )?;
        Ok(())
    }

    fn get_public_keys(&self, did: &str) -> Result<Vec<PublicKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT did, name, key, created FROM public_keys WHERE did = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![did], |row| {
            Ok(PublicKey {
                did: row.get(0)?,
                name: row.get(1)?,
                key: row.get(2)?,
                created: parse_datetime(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Email operations

    fn add_email(&self, did: &str, address: &str, verified: bool) -> Result<()> {
        self.conn().execute(
            "INSERT INTO emails (did, address, verified) VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET did = excluded.did, verified = excluded.verified",
            params![did, address, verified],
        )?;
        Ok(())
    }

    fn get_email_to_did(&self, addresses: &[String]) -> Result<HashMap<String, String>> {
        let (clause, args) = where_clause(&[
            Filter::is_in("address", addresses.iter().cloned()),
            Filter::eq("verified", 1_i64),
        ]);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT address, did FROM emails{clause}"))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<std::result::Result<HashMap<_, _>, _>>()
            .map_err(Error::from)
    }

    // Issue operations

    fn create_issue(&self, issue: &Issue) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO issues (did, rkey, at_uri, repo_at, issue_id, title, body, open, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                issue.did,
                issue.rkey,
                issue.at_uri(),
                issue.repo.repo_at(),
                issue.issue_id,
                issue.title,
                issue.body,
                issue.open,
                format_datetime(&issue.created),
            ],
        )
        .map_err(map_conflict)?;
        Ok(conn.last_insert_rowid())
    }

    fn get_issues(&self, filters: &[Filter]) -> Result<Vec<Issue>> {
        let (clause, args) = where_clause(filters);
        let rows: Vec<(Issue, String)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT id, did, rkey, issue_id, title, body, open, created, repo_at
                 FROM issues{clause} ORDER BY created DESC"
            ))?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                let repo_at: String = row.get(8)?;
                Ok((
                    Issue {
                        id: row.get(0)?,
                        did: row.get(1)?,
                        rkey: row.get(2)?,
                        issue_id: row.get(3)?,
                        title: row.get(4)?,
                        body: row.get(5)?,
                        open: row.get(6)?,
                        created: parse_datetime(&row.get::<_, String>(7)?),
                        repo: placeholder_repo(),
                        comments: Vec::new(),
                    },
                    repo_at,
                ))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let repos = self.load_repos(rows.iter().map(|(_, at)| at.clone()).collect())?;
        let comments =
            self.load_issue_comments(rows.iter().map(|(i, _)| i.at_uri().to_string()).collect())?;

        let mut issues = Vec::with_capacity(rows.len());
        for (mut issue, repo_at) in rows {
            let Some(repo) = repos.get(&repo_at) else {
                continue;
            };
            issue.repo = repo.clone();
            let at = issue.at_uri();
            issue.comments = comments.iter().filter(|c| c.issue_at == at).cloned().collect();
            issues.push(issue);
        }
        Ok(issues)
    }

    fn add_issue_comment(&self, comment: &IssueComment) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO issue_comments (did, rkey, issue_at, reply_to, body, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                comment.did,
                comment.rkey,
                comment.issue_at,
                comment.reply_to,
                comment.body,
                format_datetime(&comment.created),
            ],
        )
        .map_err(map_conflict)?;
        Ok(conn.last_insert_rowid())
    }

    fn set_issue_open(&self, issue_at: &AtUri, open: bool) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE issues SET open = ?1 WHERE at_uri = ?2",
            params![open, issue_at],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    // Pull operations

    fn create_pull(&self, pull: &Pull) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO pulls (owner_did, rkey, repo_at, pull_id, title, state, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    pull.owner_did,
                    pull.rkey,
                    pull.repo_at,
                    pull.pull_id,
                    pull.title,
                    pull_state_str(pull.state),
                    format_datetime(&pull.created),
                ],
            )
            .map_err(map_conflict)?;
        Ok(())
    }

    fn get_pull(&self, repo_at: &AtUri, pull_id: i64) -> Result<Option<Pull>> {
        let conn = self.conn();
        let pull = conn
            .query_row(
                "SELECT owner_did, rkey, repo_at, pull_id, title, state, created
                 FROM pulls WHERE repo_at = ?1 AND pull_id = ?2",
                params![repo_at, pull_id],
                |row| {
                    Ok(Pull {
                        owner_did: row.get(0)?,
                        rkey: row.get(1)?,
                        repo_at: row.get(2)?,
                        pull_id: row.get(3)?,
                        title: row.get(4)?,
                        state: parse_pull_state(&row.get::<_, String>(5)?),
                        created: parse_datetime(&row.get::<_, String>(6)?),
                        comments: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut pull) = pull else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, owner_did, repo_at, pull_id, body, created
             FROM pull_comments WHERE repo_at = ?1 AND pull_id = ?2 ORDER BY created ASC",
        )?;
        let rows = stmt.query_map(params![repo_at, pull_id], |row| {
            Ok(PullComment {
                id: row.get(0)?,
                owner_did: row.get(1)?,
                repo_at: row.get(2)?,
                pull_id: row.get(3)?,
                body: row.get(4)?,
                created: parse_datetime(&row.get::<_, String>(5)?),
            })
        })?;
        pull.comments = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Some(pull))
    }

    fn add_pull_comment(&self, comment: &PullComment) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pull_comments (owner_did, repo_at, pull_id, body, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                comment.owner_did,
                comment.repo_at,
                comment.pull_id,
                comment.body,
                format_datetime(&comment.created),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // Discussion operations

    fn create_discussion(&self, discussion: &Discussion) -> Result<(i64, i64)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO repo_discussion_seqs (repo_at, next_discussion_id) VALUES (?1, 1)",
            params![discussion.repo_at],
        )?;
        let discussion_id: i64 = tx.query_row(
            "UPDATE repo_discussion_seqs
             SET next_discussion_id = next_discussion_id + 1
             WHERE repo_at = ?1
             RETURNING next_discussion_id - 1",
            params![discussion.repo_at],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO discussions (did, rkey, repo_at, discussion_id, title, body, target_channel, state, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                discussion.did,
                discussion.rkey,
                discussion.repo_at,
                discussion_id,
                discussion.title,
                discussion.body,
                discussion.target_channel,
                discussion.state.as_i64(),
                format_datetime(&discussion.created),
            ],
        )
        .map_err(map_conflict)?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT OR IGNORE INTO discussion_subscriptions (discussion_at, subscriber_did) VALUES (?1, ?2)",
            params![discussion.discussion_at(), discussion.did],
        )?;

        tx.commit()?;
        Ok((id, discussion_id))
    }

    fn get_discussions(&self, page: Page, filters: &[Filter]) -> Result<Vec<Discussion>> {
        let (clause, mut args) = where_clause(filters);
        args.push(Value::Integer(page.limit));
        args.push(Value::Integer(page.offset));

        let discussions = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {DISCUSSION_COLUMNS} FROM discussions{clause}
                 ORDER BY created DESC, id DESC LIMIT ? OFFSET ?"
            ))?;
            let rows = stmt.query_map(params_from_iter(args), discussion_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        self.hydrate_discussions(discussions)
    }

    fn get_discussion(&self, repo_at: &AtUri, discussion_id: i64) -> Result<Option<Discussion>> {
        let found = self.get_discussions(
            Page {
                offset: 0,
                limit: 1,
            },
            &[
                Filter::eq("repo_at", repo_at.to_string()),
                Filter::eq("discussion_id", discussion_id),
            ],
        )?;
        Ok(found.into_iter().next())
    }

    fn get_discussion_by_at(&self, discussion_at: &AtUri) -> Result<Option<Discussion>> {
        let found = self.get_discussions(
            Page {
                offset: 0,
                limit: 1,
            },
            &[
                Filter::eq("did", discussion_at.authority().to_string()),
                Filter::eq("rkey", discussion_at.rkey().to_string()),
            ],
        )?;
        Ok(found.into_iter().next())
    }

    fn count_discussions(&self, repo_at: &AtUri) -> Result<DiscussionCount> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT state, count(*) FROM discussions WHERE repo_at = ?1 GROUP BY state",
        )?;
        let rows = stmt.query_map(params![repo_at], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut count = DiscussionCount::default();
        for row in rows {
            let (state, n) = row?;
            match DiscussionState::from_i64(state) {
                Some(DiscussionState::Open) => count.open = n,
                Some(DiscussionState::Merged) => count.merged = n,
                Some(DiscussionState::Closed) => count.closed = n,
                None => {}
            }
        }
        Ok(count)
    }

    fn set_discussion_state(
        &self,
        discussion_at: &AtUri,
        from: DiscussionState,
        to: DiscussionState,
    ) -> Result<()> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE discussions SET state = ?1 WHERE did = ?2 AND rkey = ?3 AND state = ?4",
            params![
                to.as_i64(),
                discussion_at.authority(),
                discussion_at.rkey(),
                from.as_i64()
            ],
        )?;
        if rows > 0 {
            return Ok(());
        }

        let current: Option<i64> = conn
            .query_row(
                "SELECT state FROM discussions WHERE did = ?1 AND rkey = ?2",
                params![discussion_at.authority(), discussion_at.rkey()],
                |row| row.get(0),
            )
            .optional()?;
        match current.and_then(DiscussionState::from_i64) {
            Some(current) => Err(Error::InvalidState(format!(
                "discussion is {current}, not {from}"
            ))),
            None => Err(Error::NotFound),
        }
    }

    fn add_discussion_patch(&self, patch: &DiscussionPatch) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO discussion_patches (discussion_at, pushed_by_did, patch_hash, patch, added)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                patch.discussion_at,
                patch.pushed_by_did,
                patch.patch_hash,
                patch.patch,
                format_datetime(&patch.added),
            ],
        )
        .map_err(map_conflict)?;
        Ok(conn.last_insert_rowid())
    }

    fn remove_discussion_patch(&self, patch_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE discussion_patches SET removed = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), patch_id],
        )?;
        Ok(())
    }

    fn readd_discussion_patch(&self, patch_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE discussion_patches SET removed = NULL WHERE id = ?1",
            params![patch_id],
        )?;
        Ok(())
    }

    fn upsert_discussion_comment(&self, comment: &DiscussionComment) -> Result<i64> {
        let conn = self.conn();
        conn.query_row(
            "INSERT INTO discussion_comments (did, rkey, discussion_at, body, reply_to, created, edited)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
             ON CONFLICT(did, rkey) DO UPDATE SET
                discussion_at = excluded.discussion_at,
                body = excluded.body,
                reply_to = excluded.reply_to,
                edited = CASE
                    WHEN discussion_comments.discussion_at IS NOT excluded.discussion_at
                      OR discussion_comments.body IS NOT excluded.body
                      OR discussion_comments.reply_to IS NOT excluded.reply_to
                    THEN ?7
                    ELSE discussion_comments.edited
                END
             RETURNING id",
            params![
                comment.did,
                comment.rkey,
                comment.discussion_at,
                comment.body,
                comment.reply_to,
                format_datetime(&comment.created),
                format_datetime(&Utc::now()),
            ],
            |row| row.get(0),
        )
        .map_err(Error::from)
    }

    fn delete_discussion_comment(&self, filters: &[Filter]) -> Result<()> {
        let (clause, filter_args) = where_clause(filters);
        let mut args = vec![Value::Text(format_datetime(&Utc::now()))];
        args.extend(filter_args);

        self.conn().execute(
            &format!(
                "UPDATE discussion_comments
                 SET deleted_body = coalesce(deleted_body, body), body = '', deleted = ?{clause}"
            ),
            params_from_iter(args),
        )?;
        Ok(())
    }

    fn subscribe(&self, discussion_at: &AtUri, did: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO discussion_subscriptions (discussion_at, subscriber_did) VALUES (?1, ?2)",
            params![discussion_at, did],
        )?;
        Ok(())
    }

    fn unsubscribe(&self, discussion_at: &AtUri, did: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM discussion_subscriptions WHERE discussion_at = ?1 AND subscriber_did = ?2",
            params![discussion_at, did],
        )?;
        Ok(())
    }

    fn subscribers(&self, discussion_at: &AtUri) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT subscriber_did FROM discussion_subscriptions WHERE discussion_at = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![discussion_at], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Notification operations

    fn get_notification_preferences(
        &self,
        dids: &[String],
    ) -> Result<HashMap<String, NotificationPreferences>> {
        let (clause, args) = where_clause(&[Filter::is_in("user_did", dids.iter().cloned())]);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT user_did, repo_starred, issue_created, issue_commented, issue_closed,
                    pull_created, pull_commented, pull_merged, followed, user_mentioned,
                    email_notifications
             FROM notification_preferences{clause}"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(NotificationPreferences {
                user_did: row.get(0)?,
                repo_starred: row.get(1)?,
                issue_created: row.get(2)?,
                issue_commented: row.get(3)?,
                issue_closed: row.get(4)?,
                pull_created: row.get(5)?,
                pull_commented: row.get(6)?,
                pull_merged: row.get(7)?,
                followed: row.get(8)?,
                user_mentioned: row.get(9)?,
                email_notifications: row.get(10)?,
            })
        })?;

        let mut out = HashMap::new();
        for prefs in rows {
            let prefs = prefs?;
            out.insert(prefs.user_did.clone(), prefs);
        }
        Ok(out)
    }

    fn set_notification_preferences(&self, prefs: &NotificationPreferences) -> Result<()> {
        self.conn().execute(
            "INSERT INTO notification_preferences (
                user_did, repo_starred, issue_created, issue_commented, issue_closed,
                pull_created, pull_commented, pull_merged, followed, user_mentioned,
                email_notifications)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(user_did) DO UPDATE SET
                repo_starred = excluded.repo_starred,
                issue_created = excluded.issue_created,
                issue_commented = excluded.issue_commented,
                issue_closed = excluded.issue_closed,
                pull_created = excluded.pull_created,
                pull_commented = excluded.pull_commented,
                pull_merged = excluded.pull_merged,
                followed = excluded.followed,
                user_mentioned = excluded.user_mentioned,
                email_notifications = excluded.email_notifications",
            params![
                prefs.user_did,
                prefs.repo_starred,
                prefs.issue_created,
                prefs.issue_commented,
                prefs.issue_closed,
                prefs.pull_created,
                prefs.pull_commented,
                prefs.pull_merged,
                prefs.followed,
                prefs.user_mentioned,
                prefs.email_notifications,
            ],
        )?;
        Ok(())
    }

    fn create_notifications(&self, notifications: &[Notification]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO notifications (
                    recipient_did, actor_did, type, entity_type, entity_id, read, created,
                    repo_id, issue_id, pull_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for n in notifications {
                stmt.execute(params![
                    n.recipient_did,
                    n.actor_did,
                    n.kind.as_str(),
                    n.entity_type,
                    n.entity_id,
                    n.read,
                    format_datetime(&n.created),
                    n.repo_id,
                    n.issue_id,
                    n.pull_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_notifications(&self, recipient_did: &str) -> Result<Vec<Notification>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, recipient_did, actor_did, type, entity_type, entity_id, read, created,
                    repo_id, issue_id, pull_id
             FROM notifications WHERE recipient_did = ?1 ORDER BY created DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![recipient_did], |row| {
            let kind: String = row.get(3)?;
            Ok(Notification {
                id: row.get(0)?,
                recipient_did: row.get(1)?,
                actor_did: row.get(2)?,
                kind: kind
                    .parse()
                    .map_err(|e: Error| rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    ))?,
                entity_type: row.get(4)?,
                entity_id: row.get(5)?,
                read: row.get(6)?,
                created: parse_datetime(&row.get::<_, String>(7)?),
                repo_id: row.get(8)?,
                issue_id: row.get(9)?,
                pull_id: row.get(10)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

fn pull_state_str(state: PullState) -> &'static str {
    match state {
        PullState::Closed => "closed",
        PullState::Open => "open",
        PullState::Merged => "merged",
    }
}

fn parse_pull_state(s: &str) -> PullState {
    match s {
        "closed" => PullState::Closed,
        "merged" => PullState::Merged,
        _ => PullState::Open,
    }
}

/// Stand-in until the issue's repo row is joined.
fn placeholder_repo() -> Repo {
    Repo {
        id: 0,
        did: String::new(),
        name: String::new(),
        rkey: String::new(),
        knot: String::new(),
        vcs: VcsKind::default(),
        default_branch: None,
        description: None,
        topics: Vec::new(),
        created: DateTime::<Utc>::UNIX_EPOCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appview::store::testing::{new_store, pijul_repo};

    fn discussion(repo: &Repo, did: &str, rkey: &str, title: &str) -> Discussion {
        Discussion {
            id: 0,
            repo_at: repo.repo_at(),
            did: did.to_string(),
            rkey: rkey.to_string(),
            discussion_id: 0,
            title: title.to_string(),
            body: String::new(),
            target_channel: "main".to_string(),
            state: DiscussionState::Open,
            created: Utc::now(),
            edited: None,
            patches: Vec::new(),
            comments: Vec::new(),
            labels: Vec::new(),
            repo: None,
        }
    }

    #[test]
    fn test_initialize_creates_tables() {
        let (_temp, store) = new_store();
        // second run must be a no-op, including the migration
        store.initialize().unwrap();

        let conn = store.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "repos",
            "discussions",
            "repo_discussion_seqs",
            "discussion_patches",
            "discussion_comments",
            "discussion_subscriptions",
            "notifications",
            "notification_preferences",
            "migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_discussion_ids_are_per_repo() {
        let (_temp, store) = new_store();
        let a = pijul_repo(&store, "did:plc:alice", "a");
        let b = pijul_repo(&store, "did:plc:alice", "b");

        let (_, first) = store.create_discussion(&discussion(&a, "did:plc:bob", "r1", "one")).unwrap();
        let (_, second) = store.create_discussion(&discussion(&a, "did:plc:bob", "r2", "two")).unwrap();
        let (_, other) = store.create_discussion(&discussion(&b, "did:plc:bob", "r3", "three")).unwrap();
        assert_eq!((first, second, other), (1, 2, 1));

        let d = store.get_discussion(&a.repo_at(), 2).unwrap().unwrap();
        assert_eq!(d.title, "two");
        assert_eq!(d.repo.as_ref().unwrap().name, "a");
        assert_eq!(store.subscribers(&d.discussion_at()).unwrap(), vec!["did:plc:bob"]);
    }

    #[test]
    fn test_concurrent_creates_get_distinct_ids() {
        const N: usize = 16;
        let (_temp, store) = new_store();
        let repo = pijul_repo(&store, "did:plc:alice", "a");

        let mut ids: Vec<i64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..N)
                .map(|i| {
                    let (store, repo) = (&store, &repo);
                    s.spawn(move || {
                        let d = discussion(repo, "did:plc:bob", &format!("r{i}"), "t");
                        store.create_discussion(&d).unwrap().1
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        ids.sort_unstable();
        assert_eq!(ids, (1..=N as i64).collect::<Vec<_>>());
    }

    #[test]
    fn test_state_change_requires_expected_state() {
        let (_temp, store) = new_store();
        let repo = pijul_repo(&store, "did:plc:alice", "a");
        let d = discussion(&repo, "did:plc:bob", "r1", "one");
        store.create_discussion(&d).unwrap();
        let at = d.discussion_at();

        store
            .set_discussion_state(&at, DiscussionState::Open, DiscussionState::Merged)
            .unwrap();
        // a close decided against the stale open state must not undo the merge
        let err = store
            .set_discussion_state(&at, DiscussionState::Open, DiscussionState::Closed)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "{err}");
        let loaded = store.get_discussion_by_at(&at).unwrap().unwrap();
        assert_eq!(loaded.state, DiscussionState::Merged);

        let missing = AtUri::new("did:plc:bob", DISCUSSION_NSID, "nope");
        assert!(matches!(
            store.set_discussion_state(&missing, DiscussionState::Open, DiscussionState::Closed),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_duplicate_patch_is_conflict() {
        let (_temp, store) = new_store();
        let repo = pijul_repo(&store, "did:plc:alice", "a");
        let d = discussion(&repo, "did:plc:bob", "r1", "one");
        store.create_discussion(&d).unwrap();

        let patch = DiscussionPatch {
            id: 0,
            discussion_at: d.discussion_at(),
            pushed_by_did: "did:plc:bob".to_string(),
            patch_hash: "HASH1".to_string(),
            patch: "diff".to_string(),
            added: Utc::now(),
            removed: None,
        };
        let id = store.add_discussion_patch(&patch).unwrap();
        assert!(matches!(
            store.add_discussion_patch(&patch),
            Err(Error::AlreadyExists)
        ));

        store.remove_discussion_patch(id).unwrap();
        let loaded = store.get_discussion_by_at(&d.discussion_at()).unwrap().unwrap();
        assert!(loaded.active_patches().is_empty());

        store.readd_discussion_patch(id).unwrap();
        let loaded = store.get_discussion_by_at(&d.discussion_at()).unwrap().unwrap();
        assert_eq!(loaded.active_patches().len(), 1);
    }

    #[test]
    fn test_comment_upsert_marks_edited() {
        let (_temp, store) = new_store();
        let repo = pijul_repo(&store, "did:plc:alice", "a");
        let d = discussion(&repo, "did:plc:bob", "r1", "one");
        store.create_discussion(&d).unwrap();

        let mut comment = DiscussionComment {
            id: 0,
            did: "did:plc:carol".to_string(),
            rkey: "c1".to_string(),
            discussion_at: d.discussion_at(),
            reply_to: None,
            body: "first".to_string(),
            created: Utc::now(),
            edited: None,
            deleted: None,
        };
        let id = store.upsert_discussion_comment(&comment).unwrap();
        // identical upsert does not count as an edit
        assert_eq!(store.upsert_discussion_comment(&comment).unwrap(), id);
        let loaded = store.get_discussion_by_at(&d.discussion_at()).unwrap().unwrap();
        assert!(loaded.comments[0].edited.is_none());

        comment.body = "second".to_string();
        assert_eq!(store.upsert_discussion_comment(&comment).unwrap(), id);
        let loaded = store.get_discussion_by_at(&d.discussion_at()).unwrap().unwrap();
        assert_eq!(loaded.comments.len(), 1);
        assert_eq!(loaded.comments[0].body, "second");
        assert!(loaded.comments[0].edited.is_some());

        store
            .delete_discussion_comment(&[
                Filter::eq("did", "did:plc:carol".to_string()),
                Filter::eq("rkey", "c1".to_string()),
            ])
            .unwrap();
        let loaded = store.get_discussion_by_at(&d.discussion_at()).unwrap().unwrap();
        assert_eq!(loaded.comments[0].body, "");
        assert!(loaded.comments[0].deleted.is_some());

        let kept: String = store
            .conn()
            .query_row("SELECT deleted_body FROM discussion_comments WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert_eq!(kept, "second");
    }

    #[test]
    fn test_count_and_state_filter() {
        let (_temp, store) = new_store();
        let repo = pijul_repo(&store, "did:plc:alice", "a");
        for (i, rkey) in ["r1", "r2", "r3"].iter().enumerate() {
            store
                .create_discussion(&discussion(&repo, "did:plc:bob", rkey, &format!("d{i}")))
                .unwrap();
        }
        let closed = AtUri::new("did:plc:bob", DISCUSSION_NSID, "r2");
        store
            .set_discussion_state(&closed, DiscussionState::Open, DiscussionState::Closed)
            .unwrap();
        let merged = AtUri::new("did:plc:bob", DISCUSSION_NSID, "r3");
        store
            .set_discussion_state(&merged, DiscussionState::Open, DiscussionState::Merged)
            .unwrap();

        let count = store.count_discussions(&repo.repo_at()).unwrap();
        assert_eq!((count.open, count.closed, count.merged), (1, 1, 1));

        let open = store
            .get_discussions(
                Page::default(),
                &[Filter::eq("state", DiscussionState::Open.as_i64())],
            )
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].rkey, "r1");

        let page = store
            .get_discussions(Page { offset: 1, limit: 1 }, &[])
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn test_missing_repo_hides_discussion() {
        let (_temp, store) = new_store();
        let repo = pijul_repo(&store, "did:plc:alice", "a");
        let d = discussion(&repo, "did:plc:bob", "r1", "one");
        store.create_discussion(&d).unwrap();

        store
            .conn()
            .execute("DELETE FROM repos WHERE id = ?1", params![repo.id])
            .unwrap();
        // the foreign key cascade removes the discussion row too
        assert!(store.get_discussion_by_at(&d.discussion_at()).unwrap().is_none());
    }

    #[test]
    fn test_email_map_only_verified() {
        let (_temp, store) = new_store();
        store.add_email("did:plc:alice", "alice@example.com", true).unwrap();
        store.add_email("did:plc:bob", "bob@example.com", false).unwrap();

        let map = store
            .get_email_to_did(&["alice@example.com".to_string(), "bob@example.com".to_string()])
            .unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["alice@example.com"], "did:plc:alice");
    }

    #[test]
    fn test_notification_preferences_roundtrip() {
        let (_temp, store) = new_store();
        let mut prefs = NotificationPreferences::default_for("did:plc:alice");
        prefs.pull_merged = false;
        store.set_notification_preferences(&prefs).unwrap();

        let map = store
            .get_notification_preferences(&["did:plc:alice".to_string(), "did:plc:bob".to_string()])
            .unwrap();
        assert_eq!(map.len(), 1);
        assert!(!map["did:plc:alice"].pull_merged);
        assert!(map["did:plc:alice"].pull_created);
    }
}
